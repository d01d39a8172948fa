use std::{io, path::PathBuf};

use thiserror::Error;

use crate::hooks::HookPoint;

fn errno_message(errno: &i32) -> io::Error {
    io::Error::from_raw_os_error(*errno)
}

/// Failure reported by a backing table operation, carrying the positive errno.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("table operation failed: {}", errno_message(.0))]
pub struct TableError(pub i32);

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("failed to get program from {}: {source}", .path.display())]
    ProgramUnavailable { path: PathBuf, source: io::Error },
    #[error("program {} attach to {hook:?} failed: {source}", .path.display())]
    AttachRejected {
        path: PathBuf,
        hook: HookPoint,
        source: io::Error,
    },
}

/// Initialization failures. All of them stop startup; only
/// [`InitError::VerificationInconsistency`] must abort the process outright.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{0}")]
    PlatformUnsupported(&'static str),
    #[error(transparent)]
    Attach(#[from] AttachError),
    #[error("{hook:?} reported attached but query found no program")]
    VerificationInconsistency { hook: HookPoint },
    #[error("failed to open map {name}: {source}")]
    Maps {
        name: &'static str,
        source: aya::maps::MapError,
    },
}

impl InitError {
    pub fn is_fatal_abort(&self) -> bool {
        matches!(self, InitError::VerificationInconsistency { .. })
    }
}

/// Per-request tagging failures, each mapped onto a negative errno.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum TagError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("unsupported socket family {0}")]
    FamilyUnsupported(i32),
    #[error("unsupported socket protocol {0}")]
    ProtocolUnsupported(i32),
    #[error("too many stats entries (total {total}, uid {uid} count {per_uid})")]
    QuotaExceeded { uid: u32, total: u32, per_uid: u32 },
    #[error("unknown configuration value {0}")]
    UnknownConfiguration(u32),
    #[error("socket lookup failed: {}", errno_message(.0))]
    Lookup(i32),
    #[error(transparent)]
    Table(#[from] TableError),
}

impl TagError {
    /// Negative POSIX error code reported to callers.
    pub fn errno(&self) -> i32 {
        let code = match self {
            TagError::PermissionDenied => libc::EPERM,
            TagError::FamilyUnsupported(_) => libc::EAFNOSUPPORT,
            TagError::ProtocolUnsupported(_) => libc::EPROTONOSUPPORT,
            TagError::QuotaExceeded { .. } => libc::EMFILE,
            TagError::UnknownConfiguration(_) => libc::EINVAL,
            TagError::Lookup(errno) => *errno,
            TagError::Table(TableError(errno)) => *errno,
        };
        -code
    }

    pub(crate) fn lookup(err: &io::Error) -> Self {
        TagError::Lookup(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_is_negative_posix_code() {
        assert_eq!(TagError::PermissionDenied.errno(), -libc::EPERM);
        assert_eq!(
            TagError::QuotaExceeded {
                uid: 1,
                total: 2,
                per_uid: 3
            }
            .errno(),
            -libc::EMFILE
        );
        assert_eq!(TagError::Table(TableError(libc::ENOSPC)).errno(), -libc::ENOSPC);
        assert_eq!(TagError::UnknownConfiguration(7).errno(), -libc::EINVAL);
    }

    #[test]
    fn only_verification_inconsistency_aborts() {
        let err = InitError::VerificationInconsistency {
            hook: HookPoint::InetEgress,
        };
        assert!(err.is_fatal_abort());
        assert!(!InitError::PlatformUnsupported("nope").is_fatal_abort());
    }
}
