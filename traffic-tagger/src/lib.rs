//! Socket traffic attribution: negotiates which cgroup hooks the platform can
//! rely on, then charges sockets to (uid, tag) pairs under per-uid and total
//! quotas.

pub mod counters;
pub mod delegation;
pub mod error;
pub mod feature_matrix;
pub mod hooks;
pub mod init;
pub mod kernel;
pub mod sockets;
pub mod tables;
pub mod tagger;

pub use error::{AttachError, InitError, TableError, TagError};
pub use tagger::{QuotaLimits, Tagger};
