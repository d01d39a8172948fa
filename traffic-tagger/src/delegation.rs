use log::warn;
use traffic_tagger_common::PERMISSION_UPDATE_DEVICE_STATS;

use crate::tables::Table;

/// Width of the uid block each user profile owns.
pub const PER_USER_RANGE: u32 = 100_000;

pub const AID_ROOT: u32 = 0;
pub const AID_SYSTEM: u32 = 1000;
/// Reserved for the 464xlat translator, which charges its own traffic.
pub const AID_CLAT: u32 = 1029;
pub const AID_DNS: u32 = 1051;

const TRUSTED_APP_IDS: [AppId; 3] = [AppId(AID_ROOT), AppId(AID_SYSTEM), AppId(AID_DNS)];

pub type PermissionTable = dyn Table<u32, u8>;

/// App identity behind a uid. Kept distinct from raw uids so the two are
/// never mixed up when keying the permission map.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct AppId(pub u32);

/// Every user profile's copy of an app maps to the same id. Many uids share
/// one app id, so this cannot be inverted.
pub fn app_id(uid: u32) -> AppId {
    AppId(uid % PER_USER_RANGE)
}

/// Whether `caller_uid` may charge traffic to a uid other than its own.
pub fn may_charge_others(permissions: &PermissionTable, caller_uid: u32) -> bool {
    let app = app_id(caller_uid);
    match permissions.get(&app.0) {
        Ok(Some(bits)) if bits & PERMISSION_UPDATE_DEVICE_STATS != 0 => return true,
        Ok(_) => {}
        Err(err) => warn!("permission lookup for app {} failed: {err}", app.0),
    }
    TRUSTED_APP_IDS.contains(&app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::MemoryTable;

    #[test]
    fn app_id_folds_user_profiles() {
        assert_eq!(app_id(10_123), AppId(10_123));
        assert_eq!(app_id(1_010_123), AppId(10_123));
        assert_eq!(app_id(PER_USER_RANGE + AID_SYSTEM), AppId(AID_SYSTEM));
    }

    #[test]
    fn permission_bit_grants_delegation() {
        let table = MemoryTable::<u32, u8>::with_capacity(8);
        table
            .upsert(&10_050, &PERMISSION_UPDATE_DEVICE_STATS)
            .unwrap();
        assert!(may_charge_others(&table, 10_050));
        // Secondary user copy of the same app.
        assert!(may_charge_others(&table, 1_010_050));
    }

    #[test]
    fn other_bits_do_not_grant_delegation() {
        let table = MemoryTable::<u32, u8>::with_capacity(8);
        table.upsert(&5000, &(1 << 2)).unwrap();
        assert!(!may_charge_others(&table, 5000));
    }

    #[test]
    fn trusted_identities_need_no_permission_entry() {
        let table = MemoryTable::<u32, u8>::with_capacity(8);
        for uid in [AID_ROOT, AID_SYSTEM, AID_DNS, PER_USER_RANGE + AID_DNS] {
            assert!(may_charge_others(&table, uid), "uid {uid}");
        }
        assert!(!may_charge_others(&table, AID_CLAT));
        assert!(!may_charge_others(&table, 5000));
    }
}
