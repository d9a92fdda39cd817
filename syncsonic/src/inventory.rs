//! Bus & Adapter Inventory (C1): enumerates local Bluetooth controllers, classifies them as the
//! single reserved-for-BLE adapter or an assignable-for-A2DP one, and tracks which speaker (if
//! any) currently owns each assignable adapter. Grounded on the adapter-enumeration loop used to
//! build up an adapter list in `other_examples/.../bluetooth_manager.rs`'s `BluetoothInterface`,
//! generalized to the reserved/assignable split §4.1 requires.

use std::collections::HashMap;
use syncsonic_bluez::{AdapterId, AdapterInfo, BluetoothSession, MacAddress};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("no Bluetooth adapters were found")]
    NoAdapters,
    #[error(
        "reserved adapter {0:?} was requested but is not present; the daemon refuses to start"
    )]
    ReservedAdapterMissing(String),
    #[error(transparent)]
    Bluetooth(#[from] syncsonic_bluez::BluetoothError),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AdapterRole {
    ReservedForBle,
    AssignableForA2dp,
}

#[derive(Clone, Debug)]
struct AdapterRecord {
    info: AdapterInfo,
    role: AdapterRole,
    /// Busy = assigned to a speaker, or BlueZ is mid pairing/connecting on it.
    assigned: Option<MacAddress>,
    available: bool,
}

/// The adapter inventory. Exclusively owns adapter records (§5); the current adapter->speaker
/// assignment is mutated only by the Connection Service (C6), through [`Inventory::assign`] and
/// [`Inventory::release`], each guarded by the caller's own per-adapter cooperative lock.
pub struct Inventory {
    reserved: AdapterId,
    adapters: HashMap<AdapterId, AdapterRecord>,
}

impl Inventory {
    /// Enumerate every adapter on the bus and classify them. `reserved_adapter` is the
    /// configured/env-provided short name or alias (§4.1); if absent, the lowest-indexed adapter
    /// is treated as reserved, matching the external naming helper's convention that the onboard
    /// UART-attached controller always enumerates first (see DESIGN.md).
    pub async fn discover(
        session: &BluetoothSession,
        reserved_adapter: Option<&str>,
    ) -> Result<Self, InventoryError> {
        let mut infos = session.get_adapters().await?;
        if infos.is_empty() {
            return Err(InventoryError::NoAdapters);
        }
        infos.sort_by(|a, b| a.short_name().cmp(b.short_name()));

        let reserved_index = match reserved_adapter {
            Some(name) => infos
                .iter()
                .position(|info| info.short_name() == name || info.alias == name)
                .ok_or_else(|| InventoryError::ReservedAdapterMissing(name.to_string()))?,
            None => 0,
        };

        let mut adapters = HashMap::new();
        let reserved = infos[reserved_index].id.clone();
        for (index, info) in infos.into_iter().enumerate() {
            let role = if index == reserved_index {
                AdapterRole::ReservedForBle
            } else {
                AdapterRole::AssignableForA2dp
            };
            adapters.insert(
                info.id.clone(),
                AdapterRecord {
                    available: true,
                    assigned: None,
                    role,
                    info,
                },
            );
        }

        Ok(Self { reserved, adapters })
    }

    /// The adapter exclusively used to advertise the GATT service; never returned by
    /// [`Inventory::free_adapter`].
    pub fn reserved_adapter(&self) -> &AdapterId {
        &self.reserved
    }

    pub fn list_adapters(&self) -> Vec<AdapterInfo> {
        self.adapters.values().map(|record| record.info.clone()).collect()
    }

    /// Any assignable adapter that is powered on, available, and not already assigned to a
    /// speaker. Ties broken by lowest stable index (§4.1), which `short_name` sorts on naturally
    /// (`hci0` < `hci1` < ...).
    pub fn free_adapter(&self) -> Option<AdapterId> {
        let mut candidates: Vec<&AdapterRecord> = self
            .adapters
            .values()
            .filter(|record| {
                record.role == AdapterRole::AssignableForA2dp
                    && record.available
                    && record.info.powered
                    && record.assigned.is_none()
            })
            .collect();
        candidates.sort_by(|a, b| a.info.short_name().cmp(b.info.short_name()));
        candidates.first().map(|record| record.info.id.clone())
    }

    /// Record that `adapter` now holds `mac`'s A2DP connection. Never call this for the reserved
    /// adapter; callers allocate only from [`Inventory::free_adapter`].
    pub fn assign(&mut self, adapter: &AdapterId, mac: MacAddress) {
        if let Some(record) = self.adapters.get_mut(adapter) {
            record.assigned = Some(mac);
        }
    }

    /// Release whatever speaker `adapter` was holding, if any.
    pub fn release(&mut self, adapter: &AdapterId) {
        if let Some(record) = self.adapters.get_mut(adapter) {
            record.assigned = None;
        }
    }

    pub fn assigned_speaker(&self, adapter: &AdapterId) -> Option<MacAddress> {
        self.adapters.get(adapter).and_then(|record| record.assigned)
    }

    /// Apply an inbound `Powered`/`Discovering` property change.
    pub fn set_powered(&mut self, adapter: &AdapterId, powered: bool) {
        if let Some(record) = self.adapters.get_mut(adapter) {
            record.info.powered = powered;
        }
    }

    pub fn set_discovering(&mut self, adapter: &AdapterId, discovering: bool) {
        if let Some(record) = self.adapters.get_mut(adapter) {
            record.info.discovering = discovering;
        }
    }

    /// Mark `adapter` unavailable (it disappeared from the bus) and return the speaker it was
    /// holding, if any, so the caller (C6) can abort that speaker's FSM with `adapter_lost`.
    pub fn mark_unavailable(&mut self, adapter: &AdapterId) -> Option<MacAddress> {
        let record = self.adapters.get_mut(adapter)?;
        record.available = false;
        record.assigned.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, role: AdapterRole, powered: bool) -> (AdapterId, AdapterRecord) {
        let id = AdapterId::new(id);
        (
            id.clone(),
            AdapterRecord {
                info: AdapterInfo {
                    id,
                    mac_address: "00:11:22:33:44:55".parse().unwrap(),
                    address_type: syncsonic_bluez::AddressType::Public,
                    name: "name".to_string(),
                    alias: "name".to_string(),
                    powered,
                    discovering: false,
                },
                role,
                assigned: None,
                available: true,
            },
        )
    }

    fn inventory_fixture() -> Inventory {
        let mut adapters = HashMap::new();
        let (hci0, rec0) = record("/org/bluez/hci0", AdapterRole::ReservedForBle, true);
        let (hci1, rec1) = record("/org/bluez/hci1", AdapterRole::AssignableForA2dp, true);
        let (hci2, rec2) = record("/org/bluez/hci2", AdapterRole::AssignableForA2dp, true);
        adapters.insert(hci0.clone(), rec0);
        adapters.insert(hci1, rec1);
        adapters.insert(hci2, rec2);
        Inventory {
            reserved: hci0,
            adapters,
        }
    }

    #[test]
    fn free_adapter_never_returns_reserved() {
        let inventory = inventory_fixture();
        let free = inventory.free_adapter().unwrap();
        assert_ne!(&free, inventory.reserved_adapter());
    }

    #[test]
    fn free_adapter_tie_breaks_on_lowest_index() {
        let inventory = inventory_fixture();
        assert_eq!(inventory.free_adapter().unwrap(), AdapterId::new("/org/bluez/hci1"));
    }

    #[test]
    fn assigned_adapter_is_not_free() {
        let mut inventory = inventory_fixture();
        let adapter = AdapterId::new("/org/bluez/hci1");
        inventory.assign(&adapter, "AA:BB:CC:DD:EE:01".parse().unwrap());
        assert_eq!(inventory.free_adapter().unwrap(), AdapterId::new("/org/bluez/hci2"));
    }

    #[test]
    fn no_free_adapter_when_all_assigned() {
        let mut inventory = inventory_fixture();
        inventory.assign(
            &AdapterId::new("/org/bluez/hci1"),
            "AA:BB:CC:DD:EE:01".parse().unwrap(),
        );
        inventory.assign(
            &AdapterId::new("/org/bluez/hci2"),
            "AA:BB:CC:DD:EE:02".parse().unwrap(),
        );
        assert!(inventory.free_adapter().is_none());
    }

    #[test]
    fn mark_unavailable_returns_held_speaker() {
        let mut inventory = inventory_fixture();
        let adapter = AdapterId::new("/org/bluez/hci1");
        let mac: MacAddress = "AA:BB:CC:DD:EE:01".parse().unwrap();
        inventory.assign(&adapter, mac);
        assert_eq!(inventory.mark_unavailable(&adapter), Some(mac));
        assert_ne!(inventory.free_adapter(), Some(adapter));
    }
}
