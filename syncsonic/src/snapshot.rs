//! Pi-Status Snapshot: the derived `{connected, scanning}` record published after every
//! Done/Failed/adapter_lost transition and on an explicit query (§3, §4.6). Grounded on the
//! publish-on-state-change idiom of `homie-device/src/lib.rs`'s `HomieDevice`, generalized from a
//! Homie property tree to a single merged `0xF0` frame per §4.7's "Notification fan-out".

use serde_json::json;
use std::collections::BTreeSet;
use syncsonic_bluez::MacAddress;
use syncsonic_gatt::{Frame, Opcode};

/// `{connected: set of MAC, scanning: bool}` (§3). Invariant: a loopback exists for MAC `m` iff
/// `m` is a member of `connected` (§8).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Snapshot {
    pub connected: BTreeSet<MacAddress>,
    pub scanning: bool,
}

impl Snapshot {
    /// Project this snapshot into the merged `0xF0` frame. Since the Connection Service always
    /// recomputes the whole snapshot rather than patching individual fields, an aggregate change
    /// spanning both `connected` and `scanning` in the same tick still collapses into one frame.
    pub fn to_frame(&self) -> Frame {
        let connected: Vec<String> = self.connected.iter().map(ToString::to_string).collect();
        Frame::new(
            Opcode::Success,
            json!({
                "connected": connected,
                "scanning": self.scanning,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_frame() {
        let snapshot = Snapshot::default();
        let frame = snapshot.to_frame();
        assert_eq!(frame.opcode, Opcode::Success);
        assert_eq!(frame.payload["connected"], json!([]));
        assert_eq!(frame.payload["scanning"], json!(false));
    }

    #[test]
    fn connected_macs_are_stringified() {
        let mut snapshot = Snapshot::default();
        snapshot.connected.insert("AA:BB:CC:DD:EE:01".parse().unwrap());
        snapshot.scanning = true;
        let frame = snapshot.to_frame();
        assert_eq!(frame.payload["connected"], json!(["AA:BB:CC:DD:EE:01"]));
        assert_eq!(frame.payload["scanning"], json!(true));
    }
}
