//! Pairing Agent (C3): fulfils BlueZs agent contract for the "NoInputNoOutput" capability,
//! auto-confirming passkey exchanges and auto-authorizing service/key requests for known
//! speakers. The D-Bus object export is grounded on the `dbus-crossroads` wiring already built for
//! `syncsonic-gatt::server`; the `RegisterAgent`/capability-string call that activates it lives in
//! `syncsonic_bluez::BluetoothSession::register_agent`.

use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use log::{info, warn};
use std::sync::{Arc, Mutex};
use syncsonic_bluez::AdapterId;

/// The capability string passed to BlueZ's `AgentManager1.RegisterAgent` (§4.3): pairing requests
/// are auto-confirmed rather than surfaced for passkey entry.
pub const CAPABILITY: &str = "NoInputNoOutput";

/// Shared state the agent's D-Bus methods consult. `auto_authorize_unknown` and `reserved_adapter`
/// are read-only after start-up; `known` is refreshed by the caller (the Connection Service) as
/// speakers are registered.
pub struct Agent {
    reserved_adapter: AdapterId,
    auto_authorize_unknown: bool,
    known: Mutex<Vec<String>>,
}

impl Agent {
    pub fn new(reserved_adapter: AdapterId, auto_authorize_unknown: bool) -> Arc<Self> {
        Arc::new(Self {
            reserved_adapter,
            auto_authorize_unknown,
            known: Mutex::new(Vec::new()),
        })
    }

    /// Let the agent know a MAC is now a recognized speaker, so future authorization requests for
    /// it succeed even when `auto_authorize_unknown` is false.
    pub fn remember(&self, mac_canonical: String) {
        let mut known = self.known.lock().unwrap();
        if !known.contains(&mac_canonical) {
            known.push(mac_canonical);
        }
    }

    fn is_known(&self, mac_canonical: &str) -> bool {
        self.known.lock().unwrap().iter().any(|known| known == mac_canonical)
    }

    /// Whether a device object path belongs to the reserved (BLE) adapter rather than one of the
    /// assignable A2DP adapters. The agent only pairs with speakers (§4.3): a request against the
    /// reserved adapter's own remote (the phone) is rejected.
    fn originates_from_reserved_adapter(&self, device_path: &str) -> bool {
        device_path.starts_with(&self.reserved_adapter.object_path().to_string())
    }

    fn authorize(&self, device_path: &str) -> Result<(), dbus_crossroads::MethodErr> {
        if self.originates_from_reserved_adapter(device_path) {
            warn!("pairing agent rejected a request from the reserved BLE adapter's own remote");
            return Err(dbus_crossroads::MethodErr::failed(
                "agent only pairs with classic speakers",
            ));
        }
        if !self.auto_authorize_unknown {
            let mac = mac_from_device_path(device_path);
            if !self.is_known(&mac) {
                warn!("pairing agent rejected an unrecognized device {device_path}");
                return Err(dbus_crossroads::MethodErr::failed(
                    "device is not a known speaker",
                ));
            }
        }
        Ok(())
    }
}

/// BlueZ encodes a device's MAC into its object path as `dev_AA_BB_CC_DD_EE_FF`; this pulls that
/// back out and canonicalizes it the same way `MacAddress::to_string` would.
fn mac_from_device_path(device_path: &str) -> String {
    device_path
        .rsplit('/')
        .next()
        .and_then(|segment| segment.strip_prefix("dev_"))
        .map(|octets| octets.replace('_', ":"))
        .unwrap_or_default()
}

/// Register the `org.bluez.Agent1` interface and export it at `object_path` on `cr`. The caller is
/// responsible for calling `BluetoothSession::register_agent` afterwards so BlueZ actually routes
/// requests here.
pub fn export(cr: &mut Crossroads, object_path: &str, agent: Arc<Agent>) {
    let token = register_interface(cr);
    cr.insert(object_path, &[token], agent);
}

fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Agent>> {
    cr.register("org.bluez.Agent1", |ib: &mut IfaceBuilder<Arc<Agent>>| {
        ib.method("Release", (), (), |_ctx, _agent, ()| Ok(()));

        ib.method(
            "RequestPinCode",
            ("device",),
            ("pincode",),
            |_ctx, agent, (device,): (dbus::Path,)| {
                agent.authorize(&device)?;
                Ok(("0000".to_string(),))
            },
        );

        ib.method(
            "DisplayPinCode",
            ("device", "pincode"),
            (),
            |_ctx, _agent, (_device, _pincode): (dbus::Path, String)| Ok(()),
        );

        ib.method(
            "RequestPasskey",
            ("device",),
            ("passkey",),
            |_ctx, agent, (device,): (dbus::Path,)| {
                agent.authorize(&device)?;
                Ok((0u32,))
            },
        );

        ib.method(
            "DisplayPasskey",
            ("device", "passkey", "entered"),
            (),
            |_ctx, _agent, (_device, _passkey, _entered): (dbus::Path, u32, u16)| Ok(()),
        );

        ib.method(
            "RequestConfirmation",
            ("device", "passkey"),
            (),
            |_ctx, agent, (device, passkey): (dbus::Path, u32)| {
                agent.authorize(&device)?;
                info!("auto-confirming passkey {passkey} for {device}");
                Ok(())
            },
        );

        ib.method(
            "RequestAuthorization",
            ("device",),
            (),
            |_ctx, agent, (device,): (dbus::Path,)| agent.authorize(&device),
        );

        ib.method(
            "AuthorizeService",
            ("device", "uuid"),
            (),
            |_ctx, agent, (device, uuid): (dbus::Path, String)| {
                info!("auto-authorizing service {uuid} for {device}");
                agent.authorize(&device)
            },
        );

        ib.method("Cancel", (), (), |_ctx, _agent, ()| Ok(()));
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parsed_from_device_path() {
        assert_eq!(
            mac_from_device_path("/org/bluez/hci1/dev_AA_BB_CC_DD_EE_01"),
            "AA:BB:CC:DD:EE:01"
        );
    }

    #[test]
    fn reserved_adapter_remote_is_rejected() {
        let agent = Agent::new(AdapterId::new("/org/bluez/hci0"), true);
        let err = agent.authorize("/org/bluez/hci0/dev_11_22_33_44_55_66");
        assert!(err.is_err());
    }

    #[test]
    fn unknown_device_rejected_unless_auto_authorize_unknown() {
        let agent = Agent::new(AdapterId::new("/org/bluez/hci0"), false);
        assert!(agent.authorize("/org/bluez/hci1/dev_AA_BB_CC_DD_EE_01").is_err());
        agent.remember("AA:BB:CC:DD:EE:01".to_string());
        assert!(agent.authorize("/org/bluez/hci1/dev_AA_BB_CC_DD_EE_01").is_ok());
    }

    #[test]
    fn auto_authorize_unknown_skips_known_check() {
        let agent = Agent::new(AdapterId::new("/org/bluez/hci0"), true);
        assert!(agent.authorize("/org/bluez/hci1/dev_AA_BB_CC_DD_EE_01").is_ok());
    }
}
