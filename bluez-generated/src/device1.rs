// Hand-maintained in the style of `dbus-codegen-rust --file=specs/org.bluez.Device1.xml
// --interfaces=org.bluez.Device1 --client=nonblock --methodtype=none --prop-newtype`,
// see https://github.com/diwic/dbus-rs
#[allow(unused_imports)]
use dbus::arg::{self, PropMap, RefArg, Variant};
use dbus::nonblock;
use std::collections::HashMap;

pub const ORG_BLUEZ_DEVICE1_NAME: &str = "org.bluez.Device1";

pub trait OrgBluezDevice1 {
    fn connect(&self) -> nonblock::MethodReply<()>;
    fn disconnect(&self) -> nonblock::MethodReply<()>;
    fn connect_profile(&self, uuid: &str) -> nonblock::MethodReply<()>;
    fn disconnect_profile(&self, uuid: &str) -> nonblock::MethodReply<()>;
    fn pair(&self) -> nonblock::MethodReply<()>;
    fn cancel_pairing(&self) -> nonblock::MethodReply<()>;

    fn address(&self) -> nonblock::MethodReply<String>;
    fn address_type(&self) -> nonblock::MethodReply<String>;
    fn name(&self) -> nonblock::MethodReply<String>;
    fn adapter(&self) -> nonblock::MethodReply<dbus::Path<'static>>;
    fn paired(&self) -> nonblock::MethodReply<bool>;
    fn connected(&self) -> nonblock::MethodReply<bool>;
    fn trusted(&self) -> nonblock::MethodReply<bool>;
    fn set_trusted(&self, value: bool) -> nonblock::MethodReply<()>;
    fn blocked(&self) -> nonblock::MethodReply<bool>;
    fn set_blocked(&self, value: bool) -> nonblock::MethodReply<()>;
    fn rssi(&self) -> nonblock::MethodReply<i16>;
    fn uuids(&self) -> nonblock::MethodReply<Vec<String>>;
    fn services_resolved(&self) -> nonblock::MethodReply<bool>;
}

impl<'a, T: nonblock::NonblockReply, C: ::std::ops::Deref<Target = T>> OrgBluezDevice1
    for nonblock::Proxy<'a, C>
{
    fn connect(&self) -> nonblock::MethodReply<()> {
        self.method_call(ORG_BLUEZ_DEVICE1_NAME, "Connect", ())
    }

    fn disconnect(&self) -> nonblock::MethodReply<()> {
        self.method_call(ORG_BLUEZ_DEVICE1_NAME, "Disconnect", ())
    }

    fn connect_profile(&self, uuid: &str) -> nonblock::MethodReply<()> {
        self.method_call(ORG_BLUEZ_DEVICE1_NAME, "ConnectProfile", (uuid,))
    }

    fn disconnect_profile(&self, uuid: &str) -> nonblock::MethodReply<()> {
        self.method_call(ORG_BLUEZ_DEVICE1_NAME, "DisconnectProfile", (uuid,))
    }

    fn pair(&self) -> nonblock::MethodReply<()> {
        self.method_call(ORG_BLUEZ_DEVICE1_NAME, "Pair", ())
    }

    fn cancel_pairing(&self) -> nonblock::MethodReply<()> {
        self.method_call(ORG_BLUEZ_DEVICE1_NAME, "CancelPairing", ())
    }

    fn address(&self) -> nonblock::MethodReply<String> {
        self.get(ORG_BLUEZ_DEVICE1_NAME, "Address")
    }

    fn address_type(&self) -> nonblock::MethodReply<String> {
        self.get(ORG_BLUEZ_DEVICE1_NAME, "AddressType")
    }

    fn name(&self) -> nonblock::MethodReply<String> {
        self.get(ORG_BLUEZ_DEVICE1_NAME, "Name")
    }

    fn adapter(&self) -> nonblock::MethodReply<dbus::Path<'static>> {
        self.get(ORG_BLUEZ_DEVICE1_NAME, "Adapter")
    }

    fn paired(&self) -> nonblock::MethodReply<bool> {
        self.get(ORG_BLUEZ_DEVICE1_NAME, "Paired")
    }

    fn connected(&self) -> nonblock::MethodReply<bool> {
        self.get(ORG_BLUEZ_DEVICE1_NAME, "Connected")
    }

    fn trusted(&self) -> nonblock::MethodReply<bool> {
        self.get(ORG_BLUEZ_DEVICE1_NAME, "Trusted")
    }

    fn set_trusted(&self, value: bool) -> nonblock::MethodReply<()> {
        self.set(ORG_BLUEZ_DEVICE1_NAME, "Trusted", value)
    }

    fn blocked(&self) -> nonblock::MethodReply<bool> {
        self.get(ORG_BLUEZ_DEVICE1_NAME, "Blocked")
    }

    fn set_blocked(&self, value: bool) -> nonblock::MethodReply<()> {
        self.set(ORG_BLUEZ_DEVICE1_NAME, "Blocked", value)
    }

    fn rssi(&self) -> nonblock::MethodReply<i16> {
        self.get(ORG_BLUEZ_DEVICE1_NAME, "RSSI")
    }

    fn uuids(&self) -> nonblock::MethodReply<Vec<String>> {
        self.get(ORG_BLUEZ_DEVICE1_NAME, "UUIDs")
    }

    fn services_resolved(&self) -> nonblock::MethodReply<bool> {
        self.get(ORG_BLUEZ_DEVICE1_NAME, "ServicesResolved")
    }
}

/// Read-only snapshot of `org.bluez.Device1` properties, as returned by
/// `org.freedesktop.DBus.ObjectManager.GetManagedObjects`.
#[derive(Copy, Clone)]
pub struct OrgBluezDevice1Properties<'a>(pub &'a PropMap);

impl<'a> OrgBluezDevice1Properties<'a> {
    pub fn from_interfaces(
        interfaces: &'a HashMap<String, PropMap>,
    ) -> Option<OrgBluezDevice1Properties<'a>> {
        interfaces.get(ORG_BLUEZ_DEVICE1_NAME).map(Self)
    }

    pub fn address(&self) -> Option<&String> {
        arg::prop_cast(self.0, "Address")
    }

    pub fn address_type(&self) -> Option<&String> {
        arg::prop_cast(self.0, "AddressType")
    }

    pub fn name(&self) -> Option<&String> {
        arg::prop_cast(self.0, "Name")
    }

    pub fn adapter(&self) -> Option<&dbus::Path<'static>> {
        arg::prop_cast(self.0, "Adapter")
    }

    pub fn appearance(&self) -> Option<u16> {
        arg::prop_cast(self.0, "Appearance").copied()
    }

    pub fn paired(&self) -> Option<bool> {
        arg::prop_cast(self.0, "Paired").copied()
    }

    pub fn connected(&self) -> Option<bool> {
        arg::prop_cast(self.0, "Connected").copied()
    }

    pub fn trusted(&self) -> Option<bool> {
        arg::prop_cast(self.0, "Trusted").copied()
    }

    pub fn rssi(&self) -> Option<i16> {
        arg::prop_cast(self.0, "RSSI").copied()
    }

    pub fn tx_power(&self) -> Option<i16> {
        arg::prop_cast(self.0, "TxPower").copied()
    }

    pub fn uuids(&self) -> Option<&Vec<String>> {
        arg::prop_cast(self.0, "UUIDs")
    }

    pub fn manufacturer_data(&self) -> Option<&HashMap<u16, Variant<Box<dyn RefArg>>>> {
        arg::prop_cast(self.0, "ManufacturerData")
    }

    pub fn service_data(&self) -> Option<&PropMap> {
        arg::prop_cast(self.0, "ServiceData")
    }

    pub fn services_resolved(&self) -> Option<bool> {
        arg::prop_cast(self.0, "ServicesResolved").copied()
    }
}
