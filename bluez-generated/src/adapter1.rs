// Hand-maintained in the style of `dbus-codegen-rust --file=specs/org.bluez.Adapter1.xml
// --interfaces=org.bluez.Adapter1 --client=nonblock --methodtype=none --prop-newtype`,
// see https://github.com/diwic/dbus-rs
#[allow(unused_imports)]
use dbus::arg::{self, PropMap, RefArg};
use dbus::nonblock;
use std::collections::HashMap;

pub const ORG_BLUEZ_ADAPTER1_NAME: &str = "org.bluez.Adapter1";

pub trait OrgBluezAdapter1 {
    fn start_discovery(&self) -> nonblock::MethodReply<()>;
    fn stop_discovery(&self) -> nonblock::MethodReply<()>;
    fn remove_device(&self, device: dbus::Path) -> nonblock::MethodReply<()>;
    fn set_discovery_filter(
        &self,
        properties: HashMap<&str, arg::Variant<Box<dyn RefArg>>>,
    ) -> nonblock::MethodReply<()>;
    fn get_discovery_filters(&self) -> nonblock::MethodReply<(Vec<String>,)>;

    fn address(&self) -> nonblock::MethodReply<String>;
    fn address_type(&self) -> nonblock::MethodReply<String>;
    fn name(&self) -> nonblock::MethodReply<String>;
    fn alias(&self) -> nonblock::MethodReply<String>;
    fn set_alias(&self, value: String) -> nonblock::MethodReply<()>;
    fn powered(&self) -> nonblock::MethodReply<bool>;
    fn set_powered(&self, value: bool) -> nonblock::MethodReply<()>;
    fn discoverable(&self) -> nonblock::MethodReply<bool>;
    fn set_discoverable(&self, value: bool) -> nonblock::MethodReply<()>;
    fn discovering(&self) -> nonblock::MethodReply<bool>;
}

impl<'a, T: nonblock::NonblockReply, C: ::std::ops::Deref<Target = T>> OrgBluezAdapter1
    for nonblock::Proxy<'a, C>
{
    fn start_discovery(&self) -> nonblock::MethodReply<()> {
        self.method_call(ORG_BLUEZ_ADAPTER1_NAME, "StartDiscovery", ())
    }

    fn stop_discovery(&self) -> nonblock::MethodReply<()> {
        self.method_call(ORG_BLUEZ_ADAPTER1_NAME, "StopDiscovery", ())
    }

    fn remove_device(&self, device: dbus::Path) -> nonblock::MethodReply<()> {
        self.method_call(ORG_BLUEZ_ADAPTER1_NAME, "RemoveDevice", (device,))
    }

    fn set_discovery_filter(
        &self,
        properties: HashMap<&str, arg::Variant<Box<dyn RefArg>>>,
    ) -> nonblock::MethodReply<()> {
        self.method_call(ORG_BLUEZ_ADAPTER1_NAME, "SetDiscoveryFilter", (properties,))
    }

    fn get_discovery_filters(&self) -> nonblock::MethodReply<(Vec<String>,)> {
        self.method_call(ORG_BLUEZ_ADAPTER1_NAME, "GetDiscoveryFilters", ())
    }

    fn address(&self) -> nonblock::MethodReply<String> {
        self.get(ORG_BLUEZ_ADAPTER1_NAME, "Address")
    }

    fn address_type(&self) -> nonblock::MethodReply<String> {
        self.get(ORG_BLUEZ_ADAPTER1_NAME, "AddressType")
    }

    fn name(&self) -> nonblock::MethodReply<String> {
        self.get(ORG_BLUEZ_ADAPTER1_NAME, "Name")
    }

    fn alias(&self) -> nonblock::MethodReply<String> {
        self.get(ORG_BLUEZ_ADAPTER1_NAME, "Alias")
    }

    fn set_alias(&self, value: String) -> nonblock::MethodReply<()> {
        self.set(ORG_BLUEZ_ADAPTER1_NAME, "Alias", value)
    }

    fn powered(&self) -> nonblock::MethodReply<bool> {
        self.get(ORG_BLUEZ_ADAPTER1_NAME, "Powered")
    }

    fn set_powered(&self, value: bool) -> nonblock::MethodReply<()> {
        self.set(ORG_BLUEZ_ADAPTER1_NAME, "Powered", value)
    }

    fn discoverable(&self) -> nonblock::MethodReply<bool> {
        self.get(ORG_BLUEZ_ADAPTER1_NAME, "Discoverable")
    }

    fn set_discoverable(&self, value: bool) -> nonblock::MethodReply<()> {
        self.set(ORG_BLUEZ_ADAPTER1_NAME, "Discoverable", value)
    }

    fn discovering(&self) -> nonblock::MethodReply<bool> {
        self.get(ORG_BLUEZ_ADAPTER1_NAME, "Discovering")
    }
}

/// Read-only snapshot of `org.bluez.Adapter1` properties, as returned by
/// `org.freedesktop.DBus.ObjectManager.GetManagedObjects`.
#[derive(Copy, Clone)]
pub struct OrgBluezAdapter1Properties<'a>(pub &'a PropMap);

impl<'a> OrgBluezAdapter1Properties<'a> {
    /// Build a view over this interface's properties from a full
    /// `interface name -> properties` map, if the interface is present.
    pub fn from_interfaces(
        interfaces: &'a HashMap<String, PropMap>,
    ) -> Option<OrgBluezAdapter1Properties<'a>> {
        interfaces.get(ORG_BLUEZ_ADAPTER1_NAME).map(Self)
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

    pub fn alias(&self) -> Option<&String> {
        arg::prop_cast(self.0, "Alias")
    }

    pub fn powered(&self) -> Option<bool> {
        arg::prop_cast(self.0, "Powered").copied()
    }

    pub fn discoverable(&self) -> Option<bool> {
        arg::prop_cast(self.0, "Discoverable").copied()
    }

    pub fn discovering(&self) -> Option<bool> {
        arg::prop_cast(self.0, "Discovering").copied()
    }
}
