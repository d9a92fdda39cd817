// This code was hand-maintained in the style of `dbus-codegen-rust
// --file=specs/org.bluez.LEAdvertisingManager1.xml --interfaces=org.bluez.LEAdvertisingManager1
// --client=nonblock --methodtype=none`, see https://github.com/diwic/dbus-rs
#[allow(unused_imports)]
use dbus::arg::{self, RefArg};
use dbus::nonblock;

pub const ORG_BLUEZ_LE_ADVERTISING_MANAGER1_NAME: &str = "org.bluez.LEAdvertisingManager1";

pub trait OrgBluezLEAdvertisingManager1 {
    fn register_advertisement(
        &self,
        advertisement: dbus::Path,
        options: ::std::collections::HashMap<&str, arg::Variant<Box<dyn RefArg>>>,
    ) -> nonblock::MethodReply<()>;
    fn unregister_advertisement(&self, advertisement: dbus::Path) -> nonblock::MethodReply<()>;
}

impl<'a, T: nonblock::NonblockReply, C: ::std::ops::Deref<Target = T>>
    OrgBluezLEAdvertisingManager1 for nonblock::Proxy<'a, C>
{
    fn register_advertisement(
        &self,
        advertisement: dbus::Path,
        options: ::std::collections::HashMap<&str, arg::Variant<Box<dyn RefArg>>>,
    ) -> nonblock::MethodReply<()> {
        self.method_call(
            ORG_BLUEZ_LE_ADVERTISING_MANAGER1_NAME,
            "RegisterAdvertisement",
            (advertisement, options),
        )
    }

    fn unregister_advertisement(&self, advertisement: dbus::Path) -> nonblock::MethodReply<()> {
        self.method_call(
            ORG_BLUEZ_LE_ADVERTISING_MANAGER1_NAME,
            "UnregisterAdvertisement",
            (advertisement,),
        )
    }
}
