use dbus::arg::{cast, PropMap, RefArg};
use dbus::message::MatchRule;
use dbus::Message;
use dbus::Path;

use crate::{AdapterId, DeviceId};

/// A Bluetooth event relating to an adapter or a device, as received over the D-Bus
/// `org.freedesktop.DBus.Properties.PropertiesChanged` signal (or BlueZ's ObjectManager
/// `InterfacesAdded`/`InterfacesRemoved` signals for discovery and removal).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BluetoothEvent {
    Adapter { id: AdapterId, event: AdapterEvent },
    Device { id: DeviceId, event: DeviceEvent },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AdapterEvent {
    Powered { powered: bool },
    Discovering { discovering: bool },
    /// The controller disappeared from the bus entirely (BlueZ emitted `InterfacesRemoved` for
    /// it), e.g. a USB dongle was unplugged.
    Removed,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeviceEvent {
    /// The device was newly discovered (BlueZ emitted `InterfacesAdded` for it).
    Discovered,
    /// BlueZ stopped tracking the device (`InterfacesRemoved`).
    Removed,
    Connected { connected: bool },
    Paired { paired: bool },
    Trusted { trusted: bool },
    Rssi { rssi: i16 },
}

impl BluetoothEvent {
    /// Build the set of D-Bus match rules which must be registered to receive every event this
    /// type can represent, optionally restricted to a single object path (an adapter or device).
    pub fn match_rules(object: Option<Path<'static>>) -> Vec<MatchRule<'static>> {
        let mut properties_changed = MatchRule::new_signal(
            "org.freedesktop.DBus.Properties",
            "PropertiesChanged",
        );
        let mut interfaces_added =
            MatchRule::new_signal("org.freedesktop.DBus.ObjectManager", "InterfacesAdded");
        let mut interfaces_removed =
            MatchRule::new_signal("org.freedesktop.DBus.ObjectManager", "InterfacesRemoved");
        if let Some(path) = object {
            properties_changed.path = Some(path.clone());
            interfaces_added.path = Some(path.clone());
            interfaces_removed.path = Some(path);
        }
        vec![properties_changed, interfaces_added, interfaces_removed]
    }

    /// Parse a raw D-Bus message into zero or more events, returning an empty vec for signals
    /// this type doesn't understand or that don't carry any property we care about.
    pub fn message_to_events(message: Message) -> Vec<BluetoothEvent> {
        match message.member().as_deref() {
            Some("PropertiesChanged") => Self::properties_changed_to_events(message),
            Some("InterfacesAdded") => Self::interfaces_added_to_events(message),
            Some("InterfacesRemoved") => Self::interfaces_removed_to_events(message),
            _ => vec![],
        }
    }

    fn properties_changed_to_events(message: Message) -> Vec<BluetoothEvent> {
        let Some(path) = message.path() else {
            return vec![];
        };
        let path = path.into_static();
        let Ok((interface, properties, _invalidated)): Result<(String, PropMap, Vec<String>), _> =
            message.read3()
        else {
            return vec![];
        };

        match interface.as_str() {
            "org.bluez.Adapter1" => {
                let id = AdapterId::new(&path);
                adapter_events(&properties)
                    .into_iter()
                    .map(|event| BluetoothEvent::Adapter {
                        id: id.clone(),
                        event,
                    })
                    .collect()
            }
            "org.bluez.Device1" => {
                let id = DeviceId::new(&path);
                device_events(&properties)
                    .into_iter()
                    .map(|event| BluetoothEvent::Device {
                        id: id.clone(),
                        event,
                    })
                    .collect()
            }
            _ => vec![],
        }
    }

    fn interfaces_added_to_events(message: Message) -> Vec<BluetoothEvent> {
        let Ok((path, interfaces)): Result<(Path, std::collections::HashMap<String, PropMap>), _> =
            message.read2()
        else {
            return vec![];
        };
        if interfaces.contains_key("org.bluez.Device1") {
            vec![BluetoothEvent::Device {
                id: DeviceId::new(&path),
                event: DeviceEvent::Discovered,
            }]
        } else {
            vec![]
        }
    }

    fn interfaces_removed_to_events(message: Message) -> Vec<BluetoothEvent> {
        let Ok((path, interfaces)): Result<(Path, Vec<String>), _> = message.read2() else {
            return vec![];
        };
        let mut events = vec![];
        if interfaces.iter().any(|i| i == "org.bluez.Device1") {
            events.push(BluetoothEvent::Device {
                id: DeviceId::new(&path),
                event: DeviceEvent::Removed,
            });
        }
        if interfaces.iter().any(|i| i == "org.bluez.Adapter1") {
            events.push(BluetoothEvent::Adapter {
                id: AdapterId::new(&path),
                event: AdapterEvent::Removed,
            });
        }
        events
    }
}

fn adapter_events(properties: &PropMap) -> Vec<AdapterEvent> {
    let mut events = vec![];
    if let Some(powered) = properties.get("Powered").and_then(|v| cast::<bool>(&v.0)) {
        events.push(AdapterEvent::Powered { powered: *powered });
    }
    if let Some(discovering) = properties
        .get("Discovering")
        .and_then(|v| cast::<bool>(&v.0))
    {
        events.push(AdapterEvent::Discovering {
            discovering: *discovering,
        });
    }
    events
}

fn device_events(properties: &PropMap) -> Vec<DeviceEvent> {
    let mut events = vec![];
    if let Some(connected) = properties
        .get("Connected")
        .and_then(|v| cast::<bool>(&v.0))
    {
        events.push(DeviceEvent::Connected {
            connected: *connected,
        });
    }
    if let Some(paired) = properties.get("Paired").and_then(|v| cast::<bool>(&v.0)) {
        events.push(DeviceEvent::Paired { paired: *paired });
    }
    if let Some(trusted) = properties.get("Trusted").and_then(|v| cast::<bool>(&v.0)) {
        events.push(DeviceEvent::Trusted { trusted: *trusted });
    }
    if let Some(rssi) = properties.get("RSSI").and_then(|v| cast::<i16>(&v.0)) {
        events.push(DeviceEvent::Rssi { rssi: *rssi });
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbus::arg::Variant;
    use std::collections::HashMap;

    #[test]
    fn adapter_events_powered() {
        let mut properties: PropMap = HashMap::new();
        properties.insert("Powered".to_string(), Variant(Box::new(true)));
        assert_eq!(
            adapter_events(&properties),
            vec![AdapterEvent::Powered { powered: true }]
        );
    }

    #[test]
    fn device_events_connected_and_rssi() {
        let mut properties: PropMap = HashMap::new();
        properties.insert("Connected".to_string(), Variant(Box::new(true)));
        properties.insert("RSSI".to_string(), Variant(Box::new(-42i16)));
        let events = device_events(&properties);
        assert!(events.contains(&DeviceEvent::Connected { connected: true }));
        assert!(events.contains(&DeviceEvent::Rssi { rssi: -42 }));
    }
}
