//! Exports the advertised GATT service over D-Bus: one primary service, one characteristic
//! (read / write-without-response / notify), and its client-configuration descriptor, plus the
//! advertisement that restricts discovery to the reserved adapter. Incoming writes are decoded
//! into [`Frame`]s and handed to a caller-supplied handler; outgoing frames are pulled off a
//! [`Notifier`] queue and pushed as `PropertiesChanged` notifications on the characteristic.

use crate::frame::{Frame, Opcode};
use crate::notifier::Notifier;
use async_channel::Receiver;
use dbus::arg::{PropMap, RefArg, Variant};
use dbus::message::MatchRule;
use dbus::nonblock::{Proxy, SyncConnection};
use dbus::Path;
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use futures::future::BoxFuture;
use serde_json::json;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use syncsonic_bluez::AdapterId;
use thiserror::Error;

use bluez_generated::{OrgBluezGattManager1, OrgBluezLEAdvertisingManager1};

const APP_ROOT: &str = "/org/syncsonic/gatt";
const SERVICE_PATH: &str = "/org/syncsonic/gatt/service0";
const CHARACTERISTIC_PATH: &str = "/org/syncsonic/gatt/service0/char0";
const DESCRIPTOR_PATH: &str = "/org/syncsonic/gatt/service0/char0/cccd0";
const ADVERTISEMENT_PATH: &str = "/org/syncsonic/gatt/advertisement0";

/// The fixed 128-bit service and characteristic UUIDs of the advertised GATT surface.
const SERVICE_UUID: &str = "6c29d591-9bb4-4e2f-9c7f-3c0e6a9f0a01";
const CHARACTERISTIC_UUID: &str = "6c29d591-9bb4-4e2f-9c7f-3c0e6a9f0a02";
const CCCD_UUID: &str = "00002902-0000-1000-8000-00805f9b34fb";
/// Fallback advertised name (§6 "The advertised name is fixed") when the caller doesn't override
/// it via `gatt.advertised_name` (see `Config::gatt`).
const DEFAULT_ADVERTISED_NAME: &str = "Sync-Sonic";

const DBUS_METHOD_CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// BlueZ's unnegotiated ATT MTU, used as the `max_len` fallback when a `WriteValue` call's
/// options carry no `"mtu"` entry (e.g. a pre-MTU-exchange write).
const DEFAULT_ATT_MTU: u16 = 23;

const GATT_SERVICE_IFACE: &str = "org.bluez.GattService1";
const GATT_CHARACTERISTIC_IFACE: &str = "org.bluez.GattCharacteristic1";
const GATT_DESCRIPTOR_IFACE: &str = "org.bluez.GattDescriptor1";
const LE_ADVERTISEMENT_IFACE: &str = "org.bluez.LEAdvertisement1";
const OBJECT_MANAGER_IFACE: &str = "org.freedesktop.DBus.ObjectManager";
const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";

/// A GATT write decoded into a [`Frame`] and handed to the daemon for dispatch.
pub type WriteHandler = Arc<dyn Fn(Frame) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum GattServerError {
    #[error("D-Bus call failed: {0}")]
    Dbus(#[from] dbus::Error),
}

/// Mutable state shared between the crossroads method handlers and the notifier-draining task.
struct Shared {
    connection: Arc<SyncConnection>,
    value: Mutex<Vec<u8>>,
    notifying: AtomicBool,
    on_write: WriteHandler,
    notifier: Notifier,
    advertised_name: String,
}

impl Debug for Shared {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Shared")
            .field("notifying", &self.notifying.load(Ordering::Relaxed))
            .finish()
    }
}

/// The exported GATT application: a primary service, one characteristic, its CCCD, and the
/// advertisement restricting visibility to the reserved adapter.
pub struct GattServer {
    connection: Arc<SyncConnection>,
    adapter: AdapterId,
    on_write: WriteHandler,
    notifier: Notifier,
    advertised_name: String,
}

impl GattServer {
    /// `notifier` is the same handle whose `notify` calls feed `notifier_rx` passed to [`run`];
    /// the server also uses it directly to surface frame-decode errors (§4.7), since a
    /// write-without-response `WriteValue` has no D-Bus reply path the phone can observe.
    /// `advertised_name` is the fixed name the advertisement carries (§6; overridable via
    /// `gatt.advertised_name`, defaulting to [`DEFAULT_ADVERTISED_NAME`]).
    pub fn new(
        connection: Arc<SyncConnection>,
        adapter: AdapterId,
        on_write: WriteHandler,
        notifier: Notifier,
        advertised_name: impl Into<Option<String>>,
    ) -> Self {
        Self {
            connection,
            adapter,
            on_write,
            notifier,
            advertised_name: advertised_name
                .into()
                .unwrap_or_else(|| DEFAULT_ADVERTISED_NAME.to_string()),
        }
    }

    /// Register the service, characteristic, descriptor and advertisement with BlueZ, then run
    /// forever: dispatching incoming D-Bus method calls and draining `notifier` into
    /// `PropertiesChanged` notifications on the characteristic.
    pub async fn run(self, notifier_rx: Receiver<Frame>) -> Result<(), GattServerError> {
        let shared = Arc::new(Shared {
            connection: self.connection.clone(),
            value: Mutex::new(Vec::new()),
            notifying: AtomicBool::new(false),
            on_write: self.on_write,
            notifier: self.notifier,
            advertised_name: self.advertised_name,
        });

        let mut cr = Crossroads::new();
        cr.set_async_support(Some((
            self.connection.clone(),
            Box::new(|future| {
                tokio::spawn(future);
            }),
        )));

        let object_manager_token = register_object_manager(&mut cr);
        let service_token = register_service(&mut cr);
        let characteristic_token = register_characteristic(&mut cr);
        let descriptor_token = register_descriptor(&mut cr);
        let advertisement_token = register_advertisement(&mut cr);

        cr.insert(APP_ROOT, &[object_manager_token], shared.clone());
        cr.insert(SERVICE_PATH, &[service_token], shared.clone());
        cr.insert(CHARACTERISTIC_PATH, &[characteristic_token], shared.clone());
        cr.insert(DESCRIPTOR_PATH, &[descriptor_token], shared.clone());
        cr.insert(ADVERTISEMENT_PATH, &[advertisement_token], shared.clone());

        self.connection.start_receive(
            MatchRule::new_method_call(),
            Box::new(move |msg, conn| {
                cr.handle_message(msg, conn).unwrap_or(());
                true
            }),
        );

        let gatt_manager = self.gatt_manager_proxy();
        gatt_manager
            .register_application(Path::from(APP_ROOT), HashMap::new())
            .await?;

        let advertising_manager = self.advertising_manager_proxy();
        advertising_manager
            .register_advertisement(Path::from(ADVERTISEMENT_PATH), HashMap::new())
            .await?;

        drain_notifications(shared, notifier_rx).await;
        Ok(())
    }

    /// Unregister the advertisement and GATT application from BlueZ (§5 "Shutdown of the daemon
    /// ... stops advertising"). Best-effort: BlueZ drops both anyway once the connection itself
    /// closes, so a failure here is logged and swallowed rather than propagated.
    pub async fn unregister(connection: &Arc<SyncConnection>, adapter: &AdapterId) {
        let advertising_manager = Proxy::new(
            "org.bluez",
            adapter.object_path().clone(),
            DBUS_METHOD_CALL_TIMEOUT,
            connection.clone(),
        );
        if let Err(err) = advertising_manager
            .unregister_advertisement(Path::from(ADVERTISEMENT_PATH))
            .await
        {
            log::debug!("unregistering advertisement: {err}");
        }

        let gatt_manager = Proxy::new(
            "org.bluez",
            adapter.object_path().clone(),
            DBUS_METHOD_CALL_TIMEOUT,
            connection.clone(),
        );
        if let Err(err) = gatt_manager.unregister_application(Path::from(APP_ROOT)).await {
            log::debug!("unregistering GATT application: {err}");
        }
    }

    fn gatt_manager_proxy(&self) -> Proxy<'_, Arc<SyncConnection>> {
        Proxy::new(
            "org.bluez",
            self.adapter.object_path().clone(),
            DBUS_METHOD_CALL_TIMEOUT,
            self.connection.clone(),
        )
    }

    fn advertising_manager_proxy(&self) -> Proxy<'_, Arc<SyncConnection>> {
        Proxy::new(
            "org.bluez",
            self.adapter.object_path().clone(),
            DBUS_METHOD_CALL_TIMEOUT,
            self.connection.clone(),
        )
    }
}

/// Drain notified frames, updating the characteristic's cached value and (when a client has
/// subscribed) emitting the `PropertiesChanged` signal that BlueZ turns into a BLE notification.
async fn drain_notifications(shared: Arc<Shared>, rx: Receiver<Frame>) {
    while let Ok(frame) = rx.recv().await {
        let bytes = frame.encode();
        *shared.value.lock().unwrap() = bytes.clone();
        if shared.notifying.load(Ordering::Relaxed) {
            let _ = emit_value_changed(&shared.connection, &bytes);
        }
    }
}

fn emit_value_changed(connection: &SyncConnection, value: &[u8]) -> Result<(), dbus::Error> {
    let mut changed: PropMap = HashMap::new();
    changed.insert(
        "Value".to_string(),
        Variant(Box::new(value.to_vec()) as Box<dyn RefArg>),
    );
    let message = dbus::Message::signal(
        &Path::from(CHARACTERISTIC_PATH),
        &PROPERTIES_IFACE.into(),
        &"PropertiesChanged".into(),
    )
    .append3(
        GATT_CHARACTERISTIC_IFACE,
        changed,
        Vec::<String>::new(),
    );
    connection
        .send(message)
        .map_err(|()| dbus::Error::new_custom("org.syncsonic.Error.Send", "failed to send signal"))?;
    Ok(())
}

/// The payload bound `Frame::decode` rejects against (§4.7 "exceeding the negotiated MTU minus
/// one"), derived from `WriteValue`'s `options["mtu"]` when BlueZ supplies it.
fn max_payload_len(options: &PropMap) -> usize {
    let mtu = options
        .get("mtu")
        .and_then(|variant| variant.0.as_u64())
        .and_then(|mtu| u16::try_from(mtu).ok())
        .unwrap_or(DEFAULT_ATT_MTU);
    mtu.saturating_sub(1) as usize
}

fn register_object_manager(cr: &mut Crossroads) -> IfaceToken<Arc<Shared>> {
    cr.register(OBJECT_MANAGER_IFACE, |ib: &mut IfaceBuilder<Arc<Shared>>| {
        ib.method(
            "GetManagedObjects",
            (),
            ("objects",),
            move |_ctx, _shared, ()| {
                let mut objects: HashMap<Path<'static>, HashMap<String, PropMap>> = HashMap::new();
                objects.insert(Path::from(SERVICE_PATH), service_properties());
                objects.insert(Path::from(CHARACTERISTIC_PATH), characteristic_properties());
                objects.insert(Path::from(DESCRIPTOR_PATH), descriptor_properties());
                Ok((objects,))
            },
        );
    })
}

fn service_properties() -> HashMap<String, PropMap> {
    let mut props: PropMap = HashMap::new();
    props.insert("UUID".to_string(), Variant(Box::new(SERVICE_UUID.to_string())));
    props.insert("Primary".to_string(), Variant(Box::new(true)));
    let mut iface = HashMap::new();
    iface.insert(GATT_SERVICE_IFACE.to_string(), props);
    iface
}

fn characteristic_properties() -> HashMap<String, PropMap> {
    let mut props: PropMap = HashMap::new();
    props.insert(
        "UUID".to_string(),
        Variant(Box::new(CHARACTERISTIC_UUID.to_string())),
    );
    props.insert(
        "Service".to_string(),
        Variant(Box::new(Path::from(SERVICE_PATH))),
    );
    props.insert(
        "Flags".to_string(),
        Variant(Box::new(vec![
            "read".to_string(),
            "write-without-response".to_string(),
            "notify".to_string(),
        ])),
    );
    let mut iface = HashMap::new();
    iface.insert(GATT_CHARACTERISTIC_IFACE.to_string(), props);
    iface
}

fn descriptor_properties() -> HashMap<String, PropMap> {
    let mut props: PropMap = HashMap::new();
    props.insert("UUID".to_string(), Variant(Box::new(CCCD_UUID.to_string())));
    props.insert(
        "Characteristic".to_string(),
        Variant(Box::new(Path::from(CHARACTERISTIC_PATH))),
    );
    let mut iface = HashMap::new();
    iface.insert(GATT_DESCRIPTOR_IFACE.to_string(), props);
    iface
}

fn register_service(cr: &mut Crossroads) -> IfaceToken<Arc<Shared>> {
    cr.register(GATT_SERVICE_IFACE, |ib: &mut IfaceBuilder<Arc<Shared>>| {
        ib.property("UUID").get(|_, _| Ok(SERVICE_UUID.to_string()));
        ib.property("Primary").get(|_, _| Ok(true));
    })
}

fn register_characteristic(cr: &mut Crossroads) -> IfaceToken<Arc<Shared>> {
    cr.register(GATT_CHARACTERISTIC_IFACE, |ib: &mut IfaceBuilder<Arc<Shared>>| {
        ib.property("UUID")
            .get(|_, _| Ok(CHARACTERISTIC_UUID.to_string()));
        ib.property("Service").get(|_, _| Ok(Path::from(SERVICE_PATH)));
        ib.property("Flags").get(|_, _| {
            Ok(vec![
                "read".to_string(),
                "write-without-response".to_string(),
                "notify".to_string(),
            ])
        });

        ib.method_with_cr_async(
            "ReadValue",
            ("options",),
            ("value",),
            |ctx, cr, (_options,): (PropMap,)| {
                let shared: Arc<Shared> = cr.data_mut(ctx.path()).unwrap().clone();
                async move {
                    let value = shared.value.lock().unwrap().clone();
                    ctx.reply(Ok((value,)))
                }
            },
        );

        ib.method_with_cr_async(
            "WriteValue",
            ("value", "options"),
            (),
            |ctx, cr, (value, options): (Vec<u8>, PropMap)| {
                let shared: Arc<Shared> = cr.data_mut(ctx.path()).unwrap().clone();
                async move {
                    match Frame::decode(&value, max_payload_len(&options)) {
                        Ok(frame) => {
                            (shared.on_write)(frame).await;
                        }
                        Err(err) => {
                            // Write-without-response: BlueZ still expects a method reply, but the
                            // phone never sees it. The only channel it can observe is a notified
                            // 0xF1 frame.
                            let _ = shared
                                .notifier
                                .notify(Frame::new(Opcode::Failure, json!({ "reason": err.reason() })))
                                .await;
                        }
                    }
                    ctx.reply(Ok(()))
                }
            },
        );

        ib.method_with_cr_async("StartNotify", (), (), |ctx, cr, ()| {
            let shared: Arc<Shared> = cr.data_mut(ctx.path()).unwrap().clone();
            async move {
                shared.notifying.store(true, Ordering::Relaxed);
                ctx.reply(Ok(()))
            }
        });

        ib.method_with_cr_async("StopNotify", (), (), |ctx, cr, ()| {
            let shared: Arc<Shared> = cr.data_mut(ctx.path()).unwrap().clone();
            async move {
                shared.notifying.store(false, Ordering::Relaxed);
                ctx.reply(Ok(()))
            }
        });
    })
}

fn register_descriptor(cr: &mut Crossroads) -> IfaceToken<Arc<Shared>> {
    cr.register(GATT_DESCRIPTOR_IFACE, |ib: &mut IfaceBuilder<Arc<Shared>>| {
        ib.property("UUID").get(|_, _| Ok(CCCD_UUID.to_string()));
        ib.property("Characteristic")
            .get(|_, _| Ok(Path::from(CHARACTERISTIC_PATH)));

        ib.method_with_cr_async("ReadValue", ("options",), ("value",), |ctx, _cr, (_options,): (PropMap,)| {
            async move { ctx.reply(Ok((vec![0u8, 0u8],))) }
        });

        ib.method_with_cr_async(
            "WriteValue",
            ("value", "options"),
            (),
            |ctx, _cr, (_value, _options): (Vec<u8>, PropMap)| async move { ctx.reply(Ok(())) },
        );
    })
}

fn register_advertisement(cr: &mut Crossroads) -> IfaceToken<Arc<Shared>> {
    cr.register(LE_ADVERTISEMENT_IFACE, |ib: &mut IfaceBuilder<Arc<Shared>>| {
        ib.property("Type").get(|_, _| Ok("peripheral".to_string()));
        ib.property("LocalName")
            .get(|_, shared| Ok(shared.advertised_name.clone()));
        ib.property("ServiceUUIDs")
            .get(|_, _| Ok(vec![SERVICE_UUID.to_string()]));

        ib.method_with_cr_async("Release", (), (), |ctx, _cr, ()| async move { ctx.reply(Ok(())) });
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_properties_carry_fixed_uuid() {
        let props = service_properties();
        let iface = props.get(GATT_SERVICE_IFACE).unwrap();
        let uuid: &String = dbus::arg::cast(&iface.get("UUID").unwrap().0).unwrap();
        assert_eq!(uuid, SERVICE_UUID);
    }

    #[test]
    fn characteristic_flags_allow_write_without_response_and_notify() {
        let props = characteristic_properties();
        let iface = props.get(GATT_CHARACTERISTIC_IFACE).unwrap();
        let flags: &Vec<String> = dbus::arg::cast(&iface.get("Flags").unwrap().0).unwrap();
        assert!(flags.contains(&"write-without-response".to_string()));
        assert!(flags.contains(&"notify".to_string()));
    }

    #[test]
    fn max_payload_len_derives_from_negotiated_mtu() {
        let mut options: PropMap = HashMap::new();
        options.insert("mtu".to_string(), Variant(Box::new(185u16)));
        assert_eq!(max_payload_len(&options), 184);
    }

    #[test]
    fn max_payload_len_falls_back_without_mtu_option() {
        let options: PropMap = HashMap::new();
        assert_eq!(max_payload_len(&options), (DEFAULT_ATT_MTU - 1) as usize);
    }
}
