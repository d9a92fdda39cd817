//! Event Loop & Supervision (C9): wires every subsystem together over the one D-Bus connection
//! BlueZ is reached through, dispatches incoming wire commands (§4.7) to the Connection Service,
//! Audio Router and Ultrasonic Sync, and runs until any one of its resource futures ends —
//! generalizing `mijia-homie/src/main.rs`'s `try_join!` of its D-Bus, sensor and Homie futures to
//! this daemon's D-Bus, GATT-server and BlueZ-event-stream futures (§7: "the daemon logs and
//! exits nonzero, relying on the supervising system to restart it").

mod agent;
mod config;
mod fsm;
mod inventory;
mod registry;
mod service;
mod snapshot;
mod sync;

use agent::Agent;
use config::Config;
use dbus::message::MatchRule;
use dbus_crossroads::Crossroads;
use futures::stream::StreamExt;
use futures::TryFutureExt;
use inventory::Inventory;
use log::{debug, info, warn};
use registry::{DeviceRegistry, SpeakerSettings};
use serde_json::json;
use service::ConnectionService;
use std::sync::Arc;
use sync::UltrasonicSync;
use syncsonic_audio::AudioRouter;
use syncsonic_bluez::{
    AdapterEvent, BluetoothEvent, BluetoothSession, DeviceEvent, MacAddress,
};
use syncsonic_gatt::{
    ConnectOneRequest, DisconnectRequest, Frame, GattServer, Notifier, Opcode, SetLatencyRequest,
    SetMuteRequest, SetVolumeRequest, WriteHandler,
};
use tokio::sync::Mutex;
use tokio::try_join;

/// [`sync::UltrasonicSync`] needs the FSM's BlueZ/PulseAudio sink-naming convention without
/// depending on the `fsm` module wholesale.
pub(crate) use fsm::sink_name as fsm_sink_name;

#[tokio::main]
async fn main() -> Result<(), eyre::Report> {
    stable_eyre::install()?;
    pretty_env_logger::init();
    color_backtrace::install();

    let config = Config::load()?;

    let (dbus_handle, session) = BluetoothSession::new().await?;

    let inventory = Inventory::discover(&session, config.bluetooth.reserved_adapter.as_deref()).await?;
    let reserved_adapter = inventory.reserved_adapter().clone();
    info!("reserved adapter for BLE advertising: {reserved_adapter}");
    let inventory = Arc::new(Mutex::new(inventory));

    let audio = AudioRouter::connect(config.audio.source_name.clone(), config.audio.native_volume_max)?;
    let (notifier, notifier_rx) = Notifier::new();
    let registry = Arc::new(Mutex::new(DeviceRegistry::new()));

    let agent = Agent::new(reserved_adapter.clone(), config.agent.auto_authorize_unknown);
    seed_known_devices(&session, &registry, &agent).await?;

    let mut agent_cr = Crossroads::new();
    agent::export(&mut agent_cr, syncsonic_bluez::AGENT_OBJECT_PATH, agent.clone());
    session.connection().start_receive(
        MatchRule::new_method_call(),
        Box::new(move |msg, conn| {
            agent_cr.handle_message(msg, conn).unwrap_or(());
            true
        }),
    );
    session.register_agent().await?;

    let service = ConnectionService::new(
        session.clone(),
        audio.clone(),
        notifier.clone(),
        config.clone(),
        inventory.clone(),
        registry.clone(),
    );
    let sync_engine = Arc::new(UltrasonicSync::new(
        audio.clone(),
        notifier.clone(),
        registry.clone(),
        config.sync.clone(),
    ));

    let on_write = build_write_handler(service.clone(), sync_engine, agent.clone(), notifier.clone());
    let gatt_server = GattServer::new(
        session.connection(),
        reserved_adapter.clone(),
        on_write,
        notifier,
        config.gatt.advertised_name.clone(),
    );
    let gatt_task = gatt_server.run(notifier_rx);

    let event_task = process_bluetooth_events(session.clone(), inventory, registry, service.clone(), agent.clone());

    // Poll every resource future to completion, until the first one bombs out, or a shutdown
    // signal arrives first (§5 "Shutdown of the daemon broadcasts cancel to all FSMs, unroutes
    // all loopbacks, unregisters the agent, and stops advertising.").
    tokio::select! {
        res = async {
            try_join! {
                // If this ever finishes, we lost connection to D-Bus.
                dbus_handle.err_into(),
                // The GATT server stopped dispatching, e.g. BlueZ dropped our application registration.
                gatt_task.err_into(),
                // The BlueZ event stream ended, e.g. along with the D-Bus connection itself.
                event_task.err_into(),
            }
        } => {
            let res: Result<_, eyre::Report> = res;
            res?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            shutdown(&service, &session, &reserved_adapter).await;
        }
    }
    Ok(())
}

/// Graceful shutdown (§5): cancel every FSM and unroute every loopback via the Connection
/// Service, unregister the pairing agent, and stop advertising/unregister the GATT application.
async fn shutdown(
    service: &Arc<ConnectionService>,
    session: &BluetoothSession,
    reserved_adapter: &syncsonic_bluez::AdapterId,
) {
    service.shutdown().await;
    if let Err(err) = session.unregister_agent().await {
        warn!("unregistering pairing agent: {err}");
    }
    GattServer::unregister(&session.connection(), reserved_adapter).await;
}

/// Seed the device registry and pairing agent from BlueZ's own persisted pairing store (§3
/// Speaker "Lifecycle: ... retained across restarts via BlueZ's persistent pairing store"), so a
/// restarted daemon can authorize and disconnect speakers it paired with before the restart
/// without waiting for the phone to replay a Connect first.
async fn seed_known_devices(
    session: &BluetoothSession,
    registry: &Arc<Mutex<DeviceRegistry>>,
    agent: &Arc<Agent>,
) -> Result<(), eyre::Report> {
    for device in session.get_devices().await? {
        if !device.paired {
            continue;
        }
        let name = device
            .name
            .clone()
            .unwrap_or_else(|| device.mac_address.to_string());
        {
            let mut registry = registry.lock().await;
            registry.upsert(device.mac_address, name, device.rssi);
            registry.mark_paired(device.mac_address);
            if device.trusted {
                registry.mark_trusted(device.mac_address);
            }
        }
        agent.remember(device.mac_address.to_string());
    }
    Ok(())
}

/// Bridge BlueZ's adapter/device property-change stream into the adapter inventory (C1) and
/// connection service (C6): adapter power/discovery state, adapter removal (§4.1
/// "property_change"), and newly-discovered or re-paired devices.
async fn process_bluetooth_events(
    session: BluetoothSession,
    inventory: Arc<Mutex<Inventory>>,
    registry: Arc<Mutex<DeviceRegistry>>,
    service: Arc<ConnectionService>,
    agent: Arc<Agent>,
) -> Result<(), eyre::Report> {
    let mut events = session.event_stream().await?;
    while let Some(event) = events.next().await {
        match event {
            BluetoothEvent::Adapter { id, event } => match event {
                AdapterEvent::Powered { powered } => {
                    inventory.lock().await.set_powered(&id, powered);
                }
                AdapterEvent::Discovering { discovering } => {
                    inventory.lock().await.set_discovering(&id, discovering);
                }
                AdapterEvent::Removed => {
                    warn!("adapter {id} disappeared from the bus");
                    service.on_adapter_lost(&id).await;
                }
            },
            BluetoothEvent::Device { id, event } => match event {
                DeviceEvent::Discovered => {
                    if let Ok(info) = session.get_device_info(&id).await {
                        let name = info.name.clone().unwrap_or_else(|| info.mac_address.to_string());
                        service.on_device_discovered(info.mac_address, name, info.rssi).await;
                    }
                }
                DeviceEvent::Paired { paired: true } => {
                    if let Ok(info) = session.get_device_info(&id).await {
                        registry.lock().await.mark_paired(info.mac_address);
                        agent.remember(info.mac_address.to_string());
                    }
                }
                DeviceEvent::Trusted { trusted: true } => {
                    if let Ok(info) = session.get_device_info(&id).await {
                        registry.lock().await.mark_trusted(info.mac_address);
                    }
                }
                other => {
                    debug!("device {id} event: {other:?}");
                }
            },
        }
    }
    Ok(())
}

/// Build the [`WriteHandler`] the GATT server invokes for every successfully-decoded incoming
/// frame (§4.7). Decode failures never reach here; see `syncsonic_gatt::server`'s own
/// notifier-based handling of those.
fn build_write_handler(
    service: Arc<ConnectionService>,
    sync_engine: Arc<UltrasonicSync>,
    agent: Arc<Agent>,
    notifier: Notifier,
) -> WriteHandler {
    Arc::new(move |frame: Frame| {
        let service = service.clone();
        let sync_engine = sync_engine.clone();
        let agent = agent.clone();
        let notifier = notifier.clone();
        Box::pin(async move {
            dispatch(frame, service, sync_engine, agent, notifier).await;
        })
    })
}

async fn notify_success(notifier: &Notifier, payload: serde_json::Value) {
    let _ = notifier.notify(Frame::new(Opcode::Success, payload)).await;
}

async fn notify_failure(notifier: &Notifier, reason: impl Into<String>) {
    let _ = notifier
        .notify(Frame::new(Opcode::Failure, json!({ "reason": reason.into() })))
        .await;
}

/// Dispatch one decoded command frame to the subsystem that owns it (§4.6/§4.7/§4.8). Command
/// frames targeting a single speaker are rejected with `not_allowed` when that MAC falls outside
/// the whitelist the most recent Connect-one scoped the session to (§9 Open Question decision 2).
async fn dispatch(
    frame: Frame,
    service: Arc<ConnectionService>,
    sync_engine: Arc<UltrasonicSync>,
    agent: Arc<Agent>,
    notifier: Notifier,
) {
    match frame.opcode {
        Opcode::ScanStart => {
            if let Err(err) = service.start_scan().await {
                notify_failure(&notifier, err.to_string()).await;
            }
        }
        Opcode::ScanStop => {
            if let Err(err) = service.stop_scan().await {
                notify_failure(&notifier, err.to_string()).await;
            }
        }
        Opcode::ConnectOne => match frame.payload_as::<ConnectOneRequest>() {
            Ok(req) => match req.target_speaker.mac.parse::<MacAddress>() {
                Ok(mac) => {
                    let settings = req
                        .settings
                        .get(&req.target_speaker.mac)
                        .map(|wire| SpeakerSettings {
                            volume: wire.volume,
                            balance: wire.balance,
                            latency_ms: wire.latency,
                            muted: false,
                        })
                        .unwrap_or_default();
                    let allowed: Vec<MacAddress> = req
                        .allowed
                        .iter()
                        .filter_map(|mac| mac.parse().ok())
                        .collect();
                    agent.remember(mac.to_string());
                    service.connect(mac, req.target_speaker.name, settings, allowed).await;
                }
                Err(_) => notify_failure(&notifier, "malformed_json").await,
            },
            Err(err) => notify_failure(&notifier, err.reason()).await,
        },
        Opcode::Disconnect => match frame.payload_as::<DisconnectRequest>() {
            Ok(req) => match req.mac.parse::<MacAddress>() {
                Ok(mac) => {
                    if service.is_allowed(&mac).await {
                        service.disconnect(mac).await;
                    } else {
                        notify_failure(&notifier, "not_allowed").await;
                    }
                }
                Err(_) => notify_failure(&notifier, "malformed_json").await,
            },
            Err(err) => notify_failure(&notifier, err.reason()).await,
        },
        Opcode::SetLatency => match frame.payload_as::<SetLatencyRequest>() {
            Ok(req) => match req.mac.parse::<MacAddress>() {
                Ok(mac) => {
                    if !service.is_allowed(&mac).await {
                        notify_failure(&notifier, "not_allowed").await;
                    } else {
                        match service.set_latency(mac, req.latency).await {
                            Ok(()) => notify_success(&notifier, json!({})).await,
                            Err(err) => notify_failure(&notifier, err.to_string()).await,
                        }
                    }
                }
                Err(_) => notify_failure(&notifier, "malformed_json").await,
            },
            Err(err) => notify_failure(&notifier, err.reason()).await,
        },
        Opcode::SetVolume => match frame.payload_as::<SetVolumeRequest>() {
            Ok(req) => match req.mac.parse::<MacAddress>() {
                Ok(mac) => {
                    if !service.is_allowed(&mac).await {
                        notify_failure(&notifier, "not_allowed").await;
                    } else {
                        match service.set_volume(mac, req.volume, req.balance).await {
                            Ok(()) => notify_success(&notifier, json!({})).await,
                            Err(err) => notify_failure(&notifier, err.to_string()).await,
                        }
                    }
                }
                Err(_) => notify_failure(&notifier, "malformed_json").await,
            },
            Err(err) => notify_failure(&notifier, err.reason()).await,
        },
        Opcode::GetPairedDevices => {
            let devices = service.paired_devices().await;
            let map: serde_json::Map<String, serde_json::Value> = devices
                .into_iter()
                .map(|(mac, name)| (mac.to_string(), json!(name)))
                .collect();
            notify_success(&notifier, serde_json::Value::Object(map)).await;
        }
        Opcode::SetMute => match frame.payload_as::<SetMuteRequest>() {
            Ok(req) => match req.mac.parse::<MacAddress>() {
                Ok(mac) => {
                    if !service.is_allowed(&mac).await {
                        notify_failure(&notifier, "not_allowed").await;
                    } else {
                        match service.set_mute(mac, req.mute).await {
                            Ok(()) => notify_success(&notifier, json!({})).await,
                            Err(err) => notify_failure(&notifier, err.to_string()).await,
                        }
                    }
                }
                Err(_) => notify_failure(&notifier, "malformed_json").await,
            },
            Err(err) => notify_failure(&notifier, err.reason()).await,
        },
        // §9 Open Question decision 1: acknowledged only, does not itself drive an adapter.
        Opcode::StartClassicPairing => notify_success(&notifier, json!({})).await,
        Opcode::StartSync => {
            let snapshot = service.snapshot().await;
            let connected: Vec<MacAddress> = snapshot.connected.into_iter().collect();
            if connected.len() != 2 {
                notify_failure(&notifier, "requires_exactly_two_connected").await;
            } else if let Err(err) = sync_engine.run(connected[0], connected[1]).await {
                notify_failure(&notifier, err.to_string()).await;
            }
        }
        Opcode::ScanDevice
        | Opcode::ConnectionStatusUpdate
        | Opcode::Success
        | Opcode::Failure
        | Opcode::Error => {
            // These opcodes are server -> phone only; the phone writing one is a protocol error.
            notify_failure(&notifier, "unknown_opcode").await;
        }
    }
}
