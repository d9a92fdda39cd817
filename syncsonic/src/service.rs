//! Connection Service (C6): owns every per-speaker FSM instance, allocates adapters to speakers,
//! serializes operations that touch the same MAC or the same adapter, and publishes Pi-Status
//! snapshots. Grounded on `mijia-homie/src/main.rs`'s `ConnectionStatus` enum and
//! `SENSOR_CONNECT_RESERVATION_TIMEOUT` reservation pattern, generalized from one sensor's
//! reconnect loop to many independent per-speaker FSMs progressing concurrently on the same
//! event loop (§5) by holding their state behind per-resource `tokio::sync::Mutex`es rather than
//! OS threads.

use crate::config::Config;
use crate::fsm::{CancelToken, FsmOutcome, FsmTask};
use crate::inventory::Inventory;
use crate::registry::{DeviceRegistry, SettingsPatch, SpeakerSettings};
use crate::snapshot::Snapshot;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use syncsonic_audio::{AudioError, AudioRouter};
use syncsonic_bluez::{AdapterId, BluetoothError, BluetoothSession, DeviceId, MacAddress};
use syncsonic_gatt::{Frame, Notifier, Opcode, Phase, PhaseEvent};
use tokio::sync::Mutex;

/// One FSM instance's live handle, as tracked by the service (§3 "at most one live FSM per MAC").
struct RunningFsm {
    cancel: CancelToken,
    adapter: AdapterId,
}

/// Owns every FSM instance, the adapter inventory, the device registry, and the derived
/// connected/scanning state the Pi-Status snapshot is built from. This is the GATT server's only
/// entry point into the connection lifecycle and audio-routing settings (§4.6).
pub struct ConnectionService {
    session: BluetoothSession,
    audio: AudioRouter,
    notifier: Notifier,
    config: Config,
    inventory: Arc<Mutex<Inventory>>,
    registry: Arc<Mutex<DeviceRegistry>>,
    running: Mutex<HashMap<MacAddress, RunningFsm>>,
    connected: Mutex<HashSet<MacAddress>>,
    scanning: Mutex<Option<AdapterId>>,
    allowed: Mutex<Option<HashSet<MacAddress>>>,
}

impl ConnectionService {
    pub fn new(
        session: BluetoothSession,
        audio: AudioRouter,
        notifier: Notifier,
        config: Config,
        inventory: Arc<Mutex<Inventory>>,
        registry: Arc<Mutex<DeviceRegistry>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            audio,
            notifier,
            config,
            inventory,
            registry,
            running: Mutex::new(HashMap::new()),
            connected: Mutex::new(HashSet::new()),
            scanning: Mutex::new(None),
            allowed: Mutex::new(None),
        })
    }

    async fn emit(&self, phase: Phase, mac: MacAddress, terminal: bool) {
        let _ = self
            .notifier
            .notify(PhaseEvent::new(phase, mac, terminal).to_frame())
            .await;
    }

    async fn cancel_running(&self, mac: MacAddress) {
        if let Some(running) = self.running.lock().await.get(&mac) {
            running.cancel.cancel();
        }
    }

    /// Connect-one (opcode `0x60`, §4.6/§4.7). Allocates a free adapter and spawns the FSM
    /// instance that drives the rest of the lifecycle; this call itself only ever emits the
    /// resource-exhaustion rejection (`no_adapter`, §8 S2) — every other phase event is the
    /// spawned FSM's own.
    pub async fn connect(
        self: &Arc<Self>,
        mac: MacAddress,
        name: String,
        settings: SpeakerSettings,
        allowed: Vec<MacAddress>,
    ) {
        *self.allowed.lock().await = if allowed.is_empty() {
            None
        } else {
            Some(allowed.into_iter().collect())
        };

        // A fresh Connect-one supersedes whatever FSM was already driving this MAC.
        self.cancel_running(mac).await;

        {
            let mut registry = self.registry.lock().await;
            registry.upsert(mac, name, None);
            registry.set_settings(
                mac,
                SettingsPatch {
                    volume: Some(settings.volume),
                    balance: Some(settings.balance),
                    latency_ms: Some(settings.latency_ms),
                    muted: Some(settings.muted),
                },
            );
        }

        let adapter = {
            let mut inventory = self.inventory.lock().await;
            let Some(adapter) = inventory.free_adapter() else {
                drop(inventory);
                self.emit(Phase::NoAdapter, mac, true).await;
                return;
            };
            inventory.assign(&adapter, mac);
            adapter
        };
        self.registry
            .lock()
            .await
            .set_assigned_adapter(mac, Some(adapter.clone()));

        let cancel = CancelToken::new();
        self.running.lock().await.insert(
            mac,
            RunningFsm {
                cancel: cancel.clone(),
                adapter: adapter.clone(),
            },
        );

        let task = FsmTask {
            session: self.session.clone(),
            audio: self.audio.clone(),
            notifier: self.notifier.clone(),
            registry: self.registry.clone(),
            config: self.config.fsm,
            mac,
            adapter,
            settings: self.registry.lock().await.settings(&mac),
            cancel,
        };

        let service = self.clone();
        tokio::spawn(async move {
            let outcome = task.run().await;
            service.on_fsm_terminal(mac, outcome).await;
        });
    }

    /// An FSM reached a terminal state (Done, Failed or Cancelled): release bookkeeping and
    /// publish the refreshed snapshot (§4.6 "A snapshot is published whenever a
    /// Done/Failed/adapter_lost event fires").
    async fn on_fsm_terminal(&self, mac: MacAddress, outcome: FsmOutcome) {
        let adapter = self.running.lock().await.remove(&mac).map(|running| running.adapter);

        match outcome {
            FsmOutcome::Done => {
                self.connected.lock().await.insert(mac);
            }
            FsmOutcome::Failed | FsmOutcome::Cancelled => {
                self.connected.lock().await.remove(&mac);
                if let Some(adapter) = &adapter {
                    self.inventory.lock().await.release(adapter);
                    self.registry.lock().await.set_assigned_adapter(mac, None);
                }
            }
        }

        self.publish_snapshot().await;
    }

    /// Disconnect (opcode `0x61`, §4.6). Cancels the FSM cooperatively if one is running, then
    /// tears down the link and loopback regardless of whatever that FSM's own eventual outcome
    /// would have been (§8 "Cancellation law").
    pub async fn disconnect(&self, mac: MacAddress) {
        self.cancel_running(mac).await;
        self.running.lock().await.remove(&mac);

        let adapter = self
            .registry
            .lock()
            .await
            .get(&mac)
            .and_then(|speaker| speaker.assigned_adapter.clone());
        if let Some(adapter) = &adapter {
            let device = DeviceId::for_mac(adapter, mac);
            let _ = self.session.disconnect(&device).await;
            self.inventory.lock().await.release(adapter);
        }
        let _ = self.audio.unroute(mac).await;
        self.registry.lock().await.set_assigned_adapter(mac, None);
        self.connected.lock().await.remove(&mac);

        self.emit(Phase::DisconnectDone, mac, false).await;
        self.publish_snapshot().await;
    }

    /// An adapter disappeared from the bus (§4.1 "property_change"): abort whatever speaker it
    /// held, terminally, and publish the refreshed snapshot.
    pub async fn on_adapter_lost(&self, adapter: &AdapterId) {
        let held = self.inventory.lock().await.mark_unavailable(adapter);
        let Some(mac) = held else {
            return;
        };
        self.cancel_running(mac).await;
        self.running.lock().await.remove(&mac);
        let _ = self.audio.unroute(mac).await;
        self.registry.lock().await.set_assigned_adapter(mac, None);
        self.connected.lock().await.remove(&mac);
        self.emit(Phase::AdapterLost, mac, true).await;
        self.publish_snapshot().await;
    }

    /// Set-volume (opcode `0x63`). Idempotent per-speaker settings update (§8); `Err` surfaces as
    /// a `0xF1` failure ack to the caller (e.g. the speaker isn't currently routed).
    pub async fn set_volume(&self, mac: MacAddress, volume: u8, balance: f32) -> Result<(), AudioError> {
        self.registry.lock().await.set_settings(
            mac,
            SettingsPatch {
                volume: Some(volume),
                balance: Some(balance),
                latency_ms: None,
                muted: None,
            },
        );
        self.audio.set_volume(mac, volume, balance).await
    }

    /// Set-latency (opcode `0x62`).
    pub async fn set_latency(&self, mac: MacAddress, latency_ms: u16) -> Result<(), AudioError> {
        self.registry.lock().await.set_settings(
            mac,
            SettingsPatch {
                volume: None,
                balance: None,
                latency_ms: Some(latency_ms),
                muted: None,
            },
        );
        self.audio.set_latency(mac, latency_ms).await
    }

    /// Set-mute (opcode `0x65`). Unmuting restores the last-applied volume rather than leaving
    /// the speaker silent (§4.4, §8 S3).
    pub async fn set_mute(&self, mac: MacAddress, muted: bool) -> Result<(), AudioError> {
        self.registry.lock().await.set_settings(
            mac,
            SettingsPatch {
                volume: None,
                balance: None,
                latency_ms: None,
                muted: Some(muted),
            },
        );
        self.audio.set_mute(mac, muted).await
    }

    /// Get-paired-devices (opcode `0x64`).
    pub async fn paired_devices(&self) -> HashMap<MacAddress, String> {
        self.registry.lock().await.paired_list()
    }

    pub async fn is_scanning(&self) -> bool {
        self.scanning.lock().await.is_some()
    }

    /// Scan-start (opcode `0x40`). Starts an inquiry on a free adapter if one is available,
    /// falling back to the reserved adapter (its own advertising is unaffected by starting a
    /// discovery alongside it) so that scanning still works when every assignable adapter is
    /// already holding a speaker.
    pub async fn start_scan(&self) -> Result<(), BluetoothError> {
        let mut scanning = self.scanning.lock().await;
        if scanning.is_some() {
            return Ok(());
        }
        let adapter = {
            let inventory = self.inventory.lock().await;
            inventory
                .free_adapter()
                .unwrap_or_else(|| inventory.reserved_adapter().clone())
        };
        self.session.start_discovery_on_adapter(&adapter).await?;
        *scanning = Some(adapter);
        drop(scanning);
        self.emit_scanning(true).await;
        Ok(())
    }

    /// Scan-stop (opcode `0x41`).
    pub async fn stop_scan(&self) -> Result<(), BluetoothError> {
        let adapter = self.scanning.lock().await.take();
        if let Some(adapter) = adapter {
            self.session.stop_discovery_on_adapter(&adapter).await?;
        }
        self.emit_scanning(false).await;
        Ok(())
    }

    async fn emit_scanning(&self, scanning: bool) {
        let _ = self
            .notifier
            .notify(Frame::new(Opcode::Success, json!({ "scanning": scanning })))
            .await;
    }

    /// Forward one newly-discovered device to the phone as a `0x43` per-device notification
    /// (§4.7), and record it in the registry so a later Connect-one can find it without
    /// re-scanning. A no-op outside an active scan.
    pub async fn on_device_discovered(&self, mac: MacAddress, name: String, rssi: Option<i16>) {
        if !self.is_scanning().await {
            return;
        }
        let paired = {
            let mut registry = self.registry.lock().await;
            registry.upsert(mac, name.clone(), rssi);
            registry.get(&mac).map(|speaker| speaker.paired).unwrap_or(false)
        };
        let frame = Frame::new(
            Opcode::ScanDevice,
            json!({ "device": { "mac": mac.to_string(), "name": name, "paired": paired } }),
        );
        let _ = self.notifier.notify(frame).await;
    }

    /// Build the current Pi-Status snapshot (§3); also the Get-query entry point.
    pub async fn snapshot(&self) -> Snapshot {
        Snapshot {
            connected: self.connected.lock().await.iter().copied().collect(),
            scanning: self.is_scanning().await,
        }
    }

    async fn publish_snapshot(&self) {
        let snapshot = self.snapshot().await;
        let _ = self.notifier.notify(snapshot.to_frame()).await;
    }

    /// Whether `mac` is in the optional session whitelist passed with the most recent Connect-one
    /// (§9 Open Question decision: scoped to the in-memory session, replaced wholesale each
    /// Connect, not persisted).
    pub async fn is_allowed(&self, mac: &MacAddress) -> bool {
        match &*self.allowed.lock().await {
            Some(allowed) => allowed.contains(mac),
            None => true,
        }
    }

    /// Daemon shutdown (§5): cancel every FSM and unroute every loopback.
    pub async fn shutdown(&self) {
        let macs: Vec<MacAddress> = self.running.lock().await.keys().copied().collect();
        for mac in macs {
            self.disconnect(mac).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_fsm_tracks_its_adapter() {
        let running = RunningFsm {
            cancel: CancelToken::new(),
            adapter: AdapterId::new("/org/bluez/hci1"),
        };
        assert_eq!(running.adapter, AdapterId::new("/org/bluez/hci1"));
    }
}
