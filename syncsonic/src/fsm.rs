//! Connection FSM (C5): one instance per target speaker, driving
//! Start -> Discovery -> [Pairing -> Trusting] -> Connecting -> Routing -> Done/Failed/Cancelled
//! (§4.5). The retry/backoff shape is grounded on `mijia-homie/src/main.rs`'s
//! `backoff::ExponentialBackoff` + `retry` connection loop, generalized from a single sensor GATT
//! connect attempt to this state table's per-phase retry bounds.
//!
//! The Start state's entry action ("allocate adapter via C1") is performed by the caller
//! ([`crate::service::ConnectionService`]) *before* a task running [`run`] is even spawned: a
//! `no_adapter` failure therefore never creates an FSM instance at all, matching S2's "no FSM
//! created" (§8).

use crate::registry::{DeviceRegistry, SpeakerSettings};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use syncsonic_audio::AudioRouter;
use syncsonic_bluez::{AdapterId, BluetoothSession, DeviceId, MacAddress};
use syncsonic_gatt::{Notifier, Phase, PhaseEvent};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};

use crate::config::FsmConfig;

/// A cooperative cancellation flag, checked between steps and at each retry boundary (§4.5
/// "Cancellation"). Cloning shares the same underlying flag; the Connection Service keeps one
/// clone to call [`CancelToken::cancel`] from its `disconnect` handler while the FSM task holds
/// the other to poll it.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The FSM's terminal outcome, reported back to the Connection Service so it can release the
/// adapter and refresh the Pi-Status snapshot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FsmOutcome {
    Done,
    Failed,
    /// Cancelled before reaching a terminal phase. No phase event is emitted for this outcome
    /// itself (§8 S5); the caller's `disconnect` handler sends `disconnect_done`.
    Cancelled,
}

/// Immutable parameters for one run of the FSM.
pub struct FsmTask {
    pub session: BluetoothSession,
    pub audio: AudioRouter,
    pub notifier: Notifier,
    pub registry: Arc<Mutex<DeviceRegistry>>,
    pub config: FsmConfig,
    pub mac: MacAddress,
    pub adapter: AdapterId,
    pub settings: SpeakerSettings,
    pub cancel: CancelToken,
}

/// BlueZ/PulseAudio's standard A2DP sink name for a device, e.g.
/// `bluez_sink.AA_BB_CC_DD_EE_01.a2dp_sink`.
pub(crate) fn sink_name(mac: MacAddress) -> String {
    format!("bluez_sink.{}.a2dp_sink", mac.to_string().replace(':', "_"))
}

impl FsmTask {
    async fn emit(&self, phase: Phase, terminal: bool) {
        let event = PhaseEvent::new(phase, self.mac, terminal);
        let _ = self.notifier.notify(event.to_frame()).await;
    }

    /// Run the full lifecycle to completion, terminal failure, or cancellation.
    pub async fn run(self) -> FsmOutcome {
        self.emit(Phase::FsmStart, false).await;

        let Some(device) = self.discover().await else {
            return self.outcome_after_discovery_or_cancel().await;
        };

        if self.cancel.is_cancelled() {
            return FsmOutcome::Cancelled;
        }

        if !device.paired {
            match self.pair_and_trust(&device.id).await {
                Ok(()) => {}
                Err(outcome) => return outcome,
            }
        }

        if self.cancel.is_cancelled() {
            return FsmOutcome::Cancelled;
        }

        if let Err(outcome) = self.connect(&device.id).await {
            return outcome;
        }

        if self.cancel.is_cancelled() {
            return FsmOutcome::Cancelled;
        }

        match self.route().await {
            Ok(()) => {
                self.emit(Phase::ConnectSuccess, false).await;
                FsmOutcome::Done
            }
            Err(outcome) => outcome,
        }
    }

    /// Returns the remote's [`DeviceInfo`]-equivalent once found, or `None` on cancellation or
    /// timeout (the caller distinguishes the two via the cancel flag).
    async fn discover(&self) -> Option<syncsonic_bluez::DeviceInfo> {
        self.emit(Phase::DiscoveryStart, false).await;

        // A previously-paired speaker's Device1 object persists on the adapter without an active
        // inquiry; check for it before spending the discovery timeout on a fresh scan.
        if let Ok(devices) = self.session.get_devices_on_adapter(&self.adapter).await {
            if let Some(device) = devices.into_iter().find(|d| d.mac_address == self.mac) {
                self.emit(Phase::DiscoveryComplete, false).await;
                return Some(device);
            }
        }

        if self.session.start_discovery_on_adapter(&self.adapter).await.is_err() {
            self.emit(Phase::DiscoveryTimeout, true).await;
            return None;
        }

        let found = timeout(self.config.discovery_timeout(), async {
            loop {
                if self.cancel.is_cancelled() {
                    return None;
                }
                if let Ok(devices) = self.session.get_devices_on_adapter(&self.adapter).await {
                    if let Some(device) = devices.into_iter().find(|d| d.mac_address == self.mac) {
                        return Some(device);
                    }
                }
                sleep(Duration::from_millis(250)).await;
            }
        })
        .await;

        let _ = self.session.stop_discovery_on_adapter(&self.adapter).await;

        match found {
            Ok(Some(device)) => {
                self.emit(Phase::DiscoveryComplete, false).await;
                Some(device)
            }
            Ok(None) => None, // cancelled
            Err(_elapsed) => {
                self.emit(Phase::DiscoveryTimeout, true).await;
                None
            }
        }
    }

    async fn outcome_after_discovery_or_cancel(&self) -> FsmOutcome {
        if self.cancel.is_cancelled() {
            FsmOutcome::Cancelled
        } else {
            FsmOutcome::Failed
        }
    }

    /// Pairing, with up to `pairing_max_attempts` tries and a linear backoff between them,
    /// followed by a single Trusting step. Returns `Ok(())` on success or `Err(outcome)` once
    /// retries are exhausted or the task was cancelled.
    async fn pair_and_trust(&self, device: &DeviceId) -> Result<(), FsmOutcome> {
        self.emit(Phase::PairingStart, false).await;

        let max_attempts = self.config.pairing_max_attempts;
        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                return Err(FsmOutcome::Cancelled);
            }

            let result = timeout(
                self.config.pairing_attempt_timeout(),
                self.session.pair(device),
            )
            .await;

            if self.cancel.is_cancelled() {
                return Err(FsmOutcome::Cancelled);
            }

            match result {
                Ok(Ok(())) => {
                    self.emit(Phase::PairingSuccess, false).await;
                    self.registry.lock().await.mark_paired(self.mac);
                    break;
                }
                _ if attempt < max_attempts => {
                    self.emit(Phase::PairingFailed { attempt }, false).await;
                    sleep(Duration::from_secs(attempt as u64)).await;
                }
                _ => {
                    self.emit(Phase::PairingFailed { attempt }, true).await;
                    return Err(FsmOutcome::Failed);
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Err(FsmOutcome::Cancelled);
        }

        self.emit(Phase::Trusting, false).await;
        match timeout(self.config.trust_timeout(), self.session.set_trusted(device, true)).await {
            Ok(Ok(())) => {
                self.registry.lock().await.mark_trusted(self.mac);
                Ok(())
            }
            _ => {
                self.emit(Phase::TrustFailed, true).await;
                Err(FsmOutcome::Failed)
            }
        }
    }

    /// Connecting, with up to `connect_max_attempts` tries and a linear backoff between them.
    async fn connect(&self, device: &DeviceId) -> Result<(), FsmOutcome> {
        self.emit(Phase::ConnectStart, false).await;

        let max_attempts = self.config.connect_max_attempts;
        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                return Err(FsmOutcome::Cancelled);
            }

            let result = timeout(
                self.config.connect_attempt_timeout(),
                self.session.connect_profile(device),
            )
            .await;

            if self.cancel.is_cancelled() {
                return Err(FsmOutcome::Cancelled);
            }

            match result {
                Ok(Ok(())) => return Ok(()),
                _ if attempt < max_attempts => {
                    self.emit(Phase::ConnectFailed { attempt }, false).await;
                    sleep(Duration::from_secs(attempt as u64)).await;
                }
                _ => {
                    self.emit(Phase::ConnectFailed { attempt }, true).await;
                    return Err(FsmOutcome::Failed);
                }
            }
        }
        Err(FsmOutcome::Failed)
    }

    /// Create the loopback and apply the settings the phone replayed with this Connect (§4.6,
    /// §9 "persistence coupling"). A single attempt; on any failure the speaker stays connected
    /// at the link layer but unrouted (§7 "routing" error taxonomy).
    async fn route(&self) -> Result<(), FsmOutcome> {
        let outcome = timeout(self.config.loopback_timeout(), async {
            self.audio.route(self.mac, sink_name(self.mac)).await?;
            self.audio
                .set_volume(self.mac, self.settings.volume, self.settings.balance)
                .await?;
            self.audio.set_latency(self.mac, self.settings.latency_ms).await?;
            if self.settings.muted {
                self.audio.set_mute(self.mac, true).await?;
            }
            Ok::<(), syncsonic_audio::AudioError>(())
        })
        .await;

        match outcome {
            Ok(Ok(())) => Ok(()),
            _ => {
                let _ = self.audio.unroute(self.mac).await;
                self.emit(Phase::LoopbackFailed, true).await;
                Err(FsmOutcome::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_name_matches_bluez_convention() {
        let mac: MacAddress = "AA:BB:CC:DD:EE:01".parse().unwrap();
        assert_eq!(sink_name(mac), "bluez_sink.AA_BB_CC_DD_EE_01.a2dp_sink");
    }

    #[test]
    fn cancel_token_starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_token_clone_shares_flag() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
