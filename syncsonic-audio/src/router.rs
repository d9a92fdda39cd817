//! Creates and tears down a per-speaker PulseAudio loopback (`module-loopback`) routing the
//! phone-sourced input into each connected speaker's sink, and applies volume, balance, latency
//! and mute to it. Grounded on `ReSet-Daemon`'s use of `libpulse-binding` to drive a local
//! PulseAudio server from a daemon process; all blocking PulseAudio calls run on a dedicated
//! thread via [`tokio::task::spawn_blocking`], matching §4.8/§9's "heavy audio work is performed
//! via the audio-router backend process and awaited via its notifications".

use crate::error::AudioError;
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::mainloop::threaded::Mainloop;
use libpulse_binding::operation::State as OperationState;
use libpulse_binding::proplist::{properties, Proplist};
use libpulse_binding::volume::{ChannelVolumes, Volume};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use syncsonic_bluez::MacAddress;

const APP_NAME: &str = "sync-sonic";
/// Stereo channels only; A2DP sinks are never surround.
const CHANNELS: u8 = 2;

/// State for one connected speaker's loopback: the loaded module index (needed to unload it) plus
/// the settings last applied, so re-applying mute can restore the volume that preceded it.
#[derive(Clone, Debug)]
struct Loopback {
    module_index: u32,
    sink_name: String,
    volume: u8,
    balance: f32,
    latency_ms: u16,
    muted: bool,
}

/// The audio-routing backend (C4). Owns every loopback currently routed and the single PulseAudio
/// connection they are all created through.
#[derive(Clone)]
pub struct AudioRouter {
    pulse: Arc<PulseHandle>,
    source_name: Arc<str>,
    native_volume_max: u32,
    loopbacks: Arc<tokio::sync::Mutex<HashMap<MacAddress, Loopback>>>,
}

impl AudioRouter {
    /// Connect to the local PulseAudio server. `source_name` names the phone-sourced input (a
    /// virtual sink's monitor source, typically) every loopback duplicates from; `native_volume_max`
    /// is the top of the backend's native volume scale that linear 0..100 is mapped onto (§9 Open
    /// Question: volume-scale mapping, exposed as `audio.native_volume_max` configuration).
    pub fn connect(source_name: impl Into<Arc<str>>, native_volume_max: u32) -> Result<Self, AudioError> {
        let pulse = PulseHandle::connect(APP_NAME)?;
        Ok(Self {
            pulse: Arc::new(pulse),
            source_name: source_name.into(),
            native_volume_max,
            loopbacks: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        })
    }

    /// Create a loopback from the phone-sourced input into `sink_name`, the newly-connected
    /// speaker's A2DP sink. Invoked by the connection FSM's Routing phase (§4.5).
    pub async fn route(&self, mac: MacAddress, sink_name: String) -> Result<(), AudioError> {
        let pulse = self.pulse.clone();
        let source_name = self.source_name.to_string();
        let args = format!(
            "sink={sink_name} source={source_name} latency_msec={}",
            default_latency_ms()
        );
        let module_index =
            tokio::task::spawn_blocking(move || pulse.load_module_blocking("module-loopback", &args))
                .await
                .map_err(|_| AudioError::OperationFailed("loopback worker panicked".to_string()))??;

        let mut loopbacks = self.loopbacks.lock().await;
        loopbacks.insert(
            mac,
            Loopback {
                module_index,
                sink_name,
                volume: 0,
                balance: 0.5,
                latency_ms: default_latency_ms(),
                muted: false,
            },
        );
        Ok(())
    }

    /// Tear down the loopback for `mac`, if one exists. Called on disconnect, adapter loss, or
    /// when routing itself failed partway (§4.5 Routing -> Failed).
    pub async fn unroute(&self, mac: MacAddress) -> Result<(), AudioError> {
        let removed = self.loopbacks.lock().await.remove(&mac);
        let Some(loopback) = removed else {
            return Ok(());
        };
        let pulse = self.pulse.clone();
        tokio::task::spawn_blocking(move || pulse.unload_module_blocking(loopback.module_index))
            .await
            .map_err(|_| AudioError::OperationFailed("loopback worker panicked".to_string()))??;
        Ok(())
    }

    /// Apply linear volume `0..=100` and stereo balance `b in [0,1]` to the speaker's sink, per
    /// §4.4's gain law: `left = volume * min(1, 2*(1-b))`, `right = volume * min(1, 2*b)`. Has no
    /// effect on audible output while the speaker is muted; the values are still recorded so a
    /// later unmute restores them.
    pub async fn set_volume(&self, mac: MacAddress, volume: u8, balance: f32) -> Result<(), AudioError> {
        let mut loopbacks = self.loopbacks.lock().await;
        let loopback = loopbacks
            .get_mut(&mac)
            .ok_or_else(|| AudioError::NotRouted(mac.to_string()))?;
        loopback.volume = volume;
        loopback.balance = balance;
        let sink_name = loopback.sink_name.clone();
        let effective = if loopback.muted { 0 } else { volume };
        let channel_volumes = stereo_gains(effective, balance, self.native_volume_max);
        drop(loopbacks);

        let pulse = self.pulse.clone();
        tokio::task::spawn_blocking(move || pulse.set_sink_volume_blocking(&sink_name, channel_volumes))
            .await
            .map_err(|_| AudioError::OperationFailed("loopback worker panicked".to_string()))??;
        Ok(())
    }

    /// Reload the loopback with a new playback-buffer latency target. `module-loopback`'s latency
    /// is fixed at load time, so this unloads and reloads the module rather than adjusting it live;
    /// the phone observes this as a single `set_latency` round-trip regardless.
    pub async fn set_latency(&self, mac: MacAddress, latency_ms: u16) -> Result<(), AudioError> {
        let mut loopbacks = self.loopbacks.lock().await;
        let loopback = loopbacks
            .get_mut(&mac)
            .ok_or_else(|| AudioError::NotRouted(mac.to_string()))?;
        let old_index = loopback.module_index;
        let sink_name = loopback.sink_name.clone();
        let source_name = self.source_name.to_string();
        let args = format!("sink={sink_name} source={source_name} latency_msec={latency_ms}");
        drop(loopbacks);

        let pulse = self.pulse.clone();
        let new_index = tokio::task::spawn_blocking(move || {
            pulse.unload_module_blocking(old_index)?;
            pulse.load_module_blocking("module-loopback", &args)
        })
        .await
        .map_err(|_| AudioError::OperationFailed("loopback worker panicked".to_string()))??;

        let mut loopbacks = self.loopbacks.lock().await;
        if let Some(loopback) = loopbacks.get_mut(&mac) {
            loopback.module_index = new_index;
            loopback.latency_ms = latency_ms;
        }
        Ok(())
    }

    /// Mute or unmute the speaker. Distinct from `set_volume(mac, 0, _)`: unmuting restores
    /// whatever volume was last applied rather than leaving the speaker silent (§4.4).
    pub async fn set_mute(&self, mac: MacAddress, muted: bool) -> Result<(), AudioError> {
        let mut loopbacks = self.loopbacks.lock().await;
        let loopback = loopbacks
            .get_mut(&mac)
            .ok_or_else(|| AudioError::NotRouted(mac.to_string()))?;
        loopback.muted = muted;
        let sink_name = loopback.sink_name.clone();
        let effective = if muted { 0 } else { loopback.volume };
        let channel_volumes = stereo_gains(effective, loopback.balance, self.native_volume_max);
        drop(loopbacks);

        let pulse = self.pulse.clone();
        tokio::task::spawn_blocking(move || pulse.set_sink_volume_blocking(&sink_name, channel_volumes))
            .await
            .map_err(|_| AudioError::OperationFailed("loopback worker panicked".to_string()))??;
        Ok(())
    }

    /// Whether a loopback currently exists for `mac`. Used to cross-check the Pi-Status snapshot
    /// invariant "a loopback exists for MAC m iff m in snapshot.connected" (§8).
    pub async fn is_routed(&self, mac: MacAddress) -> bool {
        self.loopbacks.lock().await.contains_key(&mac)
    }
}

const DEFAULT_LATENCY_MS: u16 = 150;

fn default_latency_ms() -> u16 {
    DEFAULT_LATENCY_MS
}

/// §4.4's balance law, mapped onto the backend's native volume scale.
fn stereo_gains(volume: u8, balance: f32, native_volume_max: u32) -> ChannelVolumes {
    let balance = balance.clamp(0.0, 1.0);
    let left_gain = volume as f32 * (2.0 * (1.0 - balance)).min(1.0);
    let right_gain = volume as f32 * (2.0 * balance).min(1.0);
    let to_native = |gain: f32| -> u32 { ((gain / 100.0) * native_volume_max as f32).round() as u32 };

    let mut channel_volumes = ChannelVolumes::default();
    channel_volumes.set(CHANNELS, Volume(0));
    let raw = channel_volumes.get_mut();
    raw[0] = Volume(to_native(left_gain));
    raw[1] = Volume(to_native(right_gain));
    channel_volumes
}

/// The PulseAudio connection itself: a threaded mainloop plus context, driven from whichever
/// blocking-pool thread happens to be running a given call. PulseAudio's threaded mainloop is
/// documented as safe to drive this way as long as every context operation is bracketed by
/// `lock()`/`unlock()`.
struct PulseHandle {
    mainloop: StdMutex<Mainloop>,
    context: StdMutex<Context>,
}

// SAFETY: `Mainloop` and `Context` are only ever touched while holding the mainloop's own lock
// (via `StdMutex`), matching libpulse's threaded-mainloop contract.
unsafe impl Send for PulseHandle {}
unsafe impl Sync for PulseHandle {}

impl PulseHandle {
    fn connect(app_name: &str) -> Result<Self, AudioError> {
        let mut proplist = Proplist::new().ok_or(AudioError::ContextCreationFailed)?;
        proplist
            .set_str(properties::APPLICATION_NAME, app_name)
            .map_err(|_| AudioError::ContextCreationFailed)?;

        let mut mainloop = Mainloop::new().ok_or(AudioError::ContextCreationFailed)?;
        let mut context = Context::new_with_proplist(&mainloop, app_name, &proplist)
            .ok_or(AudioError::ContextCreationFailed)?;

        context
            .connect(None, ContextFlagSet::NOFLAGS, None)
            .map_err(AudioError::ConnectionFailed)?;

        mainloop
            .start()
            .map_err(AudioError::ConnectionFailed)?;

        mainloop.lock();
        let state = loop {
            match context.get_state() {
                ContextState::Ready => break ContextState::Ready,
                state @ (ContextState::Failed | ContextState::Terminated) => break state,
                _ => mainloop.wait(),
            }
        };
        mainloop.unlock();

        if state != ContextState::Ready {
            return Err(AudioError::ContextNotReady(state));
        }

        Ok(Self {
            mainloop: StdMutex::new(mainloop),
            context: StdMutex::new(context),
        })
    }

    fn load_module_blocking(&self, name: &str, argument: &str) -> Result<u32, AudioError> {
        let result = Arc::new(StdMutex::new(None));
        let result_cb = result.clone();

        let mut mainloop = self.mainloop.lock().unwrap();
        let mut context = self.context.lock().unwrap();
        mainloop.lock();
        let op = context.load_module(name, argument, move |index| {
            *result_cb.lock().unwrap() = Some(index);
        });
        wait_for_operation(&mut mainloop, &op);
        mainloop.unlock();
        drop(context);
        drop(mainloop);

        result
            .lock()
            .unwrap()
            .take()
            .filter(|index| *index != u32::MAX)
            .ok_or_else(|| AudioError::OperationFailed(format!("{name} failed to load")))
    }

    fn unload_module_blocking(&self, index: u32) -> Result<(), AudioError> {
        let result = Arc::new(StdMutex::new(None));
        let result_cb = result.clone();

        let mut mainloop = self.mainloop.lock().unwrap();
        let mut context = self.context.lock().unwrap();
        mainloop.lock();
        let op = context.unload_module(index, move |success| {
            *result_cb.lock().unwrap() = Some(success);
        });
        wait_for_operation(&mut mainloop, &op);
        mainloop.unlock();
        drop(context);
        drop(mainloop);

        match result.lock().unwrap().take() {
            Some(true) => Ok(()),
            _ => Err(AudioError::OperationFailed(format!(
                "unloading module {index} failed"
            ))),
        }
    }

    fn set_sink_volume_blocking(
        &self,
        sink_name: &str,
        channel_volumes: ChannelVolumes,
    ) -> Result<(), AudioError> {
        let result = Arc::new(StdMutex::new(None));
        let result_cb = result.clone();

        let mut mainloop = self.mainloop.lock().unwrap();
        let context = self.context.lock().unwrap();
        mainloop.lock();
        let op = context.introspect().set_sink_volume_by_name(
            sink_name,
            &channel_volumes,
            Some(Box::new(move |success| {
                *result_cb.lock().unwrap() = Some(success);
            })),
        );
        wait_for_operation(&mut mainloop, &op);
        mainloop.unlock();
        drop(context);
        drop(mainloop);

        match result.lock().unwrap().take() {
            Some(true) => Ok(()),
            _ => Err(AudioError::OperationFailed(format!(
                "setting volume on sink {sink_name} failed"
            ))),
        }
    }
}

fn wait_for_operation<G: ?Sized>(mainloop: &mut Mainloop, op: &libpulse_binding::operation::Operation<G>) {
    while op.get_state() == OperationState::Running {
        mainloop.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_law_equal_split_at_half() {
        let channel_volumes = stereo_gains(80, 0.5, 65536);
        let raw = channel_volumes.get();
        assert_eq!(raw[0].0, raw[1].0);
    }

    #[test]
    fn balance_law_zero_silences_right_channel() {
        let channel_volumes = stereo_gains(80, 0.0, 65536);
        assert_eq!(channel_volumes.get()[1].0, 0);
    }

    #[test]
    fn balance_law_one_silences_left_channel() {
        let channel_volumes = stereo_gains(80, 1.0, 65536);
        assert_eq!(channel_volumes.get()[0].0, 0);
    }

    #[test]
    fn native_volume_max_scales_linearly() {
        let channel_volumes = stereo_gains(100, 0.5, 65536);
        assert_eq!(channel_volumes.get()[0].0, 65536);
    }
}
