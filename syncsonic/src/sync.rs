//! Ultrasonic Sync (C8, §4.8): measures the playback-arrival delay between two connected
//! speakers by emitting a brief ultrasonic chirp through each (spaced `send_spacing_secs` apart),
//! recording the result on the host's microphone, locating the two chirps' peak times via an FFT
//! energy trace, and nudging the leading speaker's latency to close the gap. There is no teacher
//! precedent for the DSP itself; the task's timeout/single-flight shape is grounded on the
//! `tokio::time::timeout` pattern `mijia-homie/src/main.rs` applies to its own
//! `UPDATE_TIMEOUT`-bounded sensor reads, and the "run one blocking worker, collect results over a
//! channel" shape mirrors `syncsonic_audio::router::PulseHandle`'s use of `spawn_blocking`.

use crate::config::SyncConfig;
use crate::registry::DeviceRegistry;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rustfft::{num_complex::Complex32, FftPlanner};
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use syncsonic_audio::AudioRouter;
use syncsonic_bluez::MacAddress;
use syncsonic_gatt::Notifier;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync is already running; only one may run at a time")]
    AlreadyRunning,
    #[error("no microphone input device is available")]
    NoInputDevice,
    #[error("audio device error: {0}")]
    Device(String),
    #[error("the measurement cycle did not complete within {0:?}")]
    Timeout(Duration),
    #[error("failed to persist the debug bundle: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode the debug wav: {0}")]
    Wav(#[from] hound::Error),
    #[error("failed to serialize debug metadata: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Audio(#[from] syncsonic_audio::AudioError),
}

/// The outcome of one completed measurement (§5 scenario S4).
#[derive(Clone, Debug)]
pub struct SyncOutcome {
    pub delta_ms: f32,
    /// The speaker whose latency was adjusted, and by how much it was raised. `None` if
    /// `delta_ms` was within `min_delta_ms` of zero and no adjustment was applied.
    pub adjusted: Option<(MacAddress, f32)>,
    pub debug_dir: PathBuf,
}

/// Drives the measurement cycle for the pair of speakers the caller has already confirmed are
/// the daemon's only two connected speakers (§4.8 precondition).
pub struct UltrasonicSync {
    audio: AudioRouter,
    notifier: Notifier,
    registry: Arc<Mutex<DeviceRegistry>>,
    config: SyncConfig,
    running: Mutex<()>,
}

impl UltrasonicSync {
    pub fn new(
        audio: AudioRouter,
        notifier: Notifier,
        registry: Arc<Mutex<DeviceRegistry>>,
        config: SyncConfig,
    ) -> Self {
        Self {
            audio,
            notifier,
            registry,
            config,
            running: Mutex::new(()),
        }
    }

    /// Run one full measurement cycle between `mac_a` (plays first) and `mac_b` (plays
    /// `send_spacing_secs` later), bounded by the configured overall timeout (§4.8, §5 S4).
    pub async fn run(&self, mac_a: MacAddress, mac_b: MacAddress) -> Result<SyncOutcome, SyncError> {
        let Ok(_guard) = self.running.try_lock() else {
            return Err(SyncError::AlreadyRunning);
        };

        let timeout = self.config.timeout();
        match tokio::time::timeout(timeout, self.run_inner(mac_a, mac_b)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(SyncError::Timeout(timeout)),
        }
    }

    async fn run_inner(&self, mac_a: MacAddress, mac_b: MacAddress) -> Result<SyncOutcome, SyncError> {
        let sink_a = crate::fsm_sink_name(mac_a);
        let sink_b = crate::fsm_sink_name(mac_b);
        let config = self.config.clone();

        let recorded = tokio::task::spawn_blocking(move || record_both_chirps(&config, &sink_a, &sink_b))
            .await
            .map_err(|_| SyncError::Device("measurement worker panicked".to_string()))??;

        let config = &self.config;
        let (t1, t2) = locate_peaks(&recorded, config);
        let delta_ms = (t2 - t1) * 1000.0 - config.send_spacing_secs * 1000.0;

        let adjusted = if delta_ms.abs() >= config.min_delta_ms {
            let (target, step) = if delta_ms > 0.0 {
                (mac_a, delta_ms)
            } else {
                (mac_b, -delta_ms)
            };
            let current = self.registry.lock().await.settings(&target).latency_ms;
            let new_latency = (current as f32 + step).round().max(0.0) as u16;
            self.audio.set_latency(target, new_latency).await?;
            Some((target, step))
        } else {
            None
        };

        let debug_dir = persist_debug_bundle(config, &recorded, mac_a, mac_b, t1, t2, delta_ms)?;

        let _ = self
            .notifier
            .notify(syncsonic_gatt::Frame::new(
                syncsonic_gatt::Opcode::Success,
                json!({ "delta_ms": delta_ms, "adjusted": adjusted.map(|(mac, step)| json!({"mac": mac.to_string(), "latency_step_ms": step})) }),
            ))
            .await;

        Ok(SyncOutcome {
            delta_ms,
            adjusted,
            debug_dir,
        })
    }
}

/// One channel of recorded audio plus the two chirps' nominal offsets, handed back from the
/// blocking worker.
struct Recording {
    samples: Vec<f32>,
    sample_rate: u32,
}

/// Runs entirely on a blocking-pool thread: starts the microphone recording, plays chirp A on
/// `sink_a`, waits `send_spacing_secs`, plays chirp B on `sink_b`, then lets the recording run a
/// little longer to capture propagation delay before stopping.
fn record_both_chirps(config: &SyncConfig, sink_a: &str, sink_b: &str) -> Result<Recording, SyncError> {
    let host = cpal::default_host();
    let input = host.default_input_device().ok_or(SyncError::NoInputDevice)?;
    let input_config = input
        .default_input_config()
        .map_err(|e| SyncError::Device(e.to_string()))?;
    let sample_rate = input_config.sample_rate().0;

    let recorded = Arc::new(StdMutex::new(Vec::<f32>::new()));
    let recorded_cb = recorded.clone();
    let channels = input_config.channels() as usize;
    let input_stream = input
        .build_input_stream(
            &input_config.config(),
            move |data: &[f32], _| {
                let mut buffer = recorded_cb.lock().unwrap();
                buffer.extend(data.iter().step_by(channels.max(1)).copied());
            },
            |err| log::warn!("ultrasonic sync input stream error: {err}"),
            None,
        )
        .map_err(|e| SyncError::Device(e.to_string()))?;
    input_stream.play().map_err(|e| SyncError::Device(e.to_string()))?;

    let margin = Duration::from_millis(500);
    let chirp_duration = Duration::from_secs_f32(config.chirp_duration_secs);
    let spacing = Duration::from_secs_f32(config.send_spacing_secs);

    play_chirp_blocking(&host, sink_a, config)?;
    std::thread::sleep(spacing.saturating_sub(chirp_duration));
    play_chirp_blocking(&host, sink_b, config)?;
    std::thread::sleep(chirp_duration + margin);

    drop(input_stream);
    let samples = recorded.lock().unwrap().clone();
    Ok(Recording { samples, sample_rate })
}

/// Route playback to `sink_name` via PulseAudio's `PULSE_SINK` client override, then emit one
/// chirp and wait for it to finish.
fn play_chirp_blocking(host: &cpal::Host, sink_name: &str, config: &SyncConfig) -> Result<(), SyncError> {
    std::env::set_var("PULSE_SINK", sink_name);
    let output = host
        .default_output_device()
        .ok_or_else(|| SyncError::Device(format!("no output device routable to {sink_name}")))?;
    let output_config = output
        .default_output_config()
        .map_err(|e| SyncError::Device(e.to_string()))?;
    let channels = output_config.channels() as usize;
    let samples = chirp_samples(config.sample_rate_hz, config.chirp_freq_hz, config.chirp_duration_secs);

    let position = Arc::new(StdMutex::new(0usize));
    let position_cb = position.clone();
    let stream = output
        .build_output_stream(
            &output_config.into(),
            move |data: &mut [f32], _| {
                let mut index = position_cb.lock().unwrap();
                for frame in data.chunks_mut(channels) {
                    let sample = samples.get(*index).copied().unwrap_or(0.0);
                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                    *index += 1;
                }
            },
            |err| log::warn!("ultrasonic sync output stream error: {err}"),
            None,
        )
        .map_err(|e| SyncError::Device(e.to_string()))?;
    stream.play().map_err(|e| SyncError::Device(e.to_string()))?;
    std::thread::sleep(Duration::from_secs_f32(config.chirp_duration_secs));
    drop(stream);
    std::env::remove_var("PULSE_SINK");
    Ok(())
}

/// A short tone at `freq_hz`, windowed with a raised-cosine taper so the chirp doesn't click on
/// and off, which would otherwise pollute the FFT energy trace at frequencies away from `freq_hz`.
fn chirp_samples(sample_rate: u32, freq_hz: f32, duration_secs: f32) -> Vec<f32> {
    let total = (sample_rate as f32 * duration_secs) as usize;
    let taper = (total / 10).max(1);
    (0..total)
        .map(|n| {
            let t = n as f32 / sample_rate as f32;
            let tone = (2.0 * std::f32::consts::PI * freq_hz * t).sin();
            let window = if n < taper {
                n as f32 / taper as f32
            } else if n >= total - taper {
                (total - n) as f32 / taper as f32
            } else {
                1.0
            };
            tone * window
        })
        .collect()
}

/// Split the recording at its midpoint and locate the chirp-frequency energy peak independently
/// in each half, returning `(t1, t2)` in seconds from the start of the recording.
fn locate_peaks(recording: &Recording, config: &SyncConfig) -> (f32, f32) {
    let window_size = (recording.sample_rate as f32 * config.chirp_duration_secs) as usize;
    let window_size = window_size.max(64).next_power_of_two();
    let hop = (window_size / 4).max(1);

    let trace = energy_trace(&recording.samples, recording.sample_rate, config.chirp_freq_hz, window_size, hop);
    if trace.is_empty() {
        return (0.0, 0.0);
    }

    let midpoint = trace.len() / 2;
    let (first_half, second_half) = trace.split_at(midpoint.max(1));
    let t1 = index_to_secs(argmax(first_half), hop, recording.sample_rate);
    let t2 = midpoint as f32 * hop as f32 / recording.sample_rate as f32
        + index_to_secs(argmax(second_half), hop, recording.sample_rate);
    (t1, t2)
}

fn index_to_secs(index: usize, hop: usize, sample_rate: u32) -> f32 {
    (index * hop) as f32 / sample_rate as f32
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

/// The magnitude of the FFT bin nearest `freq_hz`, for each hop-spaced window of `samples`: a
/// one-dimensional energy-over-time trace, i.e. a single-frequency spectrogram slice.
fn energy_trace(samples: &[f32], sample_rate: u32, freq_hz: f32, window_size: usize, hop: usize) -> Vec<f32> {
    if samples.len() < window_size || window_size == 0 {
        return Vec::new();
    }
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(window_size);
    let bin = ((freq_hz * window_size as f32) / sample_rate as f32).round() as usize;

    let mut trace = Vec::new();
    let mut start = 0;
    while start + window_size <= samples.len() {
        let mut buffer: Vec<Complex32> = samples[start..start + window_size]
            .iter()
            .map(|&sample| Complex32::new(sample, 0.0))
            .collect();
        fft.process(&mut buffer);
        let magnitude = buffer.get(bin).map(|c| c.norm()).unwrap_or(0.0);
        trace.push(magnitude);
        start += hop;
    }
    trace
}

/// Persist the wav recording, the single-frequency energy trace ("spectrogram"), and a JSON
/// metadata summary to `config.debug_dir` (§4.8 "Persist a debug bundle").
fn persist_debug_bundle(
    config: &SyncConfig,
    recording: &Recording,
    mac_a: MacAddress,
    mac_b: MacAddress,
    t1: f32,
    t2: f32,
    delta_ms: f32,
) -> Result<PathBuf, SyncError> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let dir = PathBuf::from(&config.debug_dir).join(format!("sync-{timestamp}"));
    fs::create_dir_all(&dir)?;

    let wav_spec = hound::WavSpec {
        channels: 1,
        sample_rate: recording.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(dir.join("recording.wav"), wav_spec)?;
    for &sample in &recording.samples {
        writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;

    let window_size = (recording.sample_rate as f32 * config.chirp_duration_secs) as usize;
    let window_size = window_size.max(64).next_power_of_two();
    let hop = (window_size / 4).max(1);
    let trace = energy_trace(&recording.samples, recording.sample_rate, config.chirp_freq_hz, window_size, hop);
    fs::write(dir.join("spectrogram.json"), serde_json::to_vec(&trace)?)?;

    let meta = json!({
        "mac_a": mac_a.to_string(),
        "mac_b": mac_b.to_string(),
        "t1_secs": t1,
        "t2_secs": t2,
        "delta_ms": delta_ms,
        "send_spacing_secs": config.send_spacing_secs,
        "chirp_freq_hz": config.chirp_freq_hz,
        "sample_rate_hz": recording.sample_rate,
    });
    fs::write(dir.join("meta.json"), serde_json::to_vec_pretty(&meta)?)?;

    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chirp_samples_are_tapered_at_edges() {
        let samples = chirp_samples(48_000, 19_000.0, 0.05);
        assert!(samples.first().unwrap().abs() < 0.1);
        assert!(samples.last().unwrap().abs() < 0.1);
    }

    #[test]
    fn energy_trace_peaks_where_the_tone_is() {
        let sample_rate = 48_000u32;
        let mut samples = vec![0.0_f32; sample_rate as usize];
        let tone = chirp_samples(sample_rate, 19_000.0, 0.05);
        let offset = sample_rate as usize / 2;
        samples[offset..offset + tone.len()].copy_from_slice(&tone);

        let window_size = 256;
        let hop = 64;
        let trace = energy_trace(&samples, sample_rate, 19_000.0, window_size, hop);
        let peak_index = argmax(&trace);
        let peak_time = index_to_secs(peak_index, hop, sample_rate);
        assert!((peak_time - 0.5).abs() < 0.05);
    }

    #[test]
    fn argmax_finds_the_largest_value() {
        assert_eq!(argmax(&[0.1, 0.9, 0.4]), 1);
    }
}
