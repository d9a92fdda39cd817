//! Daemon configuration: a TOML file with `serde(default)` sub-structs per subsystem, laid out
//! the way `mijia-homie/src/config.rs` lays out `MqttConfig`/`HomieConfig`, plus the two
//! environment overrides §6 requires (the reserved-controller name and the ultrasonic debug
//! directory).

use eyre::Report;
use serde_derive::Deserialize;
use stable_eyre::eyre::WrapErr;
use std::fs::read_to_string;
use std::time::Duration;

const CONFIG_FILENAME: &str = "sync_sonic.toml";
const ENV_RESERVED_ADAPTER: &str = "SYNC_SONIC_RESERVED_ADAPTER";
const ENV_DEBUG_DIR: &str = "SYNC_SONIC_DEBUG_DIR";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bluetooth: BluetoothConfig,
    pub agent: AgentConfig,
    pub audio: AudioConfig,
    pub fsm: FsmConfig,
    pub sync: SyncConfig,
    pub gatt: GattConfig,
}

impl Config {
    /// Read `sync_sonic.toml` from the working directory (if present; every field has a default)
    /// and apply the `SYNC_SONIC_*` environment overrides on top.
    pub fn load() -> Result<Config, Report> {
        let mut config = match read_to_string(CONFIG_FILENAME) {
            Ok(contents) => {
                toml::from_str(&contents).wrap_err_with(|| format!("parsing {CONFIG_FILENAME}"))?
            }
            Err(_) => Config::default(),
        };

        if let Ok(reserved_adapter) = std::env::var(ENV_RESERVED_ADAPTER) {
            config.bluetooth.reserved_adapter = Some(reserved_adapter);
        }
        if let Ok(debug_dir) = std::env::var(ENV_DEBUG_DIR) {
            config.sync.debug_dir = debug_dir;
        }

        Ok(config)
    }
}

/// §4.1/§6: the one required environment/config input naming the reserved BLE controller.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// The adapter's short name (e.g. `"hci0"`) or alias. `None` falls back to the first
    /// UART-bus-convention adapter, i.e. the lowest-indexed one (§4.1); see DESIGN.md for why this
    /// daemon cannot distinguish UART from USB controllers directly.
    pub reserved_adapter: Option<String>,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            reserved_adapter: None,
        }
    }
}

/// §9 Open Question decision: opcode `0x66` semantics.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Whether the pairing agent (C3) will authorize service/key requests from MACs the device
    /// registry (C2) doesn't already know about. Defaults to false: only speakers the phone has
    /// already told us about via a previous Connect or Get-paired-devices round-trip are
    /// auto-authorized.
    pub auto_authorize_unknown: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            auto_authorize_unknown: false,
        }
    }
}

/// §9 Open Question decision: volume-scale mapping, and the loopback's phone-sourced input.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Top of the audio backend's native volume scale that linear `0..=100` is mapped onto.
    /// PulseAudio's `Volume::NORMAL` is `65536`.
    pub native_volume_max: u32,
    /// The monitor source every per-speaker loopback duplicates from, i.e. where the phone's
    /// audio actually arrives on this host.
    pub source_name: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            native_volume_max: 65536,
            source_name: "phone_input.monitor".to_string(),
        }
    }
}

/// §4.5/§5: FSM retry counts and per-phase timeouts.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct FsmConfig {
    pub discovery_timeout_secs: u64,
    pub pairing_attempt_timeout_secs: u64,
    pub pairing_max_attempts: u32,
    pub trust_timeout_secs: u64,
    pub connect_attempt_timeout_secs: u64,
    pub connect_max_attempts: u32,
    pub loopback_timeout_secs: u64,
}

impl FsmConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    pub fn pairing_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.pairing_attempt_timeout_secs)
    }

    pub fn trust_timeout(&self) -> Duration {
        Duration::from_secs(self.trust_timeout_secs)
    }

    pub fn connect_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_attempt_timeout_secs)
    }

    pub fn loopback_timeout(&self) -> Duration {
        Duration::from_secs(self.loopback_timeout_secs)
    }
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_secs: 30,
            pairing_attempt_timeout_secs: 20,
            pairing_max_attempts: 3,
            trust_timeout_secs: 10,
            connect_attempt_timeout_secs: 15,
            connect_max_attempts: 3,
            loopback_timeout_secs: 10,
        }
    }
}

/// §4.8: ultrasonic pairwise-delay measurement constants.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub send_spacing_secs: f32,
    pub min_delta_ms: f32,
    pub timeout_secs: u64,
    pub debug_dir: String,
    pub sample_rate_hz: u32,
    pub chirp_freq_hz: f32,
    pub chirp_duration_secs: f32,
}

impl SyncConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            send_spacing_secs: 2.0,
            min_delta_ms: 5.0,
            timeout_secs: 20,
            debug_dir: "/tmp/sync-sonic".to_string(),
            sample_rate_hz: 48_000,
            chirp_freq_hz: 19_000.0,
            chirp_duration_secs: 0.05,
        }
    }
}

/// §4.7/§6: the fixed advertised GATT service name.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GattConfig {
    pub advertised_name: String,
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            advertised_name: "Sync-Sonic".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let config = Config::default();
        assert_eq!(config.fsm.pairing_max_attempts, 3);
        assert_eq!(config.fsm.connect_max_attempts, 3);
        assert_eq!(config.sync.timeout_secs, 20);
        assert_eq!(config.gatt.advertised_name, "Sync-Sonic");
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [bluetooth]
            reserved_adapter = "hci0"
            "#,
        )
        .unwrap();
        assert_eq!(config.bluetooth.reserved_adapter.as_deref(), Some("hci0"));
        assert_eq!(config.audio.native_volume_max, 65536);
    }
}
