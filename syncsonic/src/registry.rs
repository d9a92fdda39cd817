//! Device Registry (C2): the source of truth for what the phone sees as "paired speakers" — MAC,
//! friendly name, paired/trusted flags, and last-applied settings. Modeled on the teacher's
//! in-memory `HashMap<MacAddress, Sensor>` bookkeeping in `mijia-homie/src/main.rs`'s
//! `run_sensor_system`, generalized from sensor readings to paired-speaker settings.

use std::collections::HashMap;
use syncsonic_bluez::{AdapterId, MacAddress};

/// A speaker's last-applied audio settings (§3). Volume/balance/latency/mute patches are
/// idempotent and last-write-wins (§4.2, §8 "settings idempotence").
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpeakerSettings {
    pub volume: u8,
    pub balance: f32,
    pub latency_ms: u16,
    pub muted: bool,
}

impl Default for SpeakerSettings {
    fn default() -> Self {
        Self {
            volume: 50,
            balance: 0.5,
            latency_ms: 0,
            muted: false,
        }
    }
}

/// A patch applied to a speaker's settings; any field left `None` is unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct SettingsPatch {
    pub volume: Option<u8>,
    pub balance: Option<f32>,
    pub latency_ms: Option<u16>,
    pub muted: Option<bool>,
}

impl SpeakerSettings {
    fn apply(&mut self, patch: SettingsPatch) {
        if let Some(volume) = patch.volume {
            self.volume = volume;
        }
        if let Some(balance) = patch.balance {
            self.balance = balance;
        }
        if let Some(latency_ms) = patch.latency_ms {
            self.latency_ms = latency_ms;
        }
        if let Some(muted) = patch.muted {
            self.muted = muted;
        }
    }
}

#[derive(Clone, Debug)]
pub struct Speaker {
    pub mac: MacAddress,
    pub name: String,
    pub paired: bool,
    pub trusted: bool,
    pub rssi: Option<i16>,
    pub assigned_adapter: Option<AdapterId>,
    pub settings: SpeakerSettings,
}

/// The device registry. Exclusively owns speaker attribute records (§5); adapter *assignment* is
/// recorded here for read access but mutated only by the Connection Service through
/// [`DeviceRegistry::set_assigned_adapter`].
#[derive(Default)]
pub struct DeviceRegistry {
    speakers: HashMap<MacAddress, Speaker>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a newly-discovered (or re-discovered) speaker, or update its name/RSSI if already
    /// known. Idempotent: discovering the same MAC twice just refreshes `name`/`rssi`.
    pub fn upsert(&mut self, mac: MacAddress, name: String, rssi: Option<i16>) {
        let speaker = self.speakers.entry(mac).or_insert_with(|| Speaker {
            mac,
            name: name.clone(),
            paired: false,
            trusted: false,
            rssi,
            assigned_adapter: None,
            settings: SpeakerSettings::default(),
        });
        speaker.name = name;
        if rssi.is_some() {
            speaker.rssi = rssi;
        }
    }

    pub fn mark_paired(&mut self, mac: MacAddress) {
        if let Some(speaker) = self.speakers.get_mut(&mac) {
            speaker.paired = true;
        }
    }

    pub fn mark_trusted(&mut self, mac: MacAddress) {
        if let Some(speaker) = self.speakers.get_mut(&mac) {
            speaker.trusted = true;
        }
    }

    pub fn set_assigned_adapter(&mut self, mac: MacAddress, adapter: Option<AdapterId>) {
        if let Some(speaker) = self.speakers.get_mut(&mac) {
            speaker.assigned_adapter = adapter;
        }
    }

    /// Every speaker the registry currently considers paired, as `{mac: name}` (opcode `0x64`).
    pub fn paired_list(&self) -> HashMap<MacAddress, String> {
        self.speakers
            .values()
            .filter(|speaker| speaker.paired)
            .map(|speaker| (speaker.mac, speaker.name.clone()))
            .collect()
    }

    pub fn get(&self, mac: &MacAddress) -> Option<&Speaker> {
        self.speakers.get(mac)
    }

    pub fn settings(&self, mac: &MacAddress) -> SpeakerSettings {
        self.speakers
            .get(mac)
            .map(|speaker| speaker.settings)
            .unwrap_or_default()
    }

    /// Apply a settings patch. Idempotent and last-write-wins, per §4.2/§8: applying the same
    /// patch twice is indistinguishable from applying it once.
    pub fn set_settings(&mut self, mac: MacAddress, patch: SettingsPatch) -> SpeakerSettings {
        let speaker = self.speakers.entry(mac).or_insert_with(|| Speaker {
            mac,
            name: mac.to_string(),
            paired: false,
            trusted: false,
            rssi: None,
            assigned_adapter: None,
            settings: SpeakerSettings::default(),
        });
        speaker.settings.apply(patch);
        speaker.settings
    }

    pub fn contains(&self, mac: &MacAddress) -> bool {
        self.speakers.contains_key(mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac() -> MacAddress {
        "AA:BB:CC:DD:EE:01".parse().unwrap()
    }

    #[test]
    fn upsert_then_mark_paired_appears_in_paired_list() {
        let mut registry = DeviceRegistry::new();
        registry.upsert(mac(), "Kitchen".to_string(), Some(-40));
        assert!(registry.paired_list().is_empty());
        registry.mark_paired(mac());
        assert_eq!(registry.paired_list().get(&mac()), Some(&"Kitchen".to_string()));
    }

    #[test]
    fn settings_patch_is_idempotent() {
        let mut registry = DeviceRegistry::new();
        let patch = SettingsPatch {
            volume: Some(80),
            balance: Some(0.25),
            latency_ms: Some(120),
            muted: Some(false),
        };
        let once = registry.set_settings(mac(), patch);
        let twice = registry.set_settings(mac(), patch);
        assert_eq!(once, twice);
    }

    #[test]
    fn settings_patch_is_last_write_wins() {
        let mut registry = DeviceRegistry::new();
        registry.set_settings(
            mac(),
            SettingsPatch {
                volume: Some(50),
                ..Default::default()
            },
        );
        let settings = registry.set_settings(
            mac(),
            SettingsPatch {
                volume: Some(90),
                ..Default::default()
            },
        );
        assert_eq!(settings.volume, 90);
    }

    #[test]
    fn partial_patch_leaves_other_fields_untouched() {
        let mut registry = DeviceRegistry::new();
        registry.set_settings(
            mac(),
            SettingsPatch {
                volume: Some(80),
                balance: Some(0.25),
                latency_ms: Some(120),
                muted: Some(false),
            },
        );
        let settings = registry.set_settings(
            mac(),
            SettingsPatch {
                muted: Some(true),
                ..Default::default()
            },
        );
        assert_eq!(settings.volume, 80);
        assert_eq!(settings.muted, true);
    }
}
