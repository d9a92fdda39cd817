//! Typed request payloads for each opcode the phone may write, and the response payload shapes
//! the server sends back. These are a pure projection of the wire JSON (§4.7); decoding a frame's
//! raw [`serde_json::Value`] into one of these is where a well-formed-but-incomplete payload (for
//! example a bare `{}` for Set-Volume) is caught and reported as `malformed_json`, same as an
//! unparseable one.

use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;

/// `targetSpeaker` field of a Connect-one request.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TargetSpeaker {
    pub mac: String,
    pub name: String,
}

/// One entry of the `settings` map of a Connect-one request.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct SpeakerSettings {
    pub volume: u8,
    pub latency: u16,
    pub balance: f32,
}

/// Payload of opcode `0x60` (Connect-one).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ConnectOneRequest {
    #[serde(rename = "targetSpeaker")]
    pub target_speaker: TargetSpeaker,
    #[serde(default)]
    pub settings: HashMap<String, SpeakerSettings>,
    #[serde(default)]
    pub allowed: Vec<String>,
}

/// Payload of opcode `0x61` (Disconnect).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DisconnectRequest {
    pub mac: String,
}

/// Payload of opcode `0x62` (Set-latency).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SetLatencyRequest {
    pub mac: String,
    pub latency: u16,
}

/// Payload of opcode `0x63` (Set-volume).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SetVolumeRequest {
    pub mac: String,
    pub volume: u8,
    #[serde(default = "default_balance")]
    pub balance: f32,
}

fn default_balance() -> f32 {
    0.5
}

/// Payload of opcode `0x65` (Set-mute).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SetMuteRequest {
    pub mac: String,
    pub mute: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, Opcode};
    use serde_json::json;

    #[test]
    fn set_volume_round_trips_through_request_type() {
        let frame = Frame::new(Opcode::SetVolume, json!({"mac": "AA:BB:CC:DD:EE:01", "volume": 80, "balance": 0.25}));
        let req: SetVolumeRequest = frame.payload_as().unwrap();
        assert_eq!(req.mac, "AA:BB:CC:DD:EE:01");
        assert_eq!(req.volume, 80);
    }

    #[test]
    fn set_volume_defaults_balance_when_absent() {
        let frame = Frame::new(Opcode::SetVolume, json!({"mac": "AA:BB:CC:DD:EE:01", "volume": 80}));
        let req: SetVolumeRequest = frame.payload_as().unwrap();
        assert_eq!(req.balance, 0.5);
    }

    #[test]
    fn empty_payload_for_set_volume_is_malformed() {
        // A bare single-byte frame decodes fine at the wire layer (an empty `{}` payload), but
        // Set-Volume requires `mac` and `volume`, so it is rejected here instead.
        let frame = Frame::decode(&[Opcode::SetVolume.as_u8()], 512).unwrap();
        let result: Result<SetVolumeRequest, _> = frame.payload_as();
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().reason(), "malformed_json");
    }
}
