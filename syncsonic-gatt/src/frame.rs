use serde::de::DeserializeOwned;
use serde_json::Value;
use std::convert::TryFrom;
use thiserror::Error;

/// The opcode byte at offset 0 of every frame exchanged over the single GATT characteristic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Opcode {
    /// Start scanning for classic-Bluetooth speakers.
    ScanStart,
    /// Stop scanning.
    ScanStop,
    /// Server -> phone only: one discovered device.
    ScanDevice,
    /// Drive a speaker through the connect lifecycle.
    ConnectOne,
    /// Tear down a speaker's connection.
    Disconnect,
    /// Change a connected speaker's playback-buffer latency target.
    SetLatency,
    /// Change a connected speaker's volume/balance.
    SetVolume,
    /// List speakers the registry already knows about.
    GetPairedDevices,
    /// Mute or unmute a connected speaker.
    SetMute,
    /// Phone-side hand-off to classic pairing.
    StartClassicPairing,
    /// Run the ultrasonic pairwise-delay measurement across the two connected speakers.
    StartSync,
    /// Server -> phone only: a connection FSM phase update.
    ConnectionStatusUpdate,
    /// Server -> phone only: success ack / status snapshot.
    Success,
    /// Server -> phone only: failure ack with a reason.
    Failure,
    /// Server -> phone only: structured error with phase/device/attempt.
    Error,
}

impl Opcode {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::ScanStart => 0x40,
            Self::ScanStop => 0x41,
            Self::ScanDevice => 0x43,
            Self::ConnectOne => 0x60,
            Self::Disconnect => 0x61,
            Self::SetLatency => 0x62,
            Self::SetVolume => 0x63,
            Self::GetPairedDevices => 0x64,
            Self::SetMute => 0x65,
            Self::StartClassicPairing => 0x66,
            Self::StartSync => 0x67,
            Self::ConnectionStatusUpdate => 0x70,
            Self::Success => 0xF0,
            Self::Failure => 0xF1,
            Self::Error => 0x03,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x40 => Ok(Self::ScanStart),
            0x41 => Ok(Self::ScanStop),
            0x43 => Ok(Self::ScanDevice),
            0x60 => Ok(Self::ConnectOne),
            0x61 => Ok(Self::Disconnect),
            0x62 => Ok(Self::SetLatency),
            0x63 => Ok(Self::SetVolume),
            0x64 => Ok(Self::GetPairedDevices),
            0x65 => Ok(Self::SetMute),
            0x66 => Ok(Self::StartClassicPairing),
            0x67 => Ok(Self::StartSync),
            0x70 => Ok(Self::ConnectionStatusUpdate),
            0xF0 => Ok(Self::Success),
            0xF1 => Ok(Self::Failure),
            0x03 => Ok(Self::Error),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }
}

/// An error decoding a frame received from the phone. None of these ever mutate daemon state; the
/// caller is expected to reply with a `0xF1` failure ack and the matching reason string.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("frame exceeds negotiated MTU")]
    Oversize,
    #[error("malformed JSON payload: {0}")]
    MalformedJson(#[from] serde_json::Error),
}

impl FrameError {
    /// The wire-level reason string carried in a `0xF1` failure ack, per §4.7.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UnknownOpcode(_) => "unknown_opcode",
            Self::Oversize => "oversize",
            Self::MalformedJson(_) => "malformed_json",
        }
    }
}

/// A decoded (or to-be-encoded) frame: an opcode plus a JSON payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Value,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: Value) -> Self {
        Self { opcode, payload }
    }

    /// Decode a raw GATT write value into a frame. `max_len` is the negotiated MTU minus one (the
    /// opcode byte); a frame whose payload would exceed it is rejected before JSON parsing is even
    /// attempted.
    pub fn decode(bytes: &[u8], max_len: usize) -> Result<Frame, FrameError> {
        let Some((&opcode_byte, payload_bytes)) = bytes.split_first() else {
            return Err(FrameError::UnknownOpcode(0));
        };
        if payload_bytes.len() > max_len {
            return Err(FrameError::Oversize);
        }
        let opcode = Opcode::try_from(opcode_byte)?;
        let payload = if payload_bytes.is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_slice(payload_bytes)?
        };
        Ok(Frame { opcode, payload })
    }

    /// Deserialize this frame's payload into a typed request. A payload missing fields the
    /// request type requires (for example a bare `{}` for an opcode that needs a `mac`) is
    /// reported as [`FrameError::MalformedJson`], the same reason code as an unparseable payload,
    /// since from the phone's point of view both are just a command it sent wrong.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        serde_json::from_value(self.payload.clone()).map_err(FrameError::MalformedJson)
    }

    /// Encode this frame as the raw bytes to write to, or notify on, the GATT characteristic.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![self.opcode.as_u8()];
        if !is_empty_object(&self.payload) {
            bytes.extend_from_slice(self.payload.to_string().as_bytes());
        }
        bytes
    }
}

fn is_empty_object(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_with_payload() {
        let frame = Frame::new(Opcode::SetVolume, json!({"mac": "AA:BB:CC:DD:EE:01", "volume": 80}));
        let bytes = frame.encode();
        let decoded = Frame::decode(&bytes, 512).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trip_empty_payload() {
        let frame = Frame::new(Opcode::ScanStart, json!({}));
        let bytes = frame.encode();
        assert_eq!(bytes, vec![0x40]);
        let decoded = Frame::decode(&bytes, 512).unwrap();
        assert_eq!(decoded.opcode, Opcode::ScanStart);
        assert_eq!(decoded.payload, json!({}));
    }

    #[test]
    fn unknown_opcode_rejected() {
        let err = Frame::decode(&[0x99], 512).unwrap_err();
        assert_eq!(err.reason(), "unknown_opcode");
    }

    #[test]
    fn oversize_rejected_before_parsing() {
        let payload = vec![b'a'; 10];
        let mut bytes = vec![0x63];
        bytes.extend_from_slice(&payload);
        let err = Frame::decode(&bytes, 4).unwrap_err();
        assert_eq!(err.reason(), "oversize");
    }

    #[test]
    fn malformed_json_rejected() {
        let bytes = vec![Opcode::SetVolume.as_u8()];
        let mut bytes = bytes;
        bytes.extend_from_slice(b"not json");
        let err = Frame::decode(&bytes, 512).unwrap_err();
        assert_eq!(err.reason(), "malformed_json");
    }

    #[test]
    fn single_byte_frame_treated_as_empty_payload() {
        let decoded = Frame::decode(&[0x63], 512).unwrap();
        assert_eq!(decoded.payload, json!({}));
    }
}
