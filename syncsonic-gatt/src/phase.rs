//! The connection FSM's phase events (§4.5, §9 REDESIGN FLAG), as a tagged variant rather than
//! stringly-typed dispatch. The JSON wire form (§4.7, opcodes `0x70`/`0x03`) is a pure projection
//! of this type, produced by [`PhaseEvent::to_frame`].

use crate::frame::{Frame, Opcode};
use serde_json::json;
use syncsonic_bluez::MacAddress;

/// One step, or terminal outcome, of a speaker's connection FSM.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    FsmStart,
    DiscoveryStart,
    DiscoveryComplete,
    DiscoveryTimeout,
    PairingStart,
    PairingSuccess,
    PairingFailed { attempt: u32 },
    Trusting,
    TrustFailed,
    ConnectStart,
    ConnectSuccess,
    ConnectFailed { attempt: u32 },
    LoopbackFailed,
    AdapterLost,
    NoAdapter,
    DisconnectDone,
}

impl Phase {
    /// The wire-level `phase` string, per §4.5.
    pub fn name(self) -> &'static str {
        match self {
            Self::FsmStart => "fsm_start",
            Self::DiscoveryStart => "discovery_start",
            Self::DiscoveryComplete => "discovery_complete",
            Self::DiscoveryTimeout => "discovery_timeout",
            Self::PairingStart => "pairing_start",
            Self::PairingSuccess => "pairing_success",
            Self::PairingFailed { .. } => "pairing_failed",
            Self::Trusting => "trusting",
            Self::TrustFailed => "trust_failed",
            Self::ConnectStart => "connect_start",
            Self::ConnectSuccess => "connect_success",
            Self::ConnectFailed { .. } => "connect_failed",
            Self::LoopbackFailed => "loopback_failed",
            Self::AdapterLost => "adapter_lost",
            Self::NoAdapter => "no_adapter",
            Self::DisconnectDone => "disconnect_done",
        }
    }

    fn attempt(self) -> Option<u32> {
        match self {
            Self::PairingFailed { attempt } | Self::ConnectFailed { attempt } => Some(attempt),
            _ => None,
        }
    }
}

/// A phase event for a specific speaker, ready to be serialized as a notification frame.
///
/// `terminal` distinguishes a per-attempt progress update (still `0x70`, e.g. `pairing_failed`
/// with retries remaining) from the FSM's final outcome for this phase (`0x03`, per §4.7's
/// "0x70 phase updates, 0x03 on errors"). Every non-error phase is implicitly non-terminal.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhaseEvent {
    pub phase: Phase,
    pub device: MacAddress,
    pub terminal: bool,
}

impl PhaseEvent {
    pub fn new(phase: Phase, device: MacAddress, terminal: bool) -> Self {
        Self {
            phase,
            device,
            terminal,
        }
    }

    /// Build the non-terminal progress event for `phase` (the common case).
    pub fn progress(phase: Phase, device: MacAddress) -> Self {
        Self::new(phase, device, false)
    }

    /// Build the event for `phase` as this FSM's final outcome.
    pub fn terminal(phase: Phase, device: MacAddress) -> Self {
        Self::new(phase, device, true)
    }

    fn is_error_phase(&self) -> bool {
        matches!(
            self.phase,
            Phase::DiscoveryTimeout
                | Phase::PairingFailed { .. }
                | Phase::TrustFailed
                | Phase::ConnectFailed { .. }
                | Phase::LoopbackFailed
                | Phase::AdapterLost
                | Phase::NoAdapter
        )
    }

    /// Project this event into the wire frame it is delivered as: `0x03` for a terminal error,
    /// `0x70` for everything else (including a non-terminal per-attempt error).
    pub fn to_frame(&self) -> Frame {
        let mut payload = json!({
            "phase": self.phase.name(),
            "device": self.device.to_string(),
        });
        if let Some(attempt) = self.phase.attempt() {
            payload["attempt"] = json!(attempt);
        }
        let opcode = if self.terminal && self.is_error_phase() {
            Opcode::Error
        } else {
            Opcode::ConnectionStatusUpdate
        };
        Frame::new(opcode, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac() -> MacAddress {
        "AA:BB:CC:DD:EE:01".parse().unwrap()
    }

    #[test]
    fn progress_event_uses_status_update_opcode() {
        let event = PhaseEvent::progress(Phase::DiscoveryStart, mac());
        assert_eq!(event.to_frame().opcode, Opcode::ConnectionStatusUpdate);
    }

    #[test]
    fn terminal_error_uses_error_opcode() {
        let event = PhaseEvent::terminal(Phase::NoAdapter, mac());
        let frame = event.to_frame();
        assert_eq!(frame.opcode, Opcode::Error);
        assert_eq!(frame.payload["phase"], "no_adapter");
    }

    #[test]
    fn non_terminal_retry_uses_status_update_opcode() {
        let event = PhaseEvent::progress(Phase::PairingFailed { attempt: 1 }, mac());
        let frame = event.to_frame();
        assert_eq!(frame.opcode, Opcode::ConnectionStatusUpdate);
        assert_eq!(frame.payload["attempt"], 1);
    }

    #[test]
    fn terminal_connect_failed_carries_attempt_and_error_opcode() {
        let event = PhaseEvent::terminal(Phase::ConnectFailed { attempt: 3 }, mac());
        let frame = event.to_frame();
        assert_eq!(frame.opcode, Opcode::Error);
        assert_eq!(frame.payload["attempt"], 3);
    }
}
