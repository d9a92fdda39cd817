//! The BLE GATT side of Sync-Sonic: decodes and encodes the single-characteristic wire protocol,
//! models the connection FSM's phase events as a typed enum rather than raw strings, and exports
//! the advertised service/characteristic over D-Bus.
//!
//! [`Frame`] is the wire codec; [`PhaseEvent`] and the `command` module are typed projections of
//! its JSON payload; [`Notifier`] queues outbound frames; [`GattServer`] owns the D-Bus objects.

mod command;
mod frame;
mod notifier;
mod phase;
mod server;

pub use self::command::{
    ConnectOneRequest, DisconnectRequest, SetLatencyRequest, SetMuteRequest, SetVolumeRequest,
    SpeakerSettings, TargetSpeaker,
};
pub use self::frame::{Frame, FrameError, Opcode};
pub use self::notifier::{NotifyError, Notifier};
pub use self::phase::{Phase, PhaseEvent};
pub use self::server::{GattServer, GattServerError, WriteHandler};
