//! The Audio Router (C4): wires each connected speaker's A2DP sink into a PulseAudio loopback
//! from the phone-sourced input, and applies per-speaker volume, balance, latency and mute.
//!
//! [`AudioRouter`] is the sole owner of every loopback; callers only ever send it `route`,
//! `unroute`, `set_volume`, `set_latency` or `set_mute` requests and await their outcome (§9
//! "implicit ownership of loopbacks").

mod error;
mod router;

pub use self::error::AudioError;
pub use self::router::AudioRouter;
