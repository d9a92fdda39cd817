use libpulse_binding::context::State as ContextState;
use thiserror::Error;

/// Error type for the audio-routing backend.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("cannot create PulseAudio context")]
    ContextCreationFailed,
    #[error("cannot connect to PulseAudio server")]
    ConnectionFailed(#[source] libpulse_binding::error::PAErr),
    #[error("PulseAudio context entered state {0:?} while waiting for it to become ready")]
    ContextNotReady(ContextState),
    #[error("no loopback routed for speaker {0}")]
    NotRouted(String),
    #[error("PulseAudio operation rejected: {0}")]
    OperationFailed(String),
}
