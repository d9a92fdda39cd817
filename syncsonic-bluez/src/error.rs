use thiserror::Error;

use crate::ParseMacAddressError;

/// An error carrying out a Bluetooth operation.
#[derive(Debug, Error)]
pub enum BluetoothError {
    /// No Bluetooth adapters were found on the system.
    #[error("No Bluetooth adapters found.")]
    NoBluetoothAdapters,
    /// There was an error talking to the BlueZ daemon over D-Bus.
    #[error(transparent)]
    DbusError(#[from] dbus::Error),
    /// Error parsing an `AddressType` from a string.
    #[error("Invalid address type {0}")]
    AddressTypeParseError(String),
    /// A required property of some device or other object was not found.
    #[error("Required property {0} missing.")]
    RequiredPropertyMissing(&'static str),
    /// Error parsing a `MacAddress` from a string.
    #[error(transparent)]
    MacAddressParseError(#[from] ParseMacAddressError),
    /// Pairing did not complete within the allotted time.
    #[error("Pairing with {0} timed out")]
    PairingTimedOut(String),
    /// Connecting did not complete within the allotted time.
    #[error("Connecting to {0} timed out")]
    ConnectTimedOut(String),
}

/// Error type for the future representing the D-Bus connection task.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("D-Bus connection lost: {0}")]
    DbusConnectionLost(#[source] dbus_tokio::connection::IOResourceError),
    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
