//! An async wrapper around the client-side (central) D-Bus interface of BlueZ, the Linux
//! Bluetooth daemon, scoped to what a daemon that drives classic-Bluetooth A2DP sink connections
//! actually needs: adapter and device enumeration, discovery, pairing, trust, connect/disconnect,
//! and a stream of property-change events.
//!
//! Start by creating a [`BluetoothSession`].

mod adapter;
mod device;
mod error;
mod events;
mod macaddress;
mod messagestream;

pub use self::adapter::{AdapterId, AdapterInfo};
pub use self::device::{AddressType, DeviceId, DeviceInfo};
pub use self::error::{BluetoothError, SpawnError};
pub use self::events::{AdapterEvent, BluetoothEvent, DeviceEvent};
pub use self::macaddress::{MacAddress, ParseMacAddressError};

use self::messagestream::MessageStream;
use bluez_generated::{
    OrgBluezAdapter1, OrgBluezAdapter1Properties, OrgBluezAgentManager1, OrgBluezDevice1,
    OrgBluezDevice1Properties, ORG_BLUEZ_ADAPTER1_NAME, ORG_BLUEZ_DEVICE1_NAME,
};
use dbus::nonblock::stdintf::org_freedesktop_dbus::{ObjectManager, Properties};
use dbus::nonblock::{Proxy, SyncConnection};
use dbus::Path;
use futures::stream::{self, select_all, StreamExt};
use futures::{FutureExt, Stream};
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const DBUS_METHOD_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// The fixed object path this daemon registers itself at on BlueZ's `AgentManager1`.
pub const AGENT_OBJECT_PATH: &str = "/org/syncsonic/agent";
/// The A2DP sink profile UUID, used for `ConnectProfile` when a device advertises more than one
/// profile and BlueZ's default `Connect` would otherwise negotiate the wrong one.
pub const A2DP_SINK_UUID: &str = "0000110b-0000-1000-8000-00805f9b34fb";

/// A connection to BlueZ. This can be cheaply cloned and passed around to be used from different
/// places. It is the main entry point to this crate.
#[derive(Clone)]
pub struct BluetoothSession {
    connection: Arc<SyncConnection>,
}

impl Debug for BluetoothSession {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "BluetoothSession")
    }
}

impl BluetoothSession {
    /// Establish a new D-Bus connection to communicate with BlueZ.
    ///
    /// Returns a tuple of (join handle, Self). If the join handle ever completes then the D-Bus
    /// connection was lost and the process should restart.
    pub async fn new(
    ) -> Result<(impl Future<Output = Result<(), SpawnError>>, Self), BluetoothError> {
        let (dbus_resource, connection) = dbus_tokio::connection::new_system_sync()?;
        let dbus_handle = tokio::spawn(async {
            let err = dbus_resource.await;
            Err(SpawnError::DbusConnectionLost(err))
        });
        Ok((
            dbus_handle.map(|res| Ok(res??)),
            BluetoothSession { connection },
        ))
    }

    /// Get a list of all Bluetooth adapters on the system.
    pub async fn get_adapters(&self) -> Result<Vec<AdapterInfo>, BluetoothError> {
        let tree = self.bluez_root().get_managed_objects().await?;
        Ok(tree
            .into_iter()
            .filter_map(|(object_path, interfaces)| {
                let adapter_properties = OrgBluezAdapter1Properties::from_interfaces(&interfaces)?;
                AdapterInfo::from_properties(AdapterId { object_path }, adapter_properties).ok()
            })
            .collect())
    }

    /// Get a list of all Bluetooth devices which have been discovered or paired so far.
    pub async fn get_devices(&self) -> Result<Vec<DeviceInfo>, BluetoothError> {
        let tree = self.bluez_root().get_managed_objects().await?;
        Ok(tree
            .into_iter()
            .filter_map(|(object_path, interfaces)| {
                let device_properties = OrgBluezDevice1Properties::from_interfaces(&interfaces)?;
                DeviceInfo::from_properties(DeviceId { object_path }, device_properties).ok()
            })
            .collect())
    }

    /// Get a list of all devices discovered so far on a given adapter.
    pub async fn get_devices_on_adapter(
        &self,
        adapter: &AdapterId,
    ) -> Result<Vec<DeviceInfo>, BluetoothError> {
        let devices = self.get_devices().await?;
        Ok(devices
            .into_iter()
            .filter(|device| device.id.adapter() == *adapter)
            .collect())
    }

    /// Get information about the given Bluetooth adapter.
    pub async fn get_adapter_info(&self, id: &AdapterId) -> Result<AdapterInfo, BluetoothError> {
        let adapter = self.adapter(id);
        let properties = adapter.get_all(ORG_BLUEZ_ADAPTER1_NAME).await?;
        AdapterInfo::from_properties(id.to_owned(), OrgBluezAdapter1Properties(&properties))
    }

    /// Get information about the given Bluetooth device.
    pub async fn get_device_info(&self, id: &DeviceId) -> Result<DeviceInfo, BluetoothError> {
        let device = self.device(id);
        let properties = device.get_all(ORG_BLUEZ_DEVICE1_NAME).await?;
        DeviceInfo::from_properties(id.to_owned(), OrgBluezDevice1Properties(&properties))
    }

    /// Power on the given adapter, clear any discovery filter, and start an inquiry scan for
    /// classic-Bluetooth devices.
    pub async fn start_discovery_on_adapter(
        &self,
        adapter_id: &AdapterId,
    ) -> Result<(), BluetoothError> {
        let adapter = self.adapter(adapter_id);
        adapter.set_powered(true).await?;
        adapter.start_discovery().await?;
        Ok(())
    }

    /// Stop scanning for devices on the given adapter.
    pub async fn stop_discovery_on_adapter(
        &self,
        adapter_id: &AdapterId,
    ) -> Result<(), BluetoothError> {
        self.adapter(adapter_id).stop_discovery().await?;
        Ok(())
    }

    /// Set whether the given adapter is powered on.
    pub async fn set_powered(&self, id: &AdapterId, powered: bool) -> Result<(), BluetoothError> {
        self.adapter(id).set_powered(powered).await?;
        Ok(())
    }

    /// Initiate pairing with the given device. Completes once BlueZ reports the pairing as done
    /// (successfully or not); the registered agent (see [`AGENT_OBJECT_PATH`]) is consulted by
    /// BlueZ along the way.
    pub async fn pair(&self, id: &DeviceId) -> Result<(), BluetoothError> {
        Ok(self.device(id).pair().await?)
    }

    /// Mark the given device as trusted, so that BlueZ will auto-authorize reconnections to it
    /// without an agent round-trip.
    pub async fn set_trusted(&self, id: &DeviceId, trusted: bool) -> Result<(), BluetoothError> {
        Ok(self.device(id).set_trusted(trusted).await?)
    }

    /// Connect to the given device's A2DP sink profile specifically (rather than BlueZ's default
    /// `Connect`, which would negotiate whichever profile the device prefers first).
    pub async fn connect_profile(&self, id: &DeviceId) -> Result<(), BluetoothError> {
        Ok(self.device(id).connect_profile(A2DP_SINK_UUID).await?)
    }

    /// Disconnect from the given device.
    pub async fn disconnect(&self, id: &DeviceId) -> Result<(), BluetoothError> {
        Ok(self.device(id).disconnect().await?)
    }

    /// Register this process as the default BlueZ pairing agent at [`AGENT_OBJECT_PATH`], using
    /// the "NoInputNoOutput" capability so that pairing requests are auto-confirmed rather than
    /// surfaced for passkey entry.
    pub async fn register_agent(&self) -> Result<(), BluetoothError> {
        let agent_manager = self.agent_manager();
        agent_manager
            .register_agent(Path::from(AGENT_OBJECT_PATH), "NoInputNoOutput")
            .await?;
        agent_manager
            .request_default_agent(Path::from(AGENT_OBJECT_PATH))
            .await?;
        Ok(())
    }

    /// Unregister this process's pairing agent.
    pub async fn unregister_agent(&self) -> Result<(), BluetoothError> {
        self.agent_manager()
            .unregister_agent(Path::from(AGENT_OBJECT_PATH))
            .await?;
        Ok(())
    }

    /// Get a stream of every adapter and device event BlueZ reports, across all adapters.
    pub async fn event_stream(&self) -> Result<impl Stream<Item = BluetoothEvent>, BluetoothError> {
        let mut message_streams = vec![];
        for match_rule in BluetoothEvent::match_rules(None) {
            let msg_match = self.connection.add_match(match_rule).await?;
            message_streams.push(MessageStream::new(msg_match, self.connection.clone()));
        }
        Ok(select_all(message_streams)
            .flat_map(|message| stream::iter(BluetoothEvent::message_to_events(message))))
    }

    /// Expose the underlying D-Bus connection, for components (such as the GATT server) which
    /// need to export their own objects on the same connection.
    pub fn connection(&self) -> Arc<SyncConnection> {
        self.connection.clone()
    }

    fn bluez_root(&self) -> Proxy<'_, Arc<SyncConnection>> {
        Proxy::new(
            "org.bluez",
            "/",
            DBUS_METHOD_CALL_TIMEOUT,
            self.connection.clone(),
        )
    }

    fn adapter(&self, id: &AdapterId) -> Proxy<'_, Arc<SyncConnection>> {
        Proxy::new(
            "org.bluez",
            id.object_path.clone(),
            DBUS_METHOD_CALL_TIMEOUT,
            self.connection.clone(),
        )
    }

    fn device(&self, id: &DeviceId) -> Proxy<'_, Arc<SyncConnection>> {
        Proxy::new(
            "org.bluez",
            id.object_path.clone(),
            DBUS_METHOD_CALL_TIMEOUT,
            self.connection.clone(),
        )
    }

    fn agent_manager(&self) -> Proxy<'_, Arc<SyncConnection>> {
        Proxy::new(
            "org.bluez",
            "/org/bluez",
            DBUS_METHOD_CALL_TIMEOUT,
            self.connection.clone(),
        )
    }
}
