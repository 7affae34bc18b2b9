//! The external collaborator surface: the underlying RPMsg device (`§1`,
//! `§2`). Endpoint lifecycle, zero-copy TX buffers, name-service matching and
//! device-presence notification are all implemented by whatever real RPMsg
//! stack the socket layer is deployed on; the core only depends on these
//! traits. [`crate::testbus`] provides an in-process implementation used by
//! this crate's own tests and by the demo binary.

use crate::error::SocketError;
use std::sync::Arc;

/// Peer credentials, as carried by a SYNC frame and reported via
/// `SO_PEERCRED`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerCredentials {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

/// A zero-copy TX payload buffer acquired from the bus, filled in place, and
/// either submitted via [`RpmsgEndpoint::send_nocopy`] or dropped to release
/// it back to the bus on error.
pub trait TxBuffer: Send {
    fn as_mut_slice(&mut self) -> &mut [u8];
}

/// One half of an RPMsg channel, bound to a local name and (for a connected
/// socket) a specific remote address.
pub trait RpmsgEndpoint: Send + Sync {
    /// Acquires a TX buffer at least `size` bytes long.
    fn alloc_tx(&self, size: usize) -> Box<dyn TxBuffer>;

    /// Submits the first `used` bytes of `buf` as one frame.
    fn send_nocopy(&self, buf: Box<dyn TxBuffer>, used: usize) -> Result<(), SocketError>;

    /// Tears the endpoint down. Idempotent.
    fn destroy(&self);
}

/// Delivered once per inbound frame, and once when the peer unbinds. The bus
/// guarantees frames are delivered serially per endpoint (`§9`); callbacks
/// must never block (`§5`).
pub trait EndpointCallback: Send + Sync {
    fn on_frame(&self, bytes: &[u8]);
    fn on_unbind(&self);
}

/// Notified when a device matching a client's remote-CPU filter appears or
/// disappears.
pub trait DeviceWatcher: Send + Sync {
    fn device_created(&self);
    fn device_destroyed(&self);
}

/// Notified when a remote peer announces a name matching a listener's
/// prefix/CPU filter. The listener is responsible for creating the endpoint
/// itself (`§4.2`), so this only carries the announcement.
pub trait NameServiceBinder: Send + Sync {
    fn on_announce(&self, announced_name: String, remote_cpu: String);
}

/// An opaque handle to a bus-side registration, used to cancel it later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchToken(pub u64);

pub trait RpmsgBus: Send + Sync {
    /// This machine's CPU name, used to fill `getsockname`'s `rp_cpu`.
    fn local_cpu(&self) -> String;

    /// The size of a single RPMsg transfer unit, bounding how much of a
    /// stream send can go out in one frame.
    fn ipcsize(&self) -> usize;

    /// Registers interest in `remote_cpu`'s appearance/disappearance.
    fn watch_device(&self, remote_cpu: String, watcher: Arc<dyn DeviceWatcher>) -> WatchToken;
    fn unwatch_device(&self, token: WatchToken);

    /// Creates (and binds) a new endpoint named `name`, destined for
    /// `dest_cpu`. Returns the live endpoint; the caller emits SYNC over it
    /// immediately on success (`§4.2`).
    fn create_endpoint(
        &self,
        name: String,
        dest_cpu: String,
        callback: Arc<dyn EndpointCallback>,
    ) -> Result<Arc<dyn RpmsgEndpoint>, SocketError>;

    /// Registers a listener's name-service matcher: any name announced with
    /// prefix `name_prefix` (and, if non-empty, from `cpu_filter`) is routed
    /// to `binder`.
    fn register_listener(
        &self,
        name_prefix: String,
        cpu_filter: String,
        binder: Arc<dyn NameServiceBinder>,
    ) -> WatchToken;
    fn unregister_listener(&self, token: WatchToken);
}
