//! The public operation surface (`§6`): a thin, POSIX-flavored [`Socket`]
//! wrapper around a [`Connection`], grounded on elvis-core's
//! `socket_api::socket::Socket` (construct-then-bind-then-{connect,listen}
//! lifecycle, async `connect`/`accept`/`send`/`recv`, a blocking flag).

use crate::{
    addr::RpmsgAddress,
    bus::{PeerCredentials, RpmsgBus},
    connection::{Connection, Role, SocketType},
    error::SocketError,
    poll::{PollEvents, PollWaiter},
};
use std::{sync::Arc, time::Duration};

/// Mirrors the handful of `AF_RPMSG` socket kinds this crate supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockType {
    Stream,
    Datagram,
}

impl From<SockType> for SocketType {
    fn from(value: SockType) -> Self {
        match value {
            SockType::Stream => SocketType::Stream,
            SockType::Datagram => SocketType::Datagram,
        }
    }
}

/// The per-socket ioctls this transport understands (`§6`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoctlRequest {
    /// Bytes currently queued for reading.
    FionRead,
    /// Bytes of unused send credit.
    FionSpace,
    /// A printable `rpmsg:[...]` path describing this socket's endpoint.
    FiocFilepath,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IoctlValue {
    Count(usize),
    Path(String),
}

/// The getsockopt options this transport understands (`§6`). Anything else
/// is [`SocketError::ENoProtoOpt`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockOpt {
    PeerCred,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockOptValue {
    PeerCred(PeerCredentials),
}

/// Default ring-buffer capacity applied at `setup` when the caller doesn't
/// override it; a compile-time configuration knob (`§6`).
pub const DEFAULT_RING_CAPACITY: usize = 16 * 1024;

/// A POSIX-socket-like handle over an RPMsg link. Every operation here
/// forwards to the underlying [`Connection`]; this layer's job is purely to
/// present the `socket(2)`-family surface.
pub struct Socket {
    conn: Arc<Connection>,
}

impl Socket {
    /// `socket(2)`: allocates a new, unbound, unconnected socket. `caps`
    /// (credentials reported in this socket's own SYNC frames) stand in for
    /// `getsockcaps`'s local half.
    pub fn setup(sock_type: SockType, caps: PeerCredentials, bus: Arc<dyn RpmsgBus>) -> Self {
        Self::setup_with_capacity(sock_type, caps, bus, DEFAULT_RING_CAPACITY)
    }

    pub fn setup_with_capacity(
        sock_type: SockType,
        caps: PeerCredentials,
        bus: Arc<dyn RpmsgBus>,
        ring_capacity: usize,
    ) -> Self {
        Self {
            conn: Connection::new(sock_type.into(), ring_capacity, caps, bus),
        }
    }

    /// `addref`: a second handle onto the same connection (e.g. for a
    /// dup'd file descriptor). Cheap, since the connection is already
    /// behind `Arc`.
    pub fn addref(&self) -> Self {
        Self {
            conn: self.conn.addref(),
        }
    }

    pub fn sockcaps(&self) -> PeerCredentials {
        self.conn.peer_credentials()
    }

    pub fn set_blocking(&self, blocking: bool) {
        self.conn.set_blocking(blocking);
    }

    pub fn set_recv_timeout(&self, timeout: Option<Duration>) {
        self.conn.set_rcvtimeo(timeout);
    }

    pub fn set_send_timeout(&self, timeout: Option<Duration>) {
        self.conn.set_sndtimeo(timeout);
    }

    pub fn bind(&self, addr: RpmsgAddress) -> Result<(), SocketError> {
        self.conn.bind(addr)
    }

    pub fn getsockname(&self) -> Option<RpmsgAddress> {
        self.conn.getsockname()
    }

    pub fn getconnname(&self) -> Option<RpmsgAddress> {
        self.conn.getpeername()
    }

    pub fn listen(&self, backlog: usize) -> Result<(), SocketError> {
        self.conn.listen(backlog)
    }

    pub async fn connect(&self, remote: RpmsgAddress) -> Result<(), SocketError> {
        self.conn.connect(remote).await
    }

    /// `accept(2)`: returns a fresh [`Socket`] for the newly accepted
    /// connection, plus its peer's address.
    pub async fn accept(&self) -> Result<(Socket, RpmsgAddress), SocketError> {
        let (child, peer) = self.conn.accept().await?;
        Ok((Socket { conn: child }, peer))
    }

    pub async fn sendmsg(&self, data: &[u8]) -> Result<usize, SocketError> {
        self.conn.sendmsg(data, None).await
    }

    /// `sendmsg` with a destination (`§4.3`): implicitly connects first if
    /// the socket isn't already connected, matching a `sendto`-style call.
    pub async fn sendto(&self, data: &[u8], dest: RpmsgAddress) -> Result<usize, SocketError> {
        self.conn.sendmsg(data, Some(dest)).await
    }

    /// `recvmsg`: the delivered bytes plus the peer address they arrived
    /// from. A bound-but-unconnected `SOCK_DGRAM` socket implicitly
    /// connects to whichever peer shows up first (`§4.4`).
    pub async fn recvmsg(&self, max_len: usize) -> Result<(Vec<u8>, RpmsgAddress), SocketError> {
        self.conn.recv(max_len).await
    }

    /// `poll(2)` with `setup=false`: the event bits currently satisfied.
    pub fn poll(&self) -> PollEvents {
        self.conn.poll_events()
    }

    /// `poll(2)` with `setup=true`: registers `waiter` into the connection's
    /// poll-fd table, returning the slot to later `poll_clear`.
    pub fn poll_setup(&self, waiter: Arc<dyn PollWaiter>) -> Result<usize, SocketError> {
        self.conn.poll_setup(waiter)
    }

    pub fn poll_clear(&self, slot: usize) {
        self.conn.poll_clear(slot)
    }

    pub fn ioctl(&self, request: IoctlRequest) -> Result<IoctlValue, SocketError> {
        match request {
            IoctlRequest::FionRead => Ok(IoctlValue::Count(self.conn.rx_bytes_used())),
            IoctlRequest::FionSpace => Ok(IoctlValue::Count(self.conn.send_space())),
            IoctlRequest::FiocFilepath => self.conn.filepath().map(IoctlValue::Path),
        }
    }

    pub fn getsockopt(&self, opt: SockOpt) -> Result<SockOptValue, SocketError> {
        match opt {
            SockOpt::PeerCred => Ok(SockOptValue::PeerCred(self.conn.peer_credentials())),
        }
    }

    /// Whether this handle still refers to a listener that has been closed
    /// (`accept` on it now fails with `ECONNRESET` rather than blocking).
    pub fn is_listening(&self) -> bool {
        matches!(self.conn.role(), Role::Listener { .. })
    }

    pub fn close(&self) {
        self.conn.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testbus::InMemoryBus;

    fn creds() -> PeerCredentials {
        PeerCredentials { pid: 1, uid: 1000, gid: 1000 }
    }

    #[tokio::test]
    async fn bind_listen_connect_accept_round_trip() {
        let bus = InMemoryBus::shared("cpuA", "cpuB");

        let server = Socket::setup(SockType::Stream, creds(), bus.side("cpuB"));
        server.bind(RpmsgAddress::new("chat", "")).unwrap();
        server.listen(4).unwrap();

        let client = Socket::setup(SockType::Stream, creds(), bus.side("cpuA"));
        client.connect(RpmsgAddress::new("chat", "cpuB")).await.unwrap();

        let (accepted, peer) = server.accept().await.unwrap();
        assert_eq!(peer.cpu, "cpuA");

        client.sendmsg(b"ping").await.unwrap();
        let (received, from) = accepted.recvmsg(16).await.unwrap();
        assert_eq!(received, b"ping");
        assert_eq!(from.cpu, "cpuA");
    }

    #[tokio::test]
    async fn ioctl_reports_queued_bytes_and_credit() {
        let bus = InMemoryBus::shared("cpuA", "cpuB");
        let server = Socket::setup(SockType::Stream, creds(), bus.side("cpuB"));
        server.bind(RpmsgAddress::new("chat", "")).unwrap();
        server.listen(4).unwrap();

        let client = Socket::setup(SockType::Stream, creds(), bus.side("cpuA"));
        client.connect(RpmsgAddress::new("chat", "cpuB")).await.unwrap();
        let (accepted, _) = server.accept().await.unwrap();

        assert!(matches!(client.ioctl(IoctlRequest::FionSpace).unwrap(), IoctlValue::Count(n) if n > 0));
        client.sendmsg(b"hello").await.unwrap();
        assert_eq!(accepted.ioctl(IoctlRequest::FionRead).unwrap(), IoctlValue::Count(5));
    }

    #[tokio::test]
    async fn fioc_filepath_reports_both_endpoints() {
        let bus = InMemoryBus::shared("cpuA", "cpuB");
        let server = Socket::setup(SockType::Stream, creds(), bus.side("cpuB"));
        server.bind(RpmsgAddress::new("chat", "")).unwrap();
        server.listen(4).unwrap();

        let client = Socket::setup(SockType::Stream, creds(), bus.side("cpuA"));
        client.connect(RpmsgAddress::new("chat", "cpuB")).await.unwrap();
        let (accepted, _) = server.accept().await.unwrap();

        let IoctlValue::Path(server_path) = accepted.ioctl(IoctlRequest::FiocFilepath).unwrap() else {
            panic!("expected a path");
        };
        assert!(server_path.starts_with("rpmsg:[cpuB:"));
        assert!(server_path.contains("<->cpuA"));

        let IoctlValue::Path(client_path) = client.ioctl(IoctlRequest::FiocFilepath).unwrap() else {
            panic!("expected a path");
        };
        assert!(client_path.starts_with("rpmsg:[cpuA:"));
        assert!(client_path.contains("<->cpuB"));
    }

    #[tokio::test]
    async fn getsockopt_reports_peer_credentials() {
        let bus = InMemoryBus::shared("cpuA", "cpuB");
        let server_creds = PeerCredentials { pid: 42, uid: 7, gid: 7 };
        let server = Socket::setup(SockType::Stream, server_creds, bus.side("cpuB"));
        server.bind(RpmsgAddress::new("chat", "")).unwrap();
        server.listen(4).unwrap();

        let client = Socket::setup(SockType::Stream, creds(), bus.side("cpuA"));
        client.connect(RpmsgAddress::new("chat", "cpuB")).await.unwrap();

        let SockOptValue::PeerCred(cred) = client.getsockopt(SockOpt::PeerCred).unwrap();
        assert_eq!(cred.pid, 42);
    }

    #[tokio::test]
    async fn datagram_server_cannot_listen_but_can_implicitly_connect() {
        let bus = InMemoryBus::shared("cpuA", "cpuB");
        let server = Socket::setup(SockType::Datagram, creds(), bus.side("cpuB"));
        server.bind(RpmsgAddress::new("weather", "")).unwrap();
        assert_eq!(server.listen(4).unwrap_err(), SocketError::ENoSys);

        let client = Socket::setup(SockType::Datagram, creds(), bus.side("cpuA"));

        let server_task = tokio::spawn(async move { server.recvmsg(32).await });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        client
            .sendto(b"sunny", RpmsgAddress::new("weather", "cpuB"))
            .await
            .unwrap();

        let (received, from) = server_task.await.unwrap().unwrap();
        assert_eq!(received, b"sunny");
        assert_eq!(from.cpu, "cpuA");
    }

    #[tokio::test]
    async fn close_defers_until_every_addref_d_handle_closes() {
        let bus = InMemoryBus::shared("cpuA", "cpuB");
        let server = Socket::setup(SockType::Stream, creds(), bus.side("cpuB"));
        server.bind(RpmsgAddress::new("chat", "")).unwrap();
        server.listen(4).unwrap();

        let client = Socket::setup(SockType::Stream, creds(), bus.side("cpuA"));
        client.connect(RpmsgAddress::new("chat", "cpuB")).await.unwrap();
        let (accepted, _) = server.accept().await.unwrap();

        let dup = accepted.addref();
        accepted.close();
        // The duplicate handle keeps the connection alive: a send still reaches it.
        client.sendmsg(b"still alive").await.unwrap();
        let (received, _) = dup.recvmsg(32).await.unwrap();
        assert_eq!(received, b"still alive");

        dup.close();
        assert!(client.poll().contains(PollEvents::HUP));
    }
}
