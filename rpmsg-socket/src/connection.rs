//! The [`Connection`] state machine (`§3`, `§4`): the one type instantiated
//! in each of the roles described in `§2`, carrying the framing protocol,
//! credit-based flow control, the accept pipeline, and safe teardown.

use crate::{
    addr::{format_suffix, next_connection_id, wire_name, RpmsgAddress},
    bus::{DeviceWatcher, EndpointCallback, NameServiceBinder, PeerCredentials, RpmsgBus, RpmsgEndpoint, WatchToken},
    error::SocketError,
    event::Event,
    frame::{DataHeader, SyncFrame, CMD_DATA, CMD_SYNC, DATA_HEADER_LEN, DGRAM_LEN_PREFIX},
    poll::{PollEvents, PollTable, PollWaiter, DEFAULT_POLL_WAITERS},
    ring::RingBuffer,
};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    time::Duration,
};
use tokio::sync::oneshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketType {
    Stream,
    Datagram,
}

/// The five roles a [`Connection`] can be in (`§2`, `§9`). Replaces the
/// original driver's overloaded `backlog` integer (`>0` listener capacity,
/// `-1` listener-closed, `-2` accepted, `0` client/unbound) with a proper
/// tagged variant, so role-specific data (the backlog count, the accept
/// queue) is only reachable when it's actually valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unbound,
    Client,
    Listener { backlog: usize },
    ListenerClosed,
    Accepted,
}

struct SendState {
    /// The peer's advertised RX capacity; zero until SYNC is received, the
    /// sentinel for "not yet connected".
    sendsize: u32,
    sendpos: u32,
    ackpos: u32,
}

impl SendState {
    fn credit(&self) -> u32 {
        self.sendsize.saturating_sub(self.sendpos.wrapping_sub(self.ackpos))
    }
}

/// A one-shot rendezvous between a blocked reader and the endpoint callback.
/// Replaces the original driver's raw `recvdata`/`recvlen` pointer pair with
/// a typed, atomically-taken slot (`§9`): arming it is storing the
/// [`oneshot::Sender`] half, and the callback's `Option::take` is the atomic
/// take.
struct DirectTarget {
    max_len: usize,
    reply: oneshot::Sender<DeliveredData>,
}

struct DeliveredData {
    bytes: Vec<u8>,
}

struct RecvState {
    ring: RingBuffer,
    recvpos: u32,
    direct: Option<DirectTarget>,
}

struct ConnInner {
    role: Mutex<Role>,
    sock_type: SocketType,
    local: RwLock<Option<RpmsgAddress>>,
    remote: RwLock<Option<RpmsgAddress>>,
    /// The exact `"sk:" + rp_name [+ suffix]` name this connection's own
    /// endpoint was created under, if any — used to report `FIOC_FILEPATH`
    /// without reconstructing it from `remote` (which, for a client, never
    /// carries the client-generated suffix).
    wire_name: RwLock<Option<String>>,
    endpoint: RwLock<Option<Arc<dyn RpmsgEndpoint>>>,
    unbind: AtomicBool,

    send: Mutex<SendState>,
    sendsem: Event,

    recv: Mutex<RecvState>,
    recvsem: Event,

    /// Mirrors `recv.recvpos` so the send path can piggyback a credit ack
    /// without taking `recvlock`; `recvpos` only ever increases, so a racy
    /// read is harmless (`§5`).
    recvpos_hint: AtomicU32,
    /// `recvpos` at the last credit refund, likewise lock-free for the same
    /// reason.
    lastpos: AtomicU32,

    ring_capacity: usize,
    /// Shared-ownership count between a socket's own handle and any
    /// `addref`'d duplicate; `close` is only observed on the handle that
    /// drops the count to zero (`§3`, `§4.8`).
    refs: std::sync::atomic::AtomicUsize,
    credentials: RwLock<PeerCredentials>,
    local_credentials: PeerCredentials,

    poll: Mutex<PollTable>,

    /// Listener only: children awaiting `accept`.
    accept_queue: Mutex<VecDeque<Arc<Connection>>>,
    accept_sem: Event,

    device_watch: Mutex<Option<WatchToken>>,
    listen_watch: Mutex<Option<WatchToken>>,

    bus: Arc<dyn RpmsgBus>,
    is_blocking: AtomicBool,
    rcvtimeo: RwLock<Option<Duration>>,
    sndtimeo: RwLock<Option<Duration>>,
}

/// A Connection is always handled behind `Arc` so it can be registered as an
/// `EndpointCallback`/`DeviceWatcher`/`NameServiceBinder` with the bus while
/// application code also holds it.
pub struct Connection {
    inner: ConnInner,
}

impl Connection {
    pub fn new(sock_type: SocketType, ring_capacity: usize, local_credentials: PeerCredentials, bus: Arc<dyn RpmsgBus>) -> Arc<Self> {
        Arc::new(Self {
            inner: ConnInner {
                role: Mutex::new(Role::Unbound),
                sock_type,
                local: RwLock::new(None),
                remote: RwLock::new(None),
                wire_name: RwLock::new(None),
                endpoint: RwLock::new(None),
                unbind: AtomicBool::new(false),
                send: Mutex::new(SendState { sendsize: 0, sendpos: 0, ackpos: 0 }),
                sendsem: Event::new(),
                recv: Mutex::new(RecvState {
                    ring: RingBuffer::new(ring_capacity),
                    recvpos: 0,
                    direct: None,
                }),
                recvsem: Event::new(),
                recvpos_hint: AtomicU32::new(0),
                lastpos: AtomicU32::new(0),
                ring_capacity,
                refs: std::sync::atomic::AtomicUsize::new(1),
                credentials: RwLock::new(PeerCredentials::default()),
                local_credentials,
                poll: Mutex::new(PollTable::new(DEFAULT_POLL_WAITERS)),
                accept_queue: Mutex::new(VecDeque::new()),
                accept_sem: Event::new(),
                device_watch: Mutex::new(None),
                listen_watch: Mutex::new(None),
                bus,
                is_blocking: AtomicBool::new(true),
                rcvtimeo: RwLock::new(None),
                sndtimeo: RwLock::new(None),
            },
        })
    }

    pub fn set_blocking(&self, blocking: bool) {
        self.inner.is_blocking.store(blocking, Ordering::Release);
    }

    pub fn is_blocking(&self) -> bool {
        self.inner.is_blocking.load(Ordering::Acquire)
    }

    pub fn set_rcvtimeo(&self, timeout: Option<Duration>) {
        *self.inner.rcvtimeo.write().unwrap() = timeout;
    }

    pub fn set_sndtimeo(&self, timeout: Option<Duration>) {
        *self.inner.sndtimeo.write().unwrap() = timeout;
    }

    pub fn sock_type(&self) -> SocketType {
        self.inner.sock_type
    }

    pub fn role(&self) -> Role {
        *self.inner.role.lock().unwrap()
    }

    /// A second handle onto the same connection (`addref`, `§3`). `close`
    /// only tears down once every handle has called it.
    pub fn addref(self: &Arc<Self>) -> Arc<Self> {
        self.inner.refs.fetch_add(1, Ordering::Relaxed);
        self.clone()
    }

    fn is_connected(&self) -> bool {
        self.inner.send.lock().unwrap().sendsize > 0
    }

    fn is_peer_gone(&self) -> bool {
        self.inner.unbind.load(Ordering::Acquire) || self.inner.endpoint.read().unwrap().is_none()
    }

    fn notify_poll(&self, events: PollEvents) {
        self.inner.poll.lock().unwrap().notify_all(events);
    }

    // ---------------------------------------------------------------- bind

    pub fn bind(self: &Arc<Self>, addr: RpmsgAddress) -> Result<(), SocketError> {
        let role = *self.inner.role.lock().unwrap();
        if !matches!(role, Role::Unbound) {
            return Err(SocketError::EInval);
        }
        *self.inner.local.write().unwrap() = Some(addr);
        Ok(())
    }

    pub fn getsockname(&self) -> Option<RpmsgAddress> {
        let mut addr = self.inner.local.read().unwrap().clone()?;
        addr.cpu = self.inner.bus.local_cpu();
        Some(addr)
    }

    pub fn getpeername(&self) -> Option<RpmsgAddress> {
        self.inner.remote.read().unwrap().clone()
    }

    // ------------------------------------------------------------- connect

    pub async fn connect(self: &Arc<Self>, remote: RpmsgAddress) -> Result<(), SocketError> {
        {
            let role = *self.inner.role.lock().unwrap();
            if !matches!(role, Role::Unbound) {
                return Err(SocketError::EIsConn);
            }
        }
        *self.inner.role.lock().unwrap() = Role::Client;
        *self.inner.remote.write().unwrap() = Some(remote.clone());
        self.inner.recv.lock().unwrap().ring.resize(self.inner.ring_capacity);

        let suffix = format_suffix(next_connection_id());
        let local_name = wire_name(&remote.name, Some(&suffix))?;

        let watcher: Arc<dyn DeviceWatcher> = Arc::new(ClientWatcher {
            conn: Arc::downgrade(self),
            local_name,
            remote: remote.clone(),
        });
        let token = self.inner.bus.watch_device(remote.cpu.clone(), watcher);
        *self.inner.device_watch.lock().unwrap() = Some(token);

        if !self.is_blocking() {
            return Err(SocketError::EInProgress);
        }

        let timeout = *self.inner.rcvtimeo.read().unwrap();
        if !self.inner.sendsem.wait_timeout(timeout).await {
            return Err(SocketError::EAgain);
        }
        if self.is_peer_gone() {
            return Err(SocketError::EConnReset);
        }
        Ok(())
    }

    fn emit_sync(self: &Arc<Self>) {
        let Some(ep) = self.inner.endpoint.read().unwrap().clone() else {
            return;
        };
        let frame = SyncFrame {
            size: self.inner.ring_capacity as u32,
            pid: self.inner.local_credentials.pid,
            uid: self.inner.local_credentials.uid,
            gid: self.inner.local_credentials.gid,
        };
        let bytes = frame.encode();
        let mut tx = ep.alloc_tx(bytes.len());
        tx.as_mut_slice()[..bytes.len()].copy_from_slice(&bytes);
        let _ = ep.send_nocopy(tx, bytes.len());
    }

    // -------------------------------------------------------------- listen

    pub fn listen(self: &Arc<Self>, backlog: usize) -> Result<(), SocketError> {
        if self.inner.sock_type == SocketType::Datagram {
            return Err(SocketError::ENoSys);
        }
        if backlog == 0 {
            return Err(SocketError::EInval);
        }
        let local = self.inner.local.read().unwrap().clone().ok_or(SocketError::EInval)?;
        {
            let role = *self.inner.role.lock().unwrap();
            if !matches!(role, Role::Unbound) {
                return Err(SocketError::EInval);
            }
        }
        *self.inner.role.lock().unwrap() = Role::Listener { backlog };

        let prefix = wire_name(&local.name, None)?;
        let binder: Arc<dyn NameServiceBinder> = Arc::new(ListenerBinder {
            conn: Arc::downgrade(self),
        });
        let token = self
            .inner
            .bus
            .register_listener(prefix, local.cpu.clone(), binder);
        *self.inner.listen_watch.lock().unwrap() = Some(token);
        Ok(())
    }

    /// Invoked by [`ListenerBinder`] when the bus announces a matching name.
    fn on_announce(self: &Arc<Self>, announced_name: String, remote_cpu: String) {
        let backlog = match *self.inner.role.lock().unwrap() {
            Role::Listener { backlog } => backlog,
            _ => return,
        };

        let child = Connection::new(
            self.inner.sock_type,
            self.inner.ring_capacity,
            self.inner.local_credentials,
            self.inner.bus.clone(),
        );
        *child.inner.role.lock().unwrap() = Role::Client; // provisional, until accepted
        let local = self.inner.local.read().unwrap().clone();
        *child.inner.local.write().unwrap() = local;
        *child.inner.remote.write().unwrap() = Some(RpmsgAddress::new(
            announced_name.strip_prefix("sk:").unwrap_or(&announced_name).to_string(),
            remote_cpu.clone(),
        ));

        let callback: Arc<dyn EndpointCallback> = child.clone();
        let endpoint = match self.inner.bus.create_endpoint(announced_name.clone(), remote_cpu, callback) {
            Ok(ep) => ep,
            Err(_) => {
                tracing::warn!(
                    name = %announced_name,
                    "rpmsg socket: endpoint allocation failed accepting connection (ENOMEM)"
                );
                return;
            }
        };
        *child.inner.wire_name.write().unwrap() = Some(announced_name);
        *child.inner.endpoint.write().unwrap() = Some(endpoint);
        child.emit_sync();

        let mut queue = self.inner.accept_queue.lock().unwrap();
        if queue.len() >= backlog {
            drop(queue);
            if let Some(ep) = child.inner.endpoint.write().unwrap().take() {
                ep.destroy();
            }
            return;
        }
        queue.push_back(child);
        drop(queue);
        self.inner.accept_sem.post();
        self.notify_poll(PollEvents::IN);
    }

    /// Server-less datagram rendezvous (`§4.4`): a bound-but-unconnected
    /// `SOCK_DGRAM` socket waits for the first peer to name-service-match its
    /// bound name and adopts it directly, without a backlog or an `accept`
    /// step (`listen` itself is [`SocketError::ENoSys`] for datagrams).
    async fn passive_connect(self: &Arc<Self>) -> Result<(), SocketError> {
        {
            let role = *self.inner.role.lock().unwrap();
            if !matches!(role, Role::Unbound) {
                return Err(SocketError::EIsConn);
            }
        }
        let local = self.inner.local.read().unwrap().clone().ok_or(SocketError::ENotConn)?;

        let prefix = wire_name(&local.name, None)?;
        let binder: Arc<dyn NameServiceBinder> = Arc::new(PassiveBinder {
            conn: Arc::downgrade(self),
        });
        let token = self.inner.bus.register_listener(prefix, local.cpu.clone(), binder);
        *self.inner.listen_watch.lock().unwrap() = Some(token);

        if !self.is_blocking() {
            return Err(SocketError::EAgain);
        }
        let timeout = *self.inner.rcvtimeo.read().unwrap();
        if !self.inner.sendsem.wait_timeout(timeout).await {
            return Err(SocketError::EAgain);
        }
        if self.is_peer_gone() {
            return Err(SocketError::EConnReset);
        }
        Ok(())
    }

    /// Invoked by [`PassiveBinder`] on the first matching announce. Adopts
    /// the announcer directly as this connection's peer, rather than
    /// spawning a child the way [`Connection::on_announce`] does for
    /// listeners.
    fn on_passive_announce(self: &Arc<Self>, announced_name: String, remote_cpu: String) {
        {
            let role = *self.inner.role.lock().unwrap();
            if !matches!(role, Role::Unbound) {
                return;
            }
        }
        *self.inner.role.lock().unwrap() = Role::Client;
        *self.inner.remote.write().unwrap() = Some(RpmsgAddress::new(
            announced_name.strip_prefix("sk:").unwrap_or(&announced_name).to_string(),
            remote_cpu.clone(),
        ));

        let callback: Arc<dyn EndpointCallback> = self.clone();
        let endpoint = match self.inner.bus.create_endpoint(announced_name.clone(), remote_cpu, callback) {
            Ok(ep) => ep,
            Err(_) => {
                tracing::warn!(
                    name = %announced_name,
                    "rpmsg socket: endpoint allocation failed on passive connect (ENOMEM)"
                );
                self.inner.unbind.store(true, Ordering::Release);
                self.inner.sendsem.post();
                self.notify_poll(PollEvents::OUT | PollEvents::HUP);
                return;
            }
        };
        *self.inner.wire_name.write().unwrap() = Some(announced_name);
        *self.inner.endpoint.write().unwrap() = Some(endpoint);
        self.emit_sync();

        if let Some(token) = self.inner.listen_watch.lock().unwrap().take() {
            self.inner.bus.unregister_listener(token);
        }
    }

    // -------------------------------------------------------------- accept

    pub async fn accept(self: &Arc<Self>) -> Result<(Arc<Connection>, RpmsgAddress), SocketError> {
        loop {
            {
                let role = *self.inner.role.lock().unwrap();
                if matches!(role, Role::ListenerClosed) {
                    return Err(SocketError::EConnReset);
                }
            }

            if let Some(child) = self.inner.accept_queue.lock().unwrap().pop_front() {
                *child.inner.role.lock().unwrap() = Role::Accepted;

                let watcher: Arc<dyn DeviceWatcher> = Arc::new(AcceptedWatcher {
                    conn: Arc::downgrade(&child),
                });
                let token = child.inner.bus.watch_device(
                    child.inner.remote.read().unwrap().as_ref().map(|r| r.cpu.clone()).unwrap_or_default(),
                    watcher,
                );
                *child.inner.device_watch.lock().unwrap() = Some(token);

                if !child.is_connected() {
                    let timeout = *child.inner.rcvtimeo.read().unwrap();
                    child.inner.sendsem.wait_timeout(timeout).await;
                }

                let peer = child.inner.remote.read().unwrap().clone().ok_or(SocketError::EConnReset)?;
                return Ok((child, peer));
            }

            if !self.is_blocking() {
                return Err(SocketError::EAgain);
            }
            self.inner.accept_sem.wait().await;
        }
    }

    // ------------------------------------------------------------- sendmsg

    /// `sendmsg` (`§4.3`): if the socket isn't connected and `dest` names a
    /// destination, performs a full `connect` first — the implicit-connect
    /// pattern a `sendto`-style call relies on. With no destination and no
    /// existing connection, fails `ENOTCONN`.
    pub async fn sendmsg(self: &Arc<Self>, data: &[u8], dest: Option<RpmsgAddress>) -> Result<usize, SocketError> {
        if !self.is_connected() {
            let addr = dest.ok_or(SocketError::ENotConn)?;
            self.connect(addr).await?;
        }
        match self.inner.sock_type {
            SocketType::Stream => self.send_stream(data).await,
            SocketType::Datagram => self.send_datagram(data).await,
        }
    }

    async fn send_stream(self: &Arc<Self>, data: &[u8]) -> Result<usize, SocketError> {
        if !self.is_connected() {
            return Err(SocketError::ENotConn);
        }
        let mut written = 0usize;
        while written < data.len() {
            let Some(ep) = self.inner.endpoint.read().unwrap().clone() else {
                return if written > 0 { Ok(written) } else { Err(SocketError::EConnReset) };
            };
            let ipcsize = self.inner.bus.ipcsize();
            let mut tx = ep.alloc_tx(ipcsize);

            // `send` is held from the credit check through `send_nocopy`'s
            // return (`§5`): fill-and-submit must be atomic with the credit
            // accounting or two callers sharing an `addref`'d connection can
            // both commit into the same window.
            let mut send = self.inner.send.lock().unwrap();
            let block = (send.credit() as usize)
                .min(data.len() - written)
                .min(ipcsize.saturating_sub(DATA_HEADER_LEN));
            if block == 0 {
                drop(send);
                if self.is_peer_gone() {
                    return if written > 0 { Ok(written) } else { Err(SocketError::EConnReset) };
                }
                if !self.is_blocking() {
                    return if written > 0 { Ok(written) } else { Err(SocketError::EAgain) };
                }
                let timeout = *self.inner.sndtimeo.read().unwrap();
                if !self.inner.sendsem.wait_timeout(timeout).await {
                    return if written > 0 { Ok(written) } else { Err(SocketError::EAgain) };
                }
                if self.is_peer_gone() {
                    return if written > 0 { Ok(written) } else { Err(SocketError::EConnReset) };
                }
                continue;
            }

            let recvpos = self.inner.recvpos_hint.load(Ordering::Acquire);
            let header = DataHeader { pos: recvpos, len: block as u32 };
            self.inner.lastpos.store(recvpos, Ordering::Release);

            let buf = tx.as_mut_slice();
            buf[..DATA_HEADER_LEN].copy_from_slice(&header.encode());
            buf[DATA_HEADER_LEN..DATA_HEADER_LEN + block]
                .copy_from_slice(&data[written..written + block]);
            send.sendpos = send.sendpos.wrapping_add(block as u32);
            let total = DATA_HEADER_LEN + block;

            match ep.send_nocopy(tx, total) {
                Ok(()) => {
                    drop(send);
                    written += block;
                }
                Err(e) => {
                    send.sendpos = send.sendpos.wrapping_sub(block as u32);
                    drop(send);
                    return if written > 0 { Ok(written) } else { Err(e) };
                }
            }
        }
        Ok(written)
    }

    async fn send_datagram(self: &Arc<Self>, data: &[u8]) -> Result<usize, SocketError> {
        if !self.is_connected() {
            return Err(SocketError::ENotConn);
        }
        let needed = DATA_HEADER_LEN + DGRAM_LEN_PREFIX + data.len();
        loop {
            let Some(ep) = self.inner.endpoint.read().unwrap().clone() else {
                return Err(SocketError::EConnReset);
            };
            let mut tx = ep.alloc_tx(needed);

            // Held across fill-and-submit for the same reason as
            // `send_stream` above: the credit check and the `sendpos`
            // commit must not straddle a lock release.
            let mut send = self.inner.send.lock().unwrap();
            if needed as u32 > send.sendsize {
                return Err(SocketError::EFBig);
            }
            if (send.credit() as usize) < DGRAM_LEN_PREFIX + data.len() {
                drop(send);
                if self.is_peer_gone() {
                    return Err(SocketError::EConnReset);
                }
                if !self.is_blocking() {
                    return Err(SocketError::EAgain);
                }
                let timeout = *self.inner.sndtimeo.read().unwrap();
                if !self.inner.sendsem.wait_timeout(timeout).await {
                    return Err(SocketError::EAgain);
                }
                continue;
            }

            let recvpos = self.inner.recvpos_hint.load(Ordering::Acquire);
            let wire_len = (DGRAM_LEN_PREFIX + data.len()) as u32;
            let header = DataHeader { pos: recvpos, len: wire_len };
            self.inner.lastpos.store(recvpos, Ordering::Release);

            let buf = tx.as_mut_slice();
            buf[..DATA_HEADER_LEN].copy_from_slice(&header.encode());
            buf[DATA_HEADER_LEN..DATA_HEADER_LEN + DGRAM_LEN_PREFIX]
                .copy_from_slice(&(data.len() as u32).to_ne_bytes());
            buf[DATA_HEADER_LEN + DGRAM_LEN_PREFIX..DATA_HEADER_LEN + DGRAM_LEN_PREFIX + data.len()]
                .copy_from_slice(data);
            send.sendpos = send.sendpos.wrapping_add(wire_len);

            return match ep.send_nocopy(tx, DATA_HEADER_LEN + DGRAM_LEN_PREFIX + data.len()) {
                Ok(()) => {
                    drop(send);
                    Ok(data.len())
                }
                Err(e) => {
                    send.sendpos = send.sendpos.wrapping_sub(wire_len);
                    drop(send);
                    Err(e)
                }
            };
        }
    }

    // ------------------------------------------------------------- recvmsg

    /// `recvmsg` (`§4.4`): returns the delivered bytes alongside the peer
    /// address they came from. A bound-but-unconnected `SOCK_DGRAM` socket
    /// implicitly connects first, adopting whichever peer announces itself
    /// next (the server-less datagram pattern).
    pub async fn recv(self: &Arc<Self>, max_len: usize) -> Result<(Vec<u8>, RpmsgAddress), SocketError> {
        if !self.is_connected() {
            let can_implicit_connect = self.inner.sock_type == SocketType::Datagram
                && matches!(*self.inner.role.lock().unwrap(), Role::Unbound)
                && self.inner.local.read().unwrap().is_some();
            if can_implicit_connect {
                self.passive_connect().await?;
            } else {
                return Err(SocketError::ENotConn);
            }
        }
        let peer = || self.inner.remote.read().unwrap().clone().unwrap_or_else(|| RpmsgAddress::new("", ""));
        {
            let mut recv = self.inner.recv.lock().unwrap();
            if !recv.ring.is_empty() {
                let delivered = self.drain_ring_locked(&mut recv, max_len);
                drop(recv);
                self.after_consume();
                return Ok((delivered, peer()));
            }
        }

        if self.is_peer_gone() {
            return Ok((Vec::new(), peer()));
        }
        if !self.is_blocking() {
            return Err(SocketError::EAgain);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut recv = self.inner.recv.lock().unwrap();
            if !recv.ring.is_empty() {
                let delivered = self.drain_ring_locked(&mut recv, max_len);
                drop(recv);
                self.after_consume();
                return Ok((delivered, peer()));
            }
            recv.direct = Some(DirectTarget { max_len, reply: tx });
        }

        let timeout = *self.inner.rcvtimeo.read().unwrap();
        let outcome = match timeout {
            None => rx.await.ok(),
            Some(dur) => tokio::time::timeout(dur, rx).await.ok().and_then(|r| r.ok()),
        };

        match outcome {
            Some(delivered) => {
                if delivered.bytes.is_empty() && self.is_peer_gone() {
                    return Err(SocketError::EConnReset);
                }
                self.after_consume();
                Ok((delivered.bytes, peer()))
            }
            None => {
                self.inner.recv.lock().unwrap().direct = None;
                if self.is_peer_gone() {
                    Err(SocketError::EConnReset)
                } else {
                    Err(SocketError::EAgain)
                }
            }
        }
    }

    fn drain_ring_locked(&self, recv: &mut RecvState, max_len: usize) -> Vec<u8> {
        match self.inner.sock_type {
            SocketType::Stream => {
                let n = max_len.min(recv.ring.len());
                let mut out = vec![0u8; n];
                recv.ring.pop_into(&mut out);
                recv.recvpos = recv.recvpos.wrapping_add(n as u32);
                self.inner.recvpos_hint.store(recv.recvpos, Ordering::Release);
                out
            }
            SocketType::Datagram => {
                let header = recv.ring.peek(0, DGRAM_LEN_PREFIX);
                if header.len() < DGRAM_LEN_PREFIX {
                    return Vec::new();
                }
                let datalen = u32::from_ne_bytes(header.try_into().unwrap()) as usize;
                let body = recv.ring.peek(DGRAM_LEN_PREFIX, datalen.min(max_len));
                recv.ring.skip(DGRAM_LEN_PREFIX + datalen);
                recv.recvpos = recv.recvpos.wrapping_add((DGRAM_LEN_PREFIX + datalen) as u32);
                self.inner.recvpos_hint.store(recv.recvpos, Ordering::Release);
                body
            }
        }
    }

    /// Post-read credit refund (`§4.6`): issues a zero-payload DATA frame
    /// once more than half the ring has drained since the last refund.
    fn after_consume(self: &Arc<Self>) {
        let recvpos = self.inner.recvpos_hint.load(Ordering::Acquire);
        let lastpos = self.inner.lastpos.load(Ordering::Acquire);
        if recvpos.wrapping_sub(lastpos) as usize <= self.inner.ring_capacity / 2 {
            return;
        }
        let Some(ep) = self.inner.endpoint.read().unwrap().clone() else {
            return;
        };
        self.inner.lastpos.store(recvpos, Ordering::Release);
        let header = DataHeader { pos: recvpos, len: 0 };
        let bytes = header.encode();
        let mut tx = ep.alloc_tx(bytes.len());
        tx.as_mut_slice()[..bytes.len()].copy_from_slice(&bytes);
        let _ = ep.send_nocopy(tx, bytes.len());
    }

    // --------------------------------------------------------- readiness

    pub fn poll_events(&self) -> PollEvents {
        let role = *self.inner.role.lock().unwrap();
        match role {
            Role::ListenerClosed => PollEvents::HUP,
            Role::Listener { .. } => {
                if self.inner.accept_queue.lock().unwrap().is_empty() {
                    PollEvents::empty()
                } else {
                    PollEvents::IN
                }
            }
            Role::Client | Role::Accepted => {
                let mut events = PollEvents::empty();
                if self.is_peer_gone() {
                    events |= PollEvents::HUP;
                }
                if self.inner.send.lock().unwrap().credit() > 0 {
                    events |= PollEvents::OUT;
                }
                if !self.inner.recv.lock().unwrap().ring.is_empty() {
                    events |= PollEvents::IN;
                }
                events
            }
            Role::Unbound => {
                if self.is_peer_gone() {
                    PollEvents::HUP
                } else {
                    PollEvents::empty()
                }
            }
        }
    }

    pub fn poll_setup(&self, waiter: Arc<dyn PollWaiter>) -> Result<usize, SocketError> {
        self.inner.poll.lock().unwrap().setup(waiter)
    }

    pub fn poll_clear(&self, slot: usize) {
        self.inner.poll.lock().unwrap().clear(slot);
    }

    // ----------------------------------------------------------- ioctl

    pub fn rx_bytes_used(&self) -> usize {
        self.inner.recv.lock().unwrap().ring.len()
    }

    pub fn send_space(&self) -> usize {
        self.inner.send.lock().unwrap().credit() as usize
    }

    pub fn peer_credentials(&self) -> PeerCredentials {
        *self.inner.credentials.read().unwrap()
    }

    /// `FIOC_FILEPATH` (`§6`): a printable path describing this endpoint
    /// and, once known, its peer — `rpmsg:[<localcpu>:[<wire name>]<->
    /// <remotecpu>]`. Servers report their own bound name; clients and
    /// accepted sockets report the connection-specific wire name.
    pub fn filepath(&self) -> Result<String, SocketError> {
        let local = self.inner.local.read().unwrap().clone().ok_or(SocketError::EInval)?;
        let local_cpu = self.inner.bus.local_cpu();
        let remote = self.inner.remote.read().unwrap().clone();
        let remote_cpu = remote.as_ref().map(|r| r.cpu.clone()).unwrap_or_default();

        let wire = match self.inner.wire_name.read().unwrap().clone() {
            Some(name) => name,
            None => wire_name(&local.name, None)?,
        };
        Ok(format!("rpmsg:[{local_cpu}:[{wire}]<->{remote_cpu}]"))
    }

    // ---------------------------------------------------------- teardown

    pub fn close(self: &Arc<Self>) {
        if self.inner.refs.fetch_sub(1, Ordering::AcqRel) > 1 {
            return;
        }

        let role = *self.inner.role.lock().unwrap();
        if let Role::Listener { .. } = role {
            *self.inner.role.lock().unwrap() = Role::ListenerClosed;
            if let Some(token) = self.inner.listen_watch.lock().unwrap().take() {
                self.inner.bus.unregister_listener(token);
            }
            self.inner.accept_sem.post();
            self.notify_poll(PollEvents::IN | PollEvents::HUP);
            return;
        }

        // A datagram socket mid-passive-connect (`§4.4`'s server-less
        // rendezvous) can reach here with `listen_watch` set and no peer
        // ever having announced; unregister it regardless of role so the
        // bus-side binder doesn't outlive this connection.
        if let Some(token) = self.inner.listen_watch.lock().unwrap().take() {
            self.inner.bus.unregister_listener(token);
        }
        if let Some(token) = self.inner.device_watch.lock().unwrap().take() {
            self.inner.bus.unwatch_device(token);
        }

        let recv_guard = self.inner.recv.lock().unwrap();
        let send_guard = self.inner.send.lock().unwrap();
        if let Some(ep) = self.inner.endpoint.write().unwrap().take() {
            ep.destroy();
        }
        drop(send_guard);
        drop(recv_guard);

        self.inner.sendsem.post();
        self.inner.recvsem.post();
        self.notify_poll(PollEvents::IN | PollEvents::OUT);
    }
}

impl EndpointCallback for Connection {
    fn on_frame(&self, bytes: &[u8]) {
        let Some(cmd) = crate::frame::frame_cmd(bytes) else {
            return;
        };
        match cmd {
            CMD_SYNC => self.handle_sync(bytes),
            CMD_DATA => self.handle_data(bytes),
            other => tracing::warn!(cmd = other, "rpmsg socket: unknown frame command"),
        }
    }

    fn on_unbind(&self) {
        self.inner.unbind.store(true, Ordering::Release);
        if let Some(direct) = self.inner.recv.lock().unwrap().direct.take() {
            let _ = direct.reply.send(DeliveredData { bytes: Vec::new() });
        }
        self.inner.sendsem.post();
        self.inner.recvsem.post();
        self.inner.accept_sem.post();
        self.notify_poll(PollEvents::IN | PollEvents::OUT);
    }
}

impl Connection {
    fn handle_sync(&self, bytes: &[u8]) {
        let Some(sync) = SyncFrame::decode(bytes) else {
            return;
        };
        self.inner.send.lock().unwrap().sendsize = sync.size;
        *self.inner.credentials.write().unwrap() = PeerCredentials {
            pid: sync.pid,
            uid: sync.uid,
            gid: sync.gid,
        };
        self.inner.sendsem.post();
        self.notify_poll(PollEvents::OUT);
    }

    fn handle_data(&self, bytes: &[u8]) {
        let Some(header) = DataHeader::decode(bytes) else {
            return;
        };
        let payload = &bytes[DATA_HEADER_LEN..];

        {
            let mut send = self.inner.send.lock().unwrap();
            send.ackpos = header.pos;
            if send.credit() > 0 {
                drop(send);
                self.inner.sendsem.post();
                self.notify_poll(PollEvents::OUT);
            }
        }

        if payload.is_empty() {
            return;
        }

        let mut recv = self.inner.recv.lock().unwrap();
        if let Some(direct) = recv.direct.take() {
            match self.inner.sock_type {
                SocketType::Stream => {
                    let n = direct.max_len.min(header.len as usize).min(payload.len());
                    let delivered = payload[..n].to_vec();
                    recv.recvpos = recv.recvpos.wrapping_add(n as u32);
                    let leftover = &payload[n..];
                    if !leftover.is_empty() {
                        if leftover.len() > recv.ring.space() {
                            tracing::error!(
                                bytes = leftover.len(),
                                "rpmsg socket: receive ring overflow"
                            );
                        }
                        recv.ring.push_slice(leftover);
                    }
                    self.inner.recvpos_hint.store(recv.recvpos, Ordering::Release);
                    drop(recv);
                    let _ = direct.reply.send(DeliveredData { bytes: delivered });
                }
                SocketType::Datagram => {
                    let body = if payload.len() > DGRAM_LEN_PREFIX {
                        &payload[DGRAM_LEN_PREFIX..]
                    } else {
                        &[][..]
                    };
                    let n = direct.max_len.min(body.len());
                    let delivered = body[..n].to_vec();
                    recv.recvpos = recv.recvpos.wrapping_add(header.len);
                    self.inner.recvpos_hint.store(recv.recvpos, Ordering::Release);
                    drop(recv);
                    let _ = direct.reply.send(DeliveredData { bytes: delivered });
                }
            }
            self.inner.recvsem.post();
            self.notify_poll(PollEvents::IN);
            return;
        }

        if payload.len() > recv.ring.space() {
            tracing::error!(bytes = payload.len(), "rpmsg socket: receive ring overflow");
        }
        recv.ring.push_slice(payload);
        drop(recv);
        self.inner.recvsem.post();
        self.notify_poll(PollEvents::IN);
    }
}

struct ClientWatcher {
    conn: Weak<Connection>,
    local_name: String,
    remote: RpmsgAddress,
}

impl DeviceWatcher for ClientWatcher {
    fn device_created(&self) {
        let Some(conn) = self.conn.upgrade() else {
            return;
        };
        let callback: Arc<dyn EndpointCallback> = conn.clone();
        match conn
            .inner
            .bus
            .create_endpoint(self.local_name.clone(), self.remote.cpu.clone(), callback)
        {
            Ok(ep) => {
                *conn.inner.wire_name.write().unwrap() = Some(self.local_name.clone());
                *conn.inner.endpoint.write().unwrap() = Some(ep);
                conn.emit_sync();
            }
            Err(_) => {
                conn.inner.unbind.store(true, Ordering::Release);
                conn.inner.sendsem.post();
                conn.notify_poll(PollEvents::OUT | PollEvents::HUP);
            }
        }
    }

    fn device_destroyed(&self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.on_unbind();
        }
    }
}

struct AcceptedWatcher {
    conn: Weak<Connection>,
}

impl DeviceWatcher for AcceptedWatcher {
    fn device_created(&self) {}

    fn device_destroyed(&self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.on_unbind();
        }
    }
}

struct ListenerBinder {
    conn: Weak<Connection>,
}

impl NameServiceBinder for ListenerBinder {
    fn on_announce(&self, announced_name: String, remote_cpu: String) {
        if let Some(conn) = self.conn.upgrade() {
            conn.on_announce(announced_name, remote_cpu);
        }
    }
}

struct PassiveBinder {
    conn: Weak<Connection>,
}

impl NameServiceBinder for PassiveBinder {
    fn on_announce(&self, announced_name: String, remote_cpu: String) {
        if let Some(conn) = self.conn.upgrade() {
            conn.on_passive_announce(announced_name, remote_cpu);
        }
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
    async fn client_handshake_yields_connected_accept() {
        let bus = InMemoryBus::shared("cpuA", "cpuB");

        let listener = Connection::new(SocketType::Stream, 1024, creds(), bus.side("cpuB"));
        listener.bind(RpmsgAddress::new("echo", "")).unwrap();
        listener.listen(4).unwrap();

        let client = Connection::new(SocketType::Stream, 1024, creds(), bus.side("cpuA"));
        client.connect(RpmsgAddress::new("echo", "cpuB")).await.unwrap();

        let (accepted, peer) = listener.accept().await.unwrap();
        assert_eq!(peer.cpu, "cpuA");
        assert!(peer.name.starts_with("echo:"));
        assert!(accepted.is_connected());
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn stream_send_recv_round_trips_in_order() {
        let bus = InMemoryBus::shared("cpuA", "cpuB");
        let listener = Connection::new(SocketType::Stream, 1024, creds(), bus.side("cpuB"));
        listener.bind(RpmsgAddress::new("echo", "")).unwrap();
        listener.listen(4).unwrap();

        let client = Connection::new(SocketType::Stream, 1024, creds(), bus.side("cpuA"));
        client.connect(RpmsgAddress::new("echo", "cpuB")).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let payload: Vec<u8> = (0..250u32).map(|i| (i % 256) as u8).collect();
        for chunk in payload.chunks(100) {
            let n = client.send_stream(chunk).await.unwrap();
            assert_eq!(n, chunk.len());
        }

        let mut received = Vec::new();
        while received.len() < payload.len() {
            let (chunk, _) = server.recv(64).await.unwrap();
            assert!(!chunk.is_empty());
            received.extend(chunk);
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn listen_on_datagram_socket_is_enosys() {
        let bus = InMemoryBus::shared("cpuA", "cpuB");
        let server = Connection::new(SocketType::Datagram, 64, creds(), bus.side("cpuB"));
        server.bind(RpmsgAddress::new("echo", "")).unwrap();
        assert_eq!(server.listen(4).unwrap_err(), SocketError::ENoSys);
    }

    #[tokio::test]
    async fn datagram_too_large_for_peer_window_is_rejected() {
        let bus = InMemoryBus::shared("cpuA", "cpuB");
        let server = Connection::new(SocketType::Datagram, 64, creds(), bus.side("cpuB"));
        server.bind(RpmsgAddress::new("echo", "")).unwrap();

        let client = Connection::new(SocketType::Datagram, 64, creds(), bus.side("cpuA"));

        let reader = tokio::spawn({
            let server = server.clone();
            async move { server.recv(16).await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        client
            .sendmsg(b"hi", Some(RpmsgAddress::new("echo", "cpuB")))
            .await
            .unwrap();
        let (received, from) = reader.await.unwrap().unwrap();
        assert_eq!(received, b"hi");
        assert_eq!(from.cpu, "cpuA");

        let oversized = vec![0u8; 64];
        assert_eq!(
            client.sendmsg(&oversized, None).await.unwrap_err(),
            SocketError::EFBig
        );

        let fits = vec![1u8, 2, 3];
        client.sendmsg(&fits, None).await.unwrap();
        let (received, _) = server.recv(16).await.unwrap();
        assert_eq!(received, fits);
    }

    #[tokio::test]
    async fn backlog_limits_pending_connections() {
        let bus = InMemoryBus::shared("cpuA", "cpuB");
        let listener = Connection::new(SocketType::Stream, 256, creds(), bus.side("cpuB"));
        listener.bind(RpmsgAddress::new("echo", "")).unwrap();
        listener.listen(2).unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            let client = Connection::new(SocketType::Stream, 256, creds(), bus.side("cpuA"));
            let outcome = client.connect(RpmsgAddress::new("echo", "cpuB")).await;
            clients.push((client, outcome));
        }

        let accepted_ok = clients.iter().filter(|(_, r)| r.is_ok()).count();
        assert_eq!(accepted_ok, 2);
    }

    #[tokio::test]
    async fn peer_vanishing_mid_read_resolves_to_reset_then_eof() {
        let bus = InMemoryBus::shared("cpuA", "cpuB");
        let listener = Connection::new(SocketType::Stream, 256, creds(), bus.side("cpuB"));
        listener.bind(RpmsgAddress::new("echo", "")).unwrap();
        listener.listen(4).unwrap();

        let client = Connection::new(SocketType::Stream, 256, creds(), bus.side("cpuA"));
        client.connect(RpmsgAddress::new("echo", "cpuB")).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let reader = tokio::spawn(async move { server.recv(16).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        client.close();

        let first = reader.await.unwrap();
        assert_eq!(first, Err(SocketError::EConnReset));
    }

    #[tokio::test]
    async fn non_blocking_accept_without_pending_connection_is_eagain() {
        let bus = InMemoryBus::shared("cpuA", "cpuB");
        let listener = Connection::new(SocketType::Stream, 256, creds(), bus.side("cpuB"));
        listener.bind(RpmsgAddress::new("echo", "")).unwrap();
        listener.listen(4).unwrap();
        listener.set_blocking(false);

        assert_eq!(listener.accept().await.unwrap_err(), SocketError::EAgain);
    }
}
