//! A POSIX-socket-like `SOCK_STREAM`/`SOCK_DGRAM` transport layered over an
//! RPMsg message bus between the cores of an asymmetric SoC.
//!
//! [`socket::Socket`] is the public surface: `setup`/`bind`/`listen`/
//! `connect`/`accept`/`sendmsg`/`recvmsg`/`poll`/`ioctl`/`getsockopt`/
//! `close`, mirroring `socket(2)` and friends. It is backed by
//! [`connection::Connection`], which owns the wire framing, the
//! credit-based flow control window, and the listener accept pipeline.
//! Everything below that — the RPMsg endpoint itself, the name service,
//! device presence, and poll notification — is a caller-supplied
//! implementation of the traits in [`bus`]; [`testbus`] provides an
//! in-process one for tests and the demo binary.

pub mod addr;
pub mod bus;
pub mod connection;
pub mod error;
pub mod event;
pub mod frame;
pub mod poll;
pub mod ring;
pub mod socket;
pub mod testbus;

pub use addr::{RpmsgAddress, SockAddrRpmsg, AF_RPMSG};
pub use bus::{PeerCredentials, RpmsgBus, RpmsgEndpoint};
pub use error::SocketError;
pub use socket::{SockOpt, SockOptValue, SockType, Socket};
