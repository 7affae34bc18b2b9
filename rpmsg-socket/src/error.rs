//! Error codes returned across the socket operation surface (`§7`).
//!
//! These mirror the POSIX errno values the original socket layer returns so
//! that a dispatcher sitting above [`crate::socket::Socket`] can translate
//! them without a separate mapping table.

use thiserror::Error as ThisError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum SocketError {
    /// Bad address family/length, `listen` without `bind`, or backlog <= 0.
    #[error("invalid argument")]
    EInval,
    /// Allocation failure at `setup` or at name-service bind time.
    #[error("cannot allocate memory")]
    ENoMem,
    /// `connect` on an already-connected socket, or `recv` when not connected.
    #[error("socket is already connected")]
    EIsConn,
    /// `send` with no destination and no established connection.
    #[error("socket is not connected")]
    ENotConn,
    /// Non-blocking `connect` has been armed and is proceeding in the background.
    #[error("operation now in progress")]
    EInProgress,
    /// Non-blocking call with no data, no credit, or an empty accept queue.
    #[error("resource temporarily unavailable")]
    EAgain,
    /// Listener closed during accept, peer gone during a wait, or the endpoint
    /// was destroyed mid-send/recv.
    #[error("connection reset by peer")]
    EConnReset,
    /// A datagram send exceeds the peer's advertised window.
    #[error("message too long for peer window")]
    EFBig,
    /// `listen` called on a `SOCK_DGRAM` socket.
    #[error("function not implemented")]
    ENoSys,
    /// Unknown ioctl request.
    #[error("inappropriate ioctl for device")]
    ENoTty,
    /// Any sockopt other than `SO_PEERCRED`.
    #[error("protocol not available")]
    ENoProtoOpt,
    /// The poll-fd table has no free slot.
    #[error("device or resource busy")]
    EBusy,
}

pub type Result<T> = std::result::Result<T, SocketError>;
