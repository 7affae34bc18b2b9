//! `AF_RPMSG` addressing: the bit-exact wire `sockaddr` (`§6`) and the
//! logical [`RpmsgAddress`] used throughout the rest of the crate.

use crate::error::SocketError;
use std::sync::atomic::{AtomicU64, Ordering};

/// The address family value carried in [`SockAddrRpmsg::rp_family`].
pub const AF_RPMSG: u16 = 0x1001;

pub const RPMSG_NAME_LEN: usize = 32;
pub const RPMSG_CPU_LEN: usize = 16;

/// Bit-exact layout of a `sockaddr_rpmsg`. NUL-terminated fixed buffers,
/// no padding inferred by Rust since every field is already byte-aligned.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SockAddrRpmsg {
    pub rp_family: u16,
    pub rp_name: [u8; RPMSG_NAME_LEN],
    pub rp_cpu: [u8; RPMSG_CPU_LEN],
}

impl SockAddrRpmsg {
    pub fn from_address(addr: &RpmsgAddress) -> Self {
        let mut rp_name = [0u8; RPMSG_NAME_LEN];
        let name_bytes = addr.name.as_bytes();
        let n = name_bytes.len().min(RPMSG_NAME_LEN - 1);
        rp_name[..n].copy_from_slice(&name_bytes[..n]);

        let mut rp_cpu = [0u8; RPMSG_CPU_LEN];
        let cpu_bytes = addr.cpu.as_bytes();
        let c = cpu_bytes.len().min(RPMSG_CPU_LEN - 1);
        rp_cpu[..c].copy_from_slice(&cpu_bytes[..c]);

        Self {
            rp_family: AF_RPMSG,
            rp_name,
            rp_cpu,
        }
    }

    pub fn to_address(&self) -> Result<RpmsgAddress, SocketError> {
        if self.rp_family != AF_RPMSG {
            return Err(SocketError::EInval);
        }
        Ok(RpmsgAddress {
            name: cstr_to_string(&self.rp_name),
            cpu: cstr_to_string(&self.rp_cpu),
        })
    }
}

fn cstr_to_string(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// An ergonomic, owned address: a logical endpoint name plus the remote CPU
/// that hosts it (empty CPU means "any").
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RpmsgAddress {
    pub name: String,
    pub cpu: String,
}

impl RpmsgAddress {
    pub fn new(name: impl Into<String>, cpu: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cpu: cpu.into(),
        }
    }
}

const WIRE_PREFIX: &str = "sk:";
/// `:` + 13 hex digits, the client-disambiguation suffix.
const SUFFIX_LEN: usize = 14;
/// The wire-name budget a real RPMsg endpoint name must fit in. Sized so the
/// fixed-width pieces (prefix + suffix) alone already consume more than a
/// third of it, which is the compile-time assertion below.
pub const RPMSG_WIRE_NAME_LEN: usize = 32;

const _: () = assert!(WIRE_PREFIX.len() + SUFFIX_LEN < RPMSG_WIRE_NAME_LEN);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// `g_rpmsg_id` in the original driver: a process-wide monotonic counter used
/// to disambiguate concurrent client connects from the same process.
pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Formats a connection id as the 13 hex digit suffix (52 bits of id).
pub fn format_suffix(id: u64) -> String {
    format!(":{:013x}", id & 0x000F_FFFF_FFFF_FFFF)
}

/// Builds the wire-level RPMsg endpoint name `"sk:" + rp_name + suffix`,
/// rejecting names that would blow the 32-byte endpoint-name budget. `rp_name`
/// can in principle be as long as [`RPMSG_NAME_LEN`] allows, but only short
/// logical names actually fit once the prefix and suffix are accounted for;
/// the bound is therefore enforced here rather than on [`SockAddrRpmsg`]
/// itself.
pub fn wire_name(rp_name: &str, suffix: Option<&str>) -> Result<String, SocketError> {
    let mut out = String::with_capacity(RPMSG_WIRE_NAME_LEN);
    out.push_str(WIRE_PREFIX);
    out.push_str(rp_name);
    if let Some(suffix) = suffix {
        out.push_str(suffix);
    }
    if out.len() > RPMSG_WIRE_NAME_LEN {
        return Err(SocketError::EInval);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_wire_format() {
        let addr = RpmsgAddress::new("echo", "cpuB");
        let wire = SockAddrRpmsg::from_address(&addr);
        assert_eq!(wire.to_address().unwrap(), addr);
    }

    #[test]
    fn empty_cpu_means_any() {
        let addr = RpmsgAddress::new("echo", "");
        let wire = SockAddrRpmsg::from_address(&addr);
        assert_eq!(wire.to_address().unwrap().cpu, "");
    }

    #[test]
    fn wire_name_rejects_over_budget() {
        let long = "a".repeat(RPMSG_WIRE_NAME_LEN);
        assert!(wire_name(&long, Some(":0000000000001")).is_err());
    }

    #[test]
    fn wire_name_fits_typical_names() {
        let n = wire_name("echo", Some(&format_suffix(42))).unwrap();
        assert!(n.starts_with("sk:echo:"));
        assert!(n.len() <= RPMSG_WIRE_NAME_LEN);
    }

    #[test]
    fn connection_ids_are_monotonic_and_unique() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert!(b > a);
    }
}
