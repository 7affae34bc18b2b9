//! Poll readiness (`§4.7`): the event bits a connection currently satisfies,
//! and the small fixed-size table of registered waiters a `poll(setup=true)`
//! call occupies a slot in.
//!
//! The table itself is core state (it lives on [`crate::connection::Connection`],
//! per the data model's "poll-fd table"); what a slot actually *does* to wake
//! a blocked `poll(2)` caller is the external "poll/notification" collaborator
//! from `§2`, modeled here as the [`PollWaiter`] trait.

use std::sync::Arc;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PollEvents: u32 {
        const IN   = 0x001;
        const OUT  = 0x004;
        const HUP  = 0x010;
        const ERR  = 0x008;
    }
}

/// A registered poll waiter, notified whenever the connection's readiness
/// changes. Implemented by whatever external poll/epoll integration sits
/// above the socket operation surface.
pub trait PollWaiter: Send + Sync {
    fn notify(&self, events: PollEvents);
}

/// Default number of concurrent poll-fd registrations a connection supports;
/// a compile-time configuration knob per `§6`.
pub const DEFAULT_POLL_WAITERS: usize = 4;

pub struct PollTable {
    slots: Vec<Option<Arc<dyn PollWaiter>>>,
}

impl PollTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    /// `poll(setup=true)`: registers into the first free slot.
    pub fn setup(&mut self, waiter: Arc<dyn PollWaiter>) -> Result<usize, crate::error::SocketError> {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(waiter);
                return Ok(idx);
            }
        }
        Err(crate::error::SocketError::EBusy)
    }

    /// `poll(setup=false)`: clears a previously registered slot.
    pub fn clear(&mut self, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = None;
        }
    }

    /// Notifies every registered waiter of the current event set.
    pub fn notify_all(&self, events: PollEvents) {
        for waiter in self.slots.iter().flatten() {
            waiter.notify(events);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter(AtomicU32);
    impl PollWaiter for Counter {
        fn notify(&self, events: PollEvents) {
            self.0.fetch_add(events.bits(), Ordering::SeqCst);
        }
    }

    #[test]
    fn setup_fails_when_table_is_full() {
        let mut table = PollTable::new(1);
        let waiter = Arc::new(Counter(AtomicU32::new(0)));
        assert!(table.setup(waiter.clone()).is_ok());
        assert_eq!(table.setup(waiter).unwrap_err(), crate::error::SocketError::EBusy);
    }

    #[test]
    fn clear_frees_the_slot_for_reuse() {
        let mut table = PollTable::new(1);
        let waiter = Arc::new(Counter(AtomicU32::new(0)));
        let slot = table.setup(waiter.clone()).unwrap();
        table.clear(slot);
        assert!(table.setup(waiter).is_ok());
    }

    #[test]
    fn notify_all_reaches_every_registered_waiter() {
        let mut table = PollTable::new(2);
        let a = Arc::new(Counter(AtomicU32::new(0)));
        let b = Arc::new(Counter(AtomicU32::new(0)));
        table.setup(a.clone()).unwrap();
        table.setup(b.clone()).unwrap();
        table.notify_all(PollEvents::IN);
        assert_eq!(a.0.load(Ordering::SeqCst), PollEvents::IN.bits());
        assert_eq!(b.0.load(Ordering::SeqCst), PollEvents::IN.bits());
    }
}
