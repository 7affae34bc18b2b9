//! An in-process, in-memory [`RpmsgBus`] standing in for a real RPMsg
//! device (`§2`'s "the underlying RPMsg device itself", explicitly out of
//! scope for this crate). Used by this crate's own tests and by the `rpmsg-demo`
//! binary to exercise the transport without real hardware.
//!
//! Endpoint delivery and name-service matching happen synchronously on the
//! calling thread, which is adequate for tests but is not a model of real
//! RPMsg latency or concurrency.

use crate::{
    bus::{DeviceWatcher, EndpointCallback, NameServiceBinder, RpmsgBus, RpmsgEndpoint, TxBuffer, WatchToken},
    error::SocketError,
};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

struct EndpointRecord {
    callback: Arc<dyn EndpointCallback>,
    peer_cpu: String,
}

struct ListenerRecord {
    listener_cpu: String,
    prefix: String,
    cpu_filter: String,
    binder: Arc<dyn NameServiceBinder>,
}

#[derive(Default)]
struct Fabric {
    endpoints: Mutex<HashMap<(String, String), EndpointRecord>>,
    listeners: Mutex<Vec<ListenerRecord>>,
    announced: Mutex<HashSet<String>>,
    next_token: AtomicU64,
}

impl Fabric {
    fn alloc_token(&self) -> WatchToken {
        WatchToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }
}

/// A handle to the shared fabric; [`Self::side`] hands out one [`RpmsgBus`]
/// implementation per simulated CPU.
pub struct InMemoryBus {
    fabric: Arc<Fabric>,
}

impl InMemoryBus {
    /// Creates a fabric connecting (at least) the two named CPUs. The names
    /// are only used for readability; any string works as a CPU name.
    pub fn shared(_a: &str, _b: &str) -> Self {
        Self {
            fabric: Arc::new(Fabric::default()),
        }
    }

    /// Returns an [`RpmsgBus`] handle local to `cpu`.
    pub fn side(&self, cpu: &str) -> Arc<dyn RpmsgBus> {
        Arc::new(BusSide {
            fabric: self.fabric.clone(),
            local_cpu: cpu.to_string(),
        })
    }
}

struct BusSide {
    fabric: Arc<Fabric>,
    local_cpu: String,
}

impl RpmsgBus for BusSide {
    fn local_cpu(&self) -> String {
        self.local_cpu.clone()
    }

    fn ipcsize(&self) -> usize {
        512
    }

    fn watch_device(&self, _remote_cpu: String, watcher: Arc<dyn DeviceWatcher>) -> WatchToken {
        // The test fabric has no device-presence timeline of its own: every
        // CPU named in `InMemoryBus::shared` is considered already present.
        watcher.device_created();
        self.fabric.alloc_token()
    }

    fn unwatch_device(&self, _token: WatchToken) {}

    fn create_endpoint(
        &self,
        name: String,
        dest_cpu: String,
        callback: Arc<dyn EndpointCallback>,
    ) -> Result<Arc<dyn RpmsgEndpoint>, SocketError> {
        self.fabric.endpoints.lock().unwrap().insert(
            (self.local_cpu.clone(), name.clone()),
            EndpointRecord {
                callback,
                peer_cpu: dest_cpu.clone(),
            },
        );

        let first_time = self.fabric.announced.lock().unwrap().insert(name.clone());
        if first_time {
            let matches: Vec<Arc<dyn NameServiceBinder>> = self
                .fabric
                .listeners
                .lock()
                .unwrap()
                .iter()
                .filter(|l| {
                    l.listener_cpu == dest_cpu
                        && name.starts_with(&l.prefix)
                        && (l.cpu_filter.is_empty() || l.cpu_filter == self.local_cpu)
                })
                .map(|l| l.binder.clone())
                .collect();
            for binder in matches {
                binder.on_announce(name.clone(), self.local_cpu.clone());
            }
        }

        Ok(Arc::new(TestEndpoint {
            fabric: self.fabric.clone(),
            local_cpu: self.local_cpu.clone(),
            dest_cpu,
            name,
        }))
    }

    fn register_listener(
        &self,
        name_prefix: String,
        cpu_filter: String,
        binder: Arc<dyn NameServiceBinder>,
    ) -> WatchToken {
        self.fabric.listeners.lock().unwrap().push(ListenerRecord {
            listener_cpu: self.local_cpu.clone(),
            prefix: name_prefix,
            cpu_filter,
            binder,
        });
        self.fabric.alloc_token()
    }

    fn unregister_listener(&self, _token: WatchToken) {}
}

struct TestEndpoint {
    fabric: Arc<Fabric>,
    local_cpu: String,
    dest_cpu: String,
    name: String,
}

struct HeapBuffer(Vec<u8>);

impl TxBuffer for HeapBuffer {
    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl RpmsgEndpoint for TestEndpoint {
    fn alloc_tx(&self, size: usize) -> Box<dyn TxBuffer> {
        Box::new(HeapBuffer(vec![0u8; size]))
    }

    fn send_nocopy(&self, buf: Box<dyn TxBuffer>, used: usize) -> Result<(), SocketError> {
        let mut buf = buf;
        let bytes = buf.as_mut_slice()[..used].to_vec();
        let peer = self
            .fabric
            .endpoints
            .lock()
            .unwrap()
            .get(&(self.dest_cpu.clone(), self.name.clone()))
            .map(|r| r.callback.clone());
        match peer {
            Some(callback) => {
                callback.on_frame(&bytes);
                Ok(())
            }
            None => Ok(()), // peer endpoint not yet present; frame is simply lost
        }
    }

    fn destroy(&self) {
        self.fabric
            .endpoints
            .lock()
            .unwrap()
            .remove(&(self.local_cpu.clone(), self.name.clone()));
        let peer = self
            .fabric
            .endpoints
            .lock()
            .unwrap()
            .get(&(self.dest_cpu.clone(), self.name.clone()))
            .map(|r| r.callback.clone());
        if let Some(callback) = peer {
            callback.on_unbind();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        frames: AtomicUsize,
        unbinds: AtomicUsize,
    }

    impl EndpointCallback for Recorder {
        fn on_frame(&self, _bytes: &[u8]) {
            self.frames.fetch_add(1, Ordering::SeqCst);
        }
        fn on_unbind(&self) {
            self.unbinds.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn direct_send_reaches_the_named_peer() {
        let bus = InMemoryBus::shared("a", "b");
        let side_a = bus.side("a");
        let side_b = bus.side("b");

        let recorder = Arc::new(Recorder {
            frames: AtomicUsize::new(0),
            unbinds: AtomicUsize::new(0),
        });
        let cb: Arc<dyn EndpointCallback> = recorder.clone();
        let _ep_b = side_b.create_endpoint("sk:x".into(), "a".into(), cb).unwrap();

        let noop: Arc<dyn EndpointCallback> = Arc::new(Recorder {
            frames: AtomicUsize::new(0),
            unbinds: AtomicUsize::new(0),
        });
        let ep_a = side_a.create_endpoint("sk:x".into(), "b".into(), noop).unwrap();

        let mut tx = ep_a.alloc_tx(4);
        tx.as_mut_slice().copy_from_slice(&[1, 2, 3, 4]);
        ep_a.send_nocopy(tx, 4).unwrap();

        assert_eq!(recorder.frames.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn destroy_notifies_the_peer_endpoint() {
        let bus = InMemoryBus::shared("a", "b");
        let side_a = bus.side("a");
        let side_b = bus.side("b");

        let recorder = Arc::new(Recorder {
            frames: AtomicUsize::new(0),
            unbinds: AtomicUsize::new(0),
        });
        let cb: Arc<dyn EndpointCallback> = recorder.clone();
        let _ep_b = side_b.create_endpoint("sk:y".into(), "a".into(), cb).unwrap();

        let noop: Arc<dyn EndpointCallback> = Arc::new(Recorder {
            frames: AtomicUsize::new(0),
            unbinds: AtomicUsize::new(0),
        });
        let ep_a = side_a.create_endpoint("sk:y".into(), "b".into(), noop).unwrap();
        ep_a.destroy();

        assert_eq!(recorder.unbinds.load(Ordering::SeqCst), 1);
    }
}
