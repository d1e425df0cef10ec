//! Doorbell notifications between processors.
//!
//! Every processor on the link owns one [`NotifyEndpoint`]. Signals travel
//! over a crossbeam channel into the receiver's dispatcher thread, which
//! invokes the callback registered for the (sender, channel, event) tuple.
//! One queue per receiver keeps delivery FIFO for any single sender.
//!
//! Callbacks run on the dispatcher thread, never on the thread blocked in
//! orchestration code. [`NotifyEndpoint::unregister`] waits for an in-flight
//! callback to return; anything that arrives for the key afterwards is
//! dropped and counted as a late delivery.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::ids::{EventKey, ProcessorId};
use crate::{TransportError, TransportResult};

type Callback = Arc<dyn Fn(u32) + Send + Sync>;

enum Inbound {
    Event { key: EventKey, payload: u32 },
    Shutdown,
}

/// Routing table of every live endpoint on one link.
#[derive(Default)]
pub struct NotifyBus {
    endpoints: RwLock<HashMap<ProcessorId, Sender<Inbound>>>,
}

impl NotifyBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates the endpoint for `id` and starts its dispatcher thread.
    pub fn endpoint(self: &Arc<Self>, id: ProcessorId) -> TransportResult<NotifyEndpoint> {
        let mut endpoints = self.endpoints.write();
        if endpoints.contains_key(&id) {
            return Err(TransportError::EndpointExists(id));
        }

        let (tx, rx) = unbounded();
        let shared = Arc::new(Dispatch::new(id));
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("notify-{id}"))
            .spawn(move || dispatch_loop(&worker_shared, rx))
            .map_err(|err| TransportError::Processor {
                id,
                op: "spawn notify dispatcher",
                reason: err.to_string(),
            })?;

        endpoints.insert(id, tx.clone());
        tracing::debug!(processor = %id, "notify endpoint up");
        Ok(NotifyEndpoint {
            id,
            bus: Arc::clone(self),
            shared,
            tx,
            worker: Some(worker),
        })
    }

    fn route(&self, to: ProcessorId) -> TransportResult<Sender<Inbound>> {
        self.endpoints
            .read()
            .get(&to)
            .cloned()
            .ok_or(TransportError::UnknownProcessor(to))
    }
}

/// Delivery counters for one endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NotifyStats {
    /// Events handed to a registered callback.
    pub delivered: u64,
    /// Events that arrived for a key after it was unregistered.
    pub late: u64,
    /// Events for a key that was never registered.
    pub unrouted: u64,
}

/// Proof of a registration; pass it back to unregister.
#[derive(Debug, PartialEq, Eq)]
pub struct RegistrationHandle {
    key: EventKey,
    token: u64,
}

impl RegistrationHandle {
    pub fn key(&self) -> EventKey {
        self.key
    }
}

struct Route {
    token: u64,
    callback: Callback,
}

struct Dispatch {
    id: ProcessorId,
    routes: Mutex<HashMap<EventKey, Route>>,
    retired: Mutex<HashSet<EventKey>>,
    // Held for the duration of a callback.
    running: Mutex<()>,
    next_token: AtomicU64,
    delivered: AtomicU64,
    late: AtomicU64,
    unrouted: AtomicU64,
}

impl Dispatch {
    fn new(id: ProcessorId) -> Self {
        Self {
            id,
            routes: Mutex::new(HashMap::new()),
            retired: Mutex::new(HashSet::new()),
            running: Mutex::new(()),
            next_token: AtomicU64::new(1),
            delivered: AtomicU64::new(0),
            late: AtomicU64::new(0),
            unrouted: AtomicU64::new(0),
        }
    }

    fn deliver(&self, key: EventKey, payload: u32) {
        let _running = self.running.lock();
        let callback = self
            .routes
            .lock()
            .get(&key)
            .map(|route| Arc::clone(&route.callback));

        match callback {
            Some(callback) => {
                callback(payload);
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            None if self.retired.lock().contains(&key) => {
                self.late.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    processor = %self.id,
                    %key,
                    payload,
                    "signal arrived after unregister; dropped"
                );
            }
            None => {
                self.unrouted.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(processor = %self.id, %key, payload, "no callback registered; dropped");
            }
        }
    }
}

fn dispatch_loop(shared: &Dispatch, rx: Receiver<Inbound>) {
    while let Ok(message) = rx.recv() {
        match message {
            Inbound::Event { key, payload } => shared.deliver(key, payload),
            Inbound::Shutdown => break,
        }
    }
    tracing::trace!(processor = %shared.id, "notify dispatcher exiting");
}

/// One processor's view of the doorbell.
pub struct NotifyEndpoint {
    id: ProcessorId,
    bus: Arc<NotifyBus>,
    shared: Arc<Dispatch>,
    tx: Sender<Inbound>,
    worker: Option<JoinHandle<()>>,
}

impl NotifyEndpoint {
    pub fn id(&self) -> ProcessorId {
        self.id
    }

    /// Binds `callback` with its `context` to `key`.
    ///
    /// The callback runs on this endpoint's dispatcher thread once per
    /// matching signal, with the signal's payload.
    pub fn register<C>(
        &self,
        key: EventKey,
        context: Arc<C>,
        callback: fn(&C, u32),
    ) -> TransportResult<RegistrationHandle>
    where
        C: Send + Sync + 'static,
    {
        self.register_with(key, move |payload| callback(&context, payload))
    }

    /// Closure form of [`NotifyEndpoint::register`].
    pub fn register_with<F>(&self, key: EventKey, callback: F) -> TransportResult<RegistrationHandle>
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        let mut routes = self.shared.routes.lock();
        if routes.contains_key(&key) {
            return Err(TransportError::AlreadyRegistered(key));
        }
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        routes.insert(
            key,
            Route {
                token,
                callback: Arc::new(callback),
            },
        );
        self.shared.retired.lock().remove(&key);
        tracing::debug!(processor = %self.id, %key, "callback registered");
        Ok(RegistrationHandle { key, token })
    }

    /// Removes a registration. When this returns, the callback is not
    /// running and will not run again.
    ///
    /// Must not be called from inside a callback of the same endpoint.
    pub fn unregister(&self, handle: &RegistrationHandle) -> TransportResult<()> {
        let _fence = self.shared.running.lock();
        let mut routes = self.shared.routes.lock();
        match routes.get(&handle.key) {
            Some(route) if route.token == handle.token => {
                routes.remove(&handle.key);
                self.shared.retired.lock().insert(handle.key);
                tracing::debug!(processor = %self.id, key = %handle.key, "callback unregistered");
                Ok(())
            }
            _ => Err(TransportError::NotRegistered(handle.key)),
        }
    }

    /// Posts `payload` to `peer`'s callback for (this processor, channel, event).
    ///
    /// Fire-and-forget: there is no acknowledgement and no back-pressure.
    pub fn signal(
        &self,
        peer: ProcessorId,
        channel: u32,
        event: u32,
        payload: u32,
    ) -> TransportResult<()> {
        let tx = self.bus.route(peer)?;
        let key = EventKey::new(self.id, channel, event);
        tx.send(Inbound::Event { key, payload })
            .map_err(|_| TransportError::EndpointClosed(peer))?;
        tracing::trace!(from = %self.id, to = %peer, channel, event, payload, "signal posted");
        Ok(())
    }

    pub fn stats(&self) -> NotifyStats {
        NotifyStats {
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            late: self.shared.late.load(Ordering::Relaxed),
            unrouted: self.shared.unrouted.load(Ordering::Relaxed),
        }
    }
}

impl Drop for NotifyEndpoint {
    fn drop(&mut self) {
        self.bus.endpoints.write().remove(&self.id);
        let _ = self.tx.send(Inbound::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                tracing::error!(processor = %self.id, "notify dispatcher panicked");
            }
        }
        tracing::debug!(processor = %self.id, "notify endpoint down");
    }
}
