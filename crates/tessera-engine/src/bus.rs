use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use futures::{FutureExt, Stream};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use tessera_core::events::{Event, EventBody, EventHandler, EventKind};
use tessera_core::ids::{AgentId, NodeId};

use crate::error::BusError;

pub const DEFAULT_STREAM_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Registration {
    id: SubscriptionId,
    kind: EventKind,
    handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
struct BusInner {
    registrations: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

/// Typed publish/subscribe hub. Clones share the same registrations.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`. Group kinds receive every member kind.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.registrations.write().push(Registration { id, kind, handler });
        id
    }

    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        self.subscribe(EventKind::Any, handler)
    }

    /// Register an async closure as a handler.
    pub fn subscribe_fn<F, Fut>(&self, kind: EventKind, f: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe(kind, Arc::new(FnHandler(f)))
    }

    /// Remove one registration. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut regs = self.inner.registrations.write();
        let before = regs.len();
        regs.retain(|r| r.id != id);
        regs.len() != before
    }

    /// Remove every registration of `handler`, compared by pointer identity.
    pub fn unsubscribe_handler(&self, handler: &Arc<dyn EventHandler>) -> usize {
        let target = Arc::as_ptr(handler) as *const ();
        let mut regs = self.inner.registrations.write();
        let before = regs.len();
        regs.retain(|r| Arc::as_ptr(&r.handler) as *const () != target);
        before - regs.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.registrations.read().len()
    }

    /// Deliver `event` to every matching handler concurrently and wait for all of them.
    /// Handler errors and panics are logged and never reach the emitter.
    pub async fn emit(&self, event: Event) {
        let kind = event.kind();
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .inner
            .registrations
            .read()
            .iter()
            .filter(|r| r.kind.matches(kind))
            .map(|r| Arc::clone(&r.handler))
            .collect();

        if handlers.is_empty() {
            return;
        }

        let event = &event;
        join_all(handlers.iter().map(|handler| async move {
            let result = std::panic::AssertUnwindSafe(handler.handle(event))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        handler = handler.name(),
                        event = event.event_type(),
                        error = %e,
                        "event handler failed"
                    );
                }
                Err(panic) => {
                    warn!(
                        handler = handler.name(),
                        event = event.event_type(),
                        panic = %panic_message(&panic),
                        "event handler panicked"
                    );
                }
            }
        }))
        .await;
    }

    /// Stream every subsequent event matching any of `kinds` (all events when empty).
    pub fn stream(&self, kinds: &[EventKind]) -> EventStream {
        self.stream_with_capacity(kinds, DEFAULT_STREAM_CAPACITY)
    }

    pub fn stream_with_capacity(&self, kinds: &[EventKind], capacity: usize) -> EventStream {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let forwarder = StreamForwarder {
            kinds: kinds.to_vec(),
            tx,
        };
        let id = self.subscribe_all(Arc::new(forwarder));
        EventStream {
            rx: ReceiverStream::new(rx),
            bus: self.clone(),
            id: Some(id),
        }
    }

    /// Resolve with the first future event of `kind` that satisfies `predicate`.
    /// The registration is removed once it fires or the timeout elapses.
    pub async fn wait_for<P>(
        &self,
        kind: EventKind,
        predicate: P,
        timeout: Duration,
    ) -> Result<Event, BusError>
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter {
            predicate: Box::new(predicate),
            tx: Mutex::new(Some(tx)),
        };
        let id = self.subscribe(kind, Arc::new(waiter));
        let result = tokio::time::timeout(timeout, rx).await;
        self.unsubscribe(id);
        match result {
            Ok(Ok(event)) => Ok(event),
            _ => Err(BusError::Timeout(timeout)),
        }
    }
}

/// Emits events stamped with one node's (and optionally one task's) identity.
#[derive(Clone)]
pub struct ScopedEmitter {
    bus: EventBus,
    node_id: NodeId,
    agent_id: Option<AgentId>,
    operation: Option<String>,
}

impl ScopedEmitter {
    pub fn new(bus: EventBus, node_id: NodeId) -> Self {
        Self {
            bus,
            node_id,
            agent_id: None,
            operation: None,
        }
    }

    pub fn for_task(&self, agent_id: AgentId, operation: impl Into<String>) -> Self {
        Self {
            bus: self.bus.clone(),
            node_id: self.node_id.clone(),
            agent_id: Some(agent_id),
            operation: Some(operation.into()),
        }
    }

    pub fn event(&self, body: EventBody) -> Event {
        let mut event = Event::new(body).with_node(self.node_id.clone());
        event.agent_id = self.agent_id.clone();
        event.operation = self.operation.clone();
        event
    }

    pub async fn emit(&self, body: EventBody) {
        self.bus.emit(self.event(body)).await;
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }

    fn name(&self) -> &str {
        "fn_handler"
    }
}

struct StreamForwarder {
    kinds: Vec<EventKind>,
    tx: mpsc::Sender<Event>,
}

#[async_trait]
impl EventHandler for StreamForwarder {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let kind = event.kind();
        if !self.kinds.is_empty() && !self.kinds.iter().any(|k| k.matches(kind)) {
            return Ok(());
        }
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(event = dropped.event_type(), "event stream full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event stream closed");
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "event_stream"
    }
}

struct Waiter {
    predicate: Box<dyn Fn(&Event) -> bool + Send + Sync>,
    tx: Mutex<Option<oneshot::Sender<Event>>>,
}

#[async_trait]
impl EventHandler for Waiter {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        if !(self.predicate)(event) {
            return Ok(());
        }
        // take() under the lock so concurrent deliveries resolve the waiter once
        let tx = self.tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(event.clone());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "wait_for"
    }
}

/// Live feed of bus events. Dropping or closing it removes the registration.
pub struct EventStream {
    rx: ReceiverStream<Event>,
    bus: EventBus,
    id: Option<SubscriptionId>,
}

impl EventStream {
    /// Stop receiving. Events already queued are still yielded.
    pub fn close(&mut self) {
        if let Some(id) = self.id.take() {
            self.bus.unsubscribe(id);
        }
        self.rx.close();
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.bus.unsubscribe(id);
        }
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
