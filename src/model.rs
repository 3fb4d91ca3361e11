//! Shared, reference-counted live computations over the store.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::store::EventStore;

/// Values are buffered per model subscriber; slow consumers observe a
/// lag and skip ahead to newer values rather than stalling the model.
const MODEL_BUFFER: usize = 256;

/// A pure, shareable computation from the store's current and future
/// contents to a stream of derived values.
///
/// Subscribing twice with an equal [`Model::key`] shares one underlying
/// computation: `build` runs once, on a driver task, when the first
/// subscriber attaches, and the driver is discarded when the last
/// subscriber goes away. `build` typically snapshots the store, then
/// follows [`EventStore::notices`] (or the `filters`/`updated` streams)
/// and re-emits its value.
///
/// Implementations must be idempotent under notification replay: seeing
/// the same notice twice may cost a recomputation but must not corrupt
/// the derived value.
pub trait Model: Send + 'static {
    /// Derived value delivered to subscribers.
    type Output: Clone + Send + 'static;

    /// Deterministic serialization of this model's arguments. Two model
    /// values of the same type with equal keys share one computation;
    /// reduce event arguments to their ids.
    fn key(&self) -> String;

    /// Construct the live value stream. Runs once per active key.
    fn build(&self, store: &Arc<EventStore>) -> BoxStream<'static, Self::Output>;
}

/// Registry of running model computations, keyed by model type + args.
pub(crate) struct Registry {
    slots: Mutex<HashMap<String, Slot>>,
}

struct Slot {
    refs: usize,
    shared: Arc<dyn Any + Send + Sync>,
    driver: Option<JoinHandle<()>>,
}

struct Shared<T> {
    /// Taken by the driver when its source ends, closing every
    /// subscriber's receiver so finished models terminate their streams.
    tx: Mutex<Option<broadcast::Sender<T>>>,
    last: Mutex<Option<T>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Registry {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("active", &self.slots.lock().len())
            .finish()
    }
}

impl EventStore {
    /// Subscribe to the shared output of `model`.
    ///
    /// The first subscriber for a key starts the computation on a driver
    /// task; further subscribers attach to the same multicast output and
    /// a late subscriber immediately receives the latest value before the
    /// live tail. Dropping the last subscriber stops and discards the
    /// computation, so an unobserved model costs nothing; resubscribing
    /// builds a fresh one. Must be called within a tokio runtime.
    pub fn model<M: Model>(self: &Arc<Self>, model: M) -> ModelStream<M::Output> {
        let key = format!("{}::{}", std::any::type_name::<M>(), model.key());
        let mut slots = self.models.slots.lock();
        let slot = slots.entry(key.clone()).or_insert_with(|| {
            let (tx, _) = broadcast::channel(MODEL_BUFFER);
            let shared = Arc::new(Shared::<M::Output> {
                tx: Mutex::new(Some(tx)),
                last: Mutex::new(None),
            });
            // Build on the driver task, not under the registry lock, so a
            // model may itself subscribe to other models while starting.
            let store = self.clone();
            let worker = shared.clone();
            let driver = tokio::spawn(async move {
                let mut source = model.build(&store);
                while let Some(value) = source.next().await {
                    *worker.last.lock() = Some(value.clone());
                    if let Some(tx) = &*worker.tx.lock() {
                        let _ = tx.send(value);
                    }
                }
                worker.tx.lock().take();
            });
            debug!(%key, "model started");
            Slot {
                refs: 0,
                shared,
                driver: Some(driver),
            }
        });
        slot.refs += 1;
        let shared = slot
            .shared
            .clone()
            .downcast::<Shared<M::Output>>()
            .ok()
            .expect("model key reused with a different output type");
        drop(slots);

        // Subscribe before snapshotting the latest value: a value landing
        // in between is seen twice rather than lost, and models tolerate
        // replay. A finished model has no sender left; its subscribers
        // get the final value and then end.
        let rx = shared
            .tx
            .lock()
            .as_ref()
            .map(|tx| BroadcastStream::new(tx.subscribe()));
        let initial = shared.last.lock().clone();
        ModelStream {
            store: self.clone(),
            key,
            initial,
            rx,
        }
    }
}

/// Subscription to a shared model; yields the model's derived values.
///
/// Dropping the stream releases its reference; dropping the last one
/// tears the computation down.
pub struct ModelStream<T> {
    store: Arc<EventStore>,
    key: String,
    initial: Option<T>,
    rx: Option<BroadcastStream<T>>,
}

impl<T: Clone + Send + 'static + Unpin> Stream for ModelStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        if let Some(value) = this.initial.take() {
            return Poll::Ready(Some(value));
        }
        let Some(rx) = &mut this.rx else {
            return Poll::Ready(None);
        };
        loop {
            match Pin::new(&mut *rx).poll_next(cx) {
                Poll::Ready(Some(Ok(value))) => return Poll::Ready(Some(value)),
                // Skip to newer values after a lag.
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(_)))) => continue,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<T> Drop for ModelStream<T> {
    fn drop(&mut self) {
        let mut slots = self.store.models.slots.lock();
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.refs -= 1;
            if slot.refs == 0 {
                if let Some(slot) = slots.remove(&self.key) {
                    if let Some(driver) = slot.driver {
                        driver.abort();
                    }
                }
                debug!(key = %self.key, "model stopped");
            }
        }
    }
}

impl<T> fmt::Debug for ModelStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelStream").field("key", &self.key).finish()
    }
}
