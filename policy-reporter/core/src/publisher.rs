use futures::future;
use parking_lot::RwLock;
use std::sync::Arc;

/// Observes events published on a [`Publisher`].
///
/// A listener is responsible for handling its own failures; the publisher
/// never observes them.
#[async_trait::async_trait]
pub trait Listener<E: Send + Sync>: Send + Sync {
    async fn on_event(&self, event: &E);
}

/// Fans each event out to every registered listener.
///
/// Publishing drives all listeners concurrently and completes only once every
/// listener has finished with the event, so callers observe a barrier per
/// event: all side effects of one event are applied before the next event is
/// published.
pub struct Publisher<E: Send + Sync> {
    listeners: RwLock<Vec<Arc<dyn Listener<E>>>>,
}

/// Adapts a synchronous closure into a [`Listener`].
struct FnListener<F>(F);

// === impl Publisher ===

impl<E: Send + Sync> Default for Publisher<E> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl<E: Send + Sync + 'static> Publisher<E> {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, listener: impl Listener<E> + 'static) {
        self.listeners.write().push(Arc::new(listener));
    }

    pub fn register_fn<F>(&self, f: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(FnListener(f));
    }

    pub fn listeners(&self) -> Vec<Arc<dyn Listener<E>>> {
        self.listeners.read().clone()
    }

    pub async fn publish(&self, event: E) {
        // Snapshot the listeners so that the lock is not held while they run.
        let listeners = self.listeners();
        future::join_all(listeners.iter().map(|l| l.on_event(&event))).await;
    }
}

impl<E: Send + Sync> std::fmt::Debug for Publisher<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

// === impl FnListener ===

#[async_trait::async_trait]
impl<E, F> Listener<E> for FnListener<F>
where
    E: Send + Sync,
    F: Fn(&E) + Send + Sync,
{
    async fn on_event(&self, event: &E) {
        (self.0)(event)
    }
}
