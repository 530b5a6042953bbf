use futures::prelude::*;
pub use kube::runtime::watcher::{Error, Event, Result};
use std::{pin::Pin, sync::Arc};
use tokio::time;
use tracing::{info, Instrument};

type EventStream<T> = Pin<Box<dyn Stream<Item = Result<Event<T>>> + Send + 'static>>;

type OnError = Arc<dyn Fn(&Error) + Send + Sync>;

type OnRestart = Arc<dyn Fn() + Send + Sync>;

type Restart<T> = Arc<dyn Fn() -> EventStream<T> + Send + Sync>;

/// Wraps an event stream that never terminates.
///
/// Stream failures are logged and, after a fixed backoff, the stream is
/// either rebuilt (see [`Watch::restarting`]) or polled again. A rebuilt
/// kube watcher starts with a fresh list, so it always yields a
/// [`Event::Restarted`] before any other event.
pub struct Watch<T> {
    initialized: bool,
    backoff: time::Duration,
    on_error: Option<OnError>,
    on_restart: Option<OnRestart>,
    restart: Option<Restart<T>>,
    span: tracing::Span,
    rx: EventStream<T>,
}

// === impl Watch ===

impl<T, W> From<W> for Watch<T>
where
    W: Stream<Item = Result<Event<T>>> + Send + 'static,
{
    fn from(watch: W) -> Self {
        Self::new(watch.boxed())
    }
}

impl<T> Watch<T> {
    pub const DEFAULT_BACKOFF: time::Duration = time::Duration::from_secs(2);

    pub fn new(rx: EventStream<T>) -> Watch<T> {
        Self {
            rx,
            initialized: false,
            backoff: Self::DEFAULT_BACKOFF,
            on_error: None,
            on_restart: None,
            restart: None,
            span: tracing::Span::current(),
        }
    }

    /// Builds a watch that replaces its stream with a new one from `watch`
    /// each time the current stream fails.
    ///
    /// A kube watcher resumes from its last resource version after most
    /// errors and only re-lists on `410 Gone`, so a failure would otherwise
    /// never be followed by a re-list.
    pub fn restarting<F, W>(watch: F) -> Watch<T>
    where
        T: 'static,
        F: Fn() -> W + Send + Sync + 'static,
        W: Stream<Item = Result<Event<T>>> + Send + 'static,
    {
        let restart: Restart<T> = Arc::new(move || watch().boxed());
        let mut this = Self::new(restart());
        this.restart = Some(restart);
        this
    }

    pub fn instrument(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_backoff(mut self, backoff: time::Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Invokes `f` each time the underlying stream fails, before backing off.
    pub fn on_error(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Invokes `f` each time the stream is restarted after a failure.
    pub fn on_restart(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_restart = Some(Arc::new(f));
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Receive the next event in the stream.
    ///
    /// If the stream fails, log the error and sleep for the backoff before
    /// polling for a restart event. Returns `None` only if the underlying
    /// stream ends.
    pub async fn recv(&mut self) -> Option<Event<T>> {
        loop {
            let ev = self.rx.next().instrument(self.span.clone()).await?;

            match ev {
                Ok(ev) => {
                    self.initialized = true;
                    return Some(ev);
                }
                Err(error) => {
                    info!(parent: &self.span, %error, "Failed");
                    if let Some(on_error) = self.on_error.as_ref() {
                        on_error(&error);
                    }

                    time::sleep(self.backoff).await;
                    info!(parent: &self.span, "Restarting");
                    if let Some(restart) = self.restart.as_ref() {
                        self.rx = restart();
                    }
                    if let Some(on_restart) = self.on_restart.as_ref() {
                        on_restart();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn failure() -> Error {
        Error::WatchError(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "too old resource version".to_string(),
            reason: "Expired".to_string(),
            code: 410,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_after_backoff() {
        let events: Vec<Result<Event<u32>>> = vec![
            Ok(Event::Applied(1)),
            Err(failure()),
            Ok(Event::Restarted(vec![1, 2])),
        ];
        let failures = Arc::new(AtomicUsize::new(0));
        let f = failures.clone();
        let mut watch = Watch::from(stream::iter(events))
            .with_backoff(time::Duration::from_secs(5))
            .on_error(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            });
        assert!(!watch.is_initialized());

        assert!(matches!(watch.recv().await, Some(Event::Applied(1))));
        assert!(watch.is_initialized());

        let start = time::Instant::now();
        assert!(matches!(watch.recv().await, Some(Event::Restarted(_))));
        assert_eq!(start.elapsed(), time::Duration::from_secs(5));
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        assert!(watch.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_streams_are_rebuilt() {
        let builds = Arc::new(AtomicUsize::new(0));
        let restarts = Arc::new(AtomicUsize::new(0));
        let b = builds.clone();
        let r = restarts.clone();
        let mut watch = Watch::restarting(move || {
            let events: Vec<Result<Event<u32>>> = match b.fetch_add(1, Ordering::SeqCst) {
                0 => vec![Ok(Event::Restarted(vec![1])), Err(failure())],
                _ => vec![Ok(Event::Restarted(vec![1, 2]))],
            };
            // A kube watcher never ends on its own.
            stream::iter(events).chain(stream::pending())
        })
        .on_restart(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        assert!(matches!(watch.recv().await, Some(Event::Restarted(v)) if v == vec![1]));
        assert!(matches!(watch.recv().await, Some(Event::Restarted(v)) if v == vec![1, 2]));
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
    }
}
