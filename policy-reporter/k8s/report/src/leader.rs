use chrono::{offset::Utc, DateTime};
use futures::future::BoxFuture;
use kubert::lease::{self, Claim, ClaimParams, LeaseManager};
use parking_lot::Mutex;
use std::{future::Future, sync::Arc};
use tokio::{sync::watch, task::JoinHandle, time};
use tracing::{debug, info, warn, Instrument};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ElectionParams {
    /// How long a claim is valid once acquired or renewed.
    pub lease_duration: time::Duration,

    /// How long an attempt to acquire or renew the claim may take. A leader
    /// that has gone this long without a successful renewal steps down,
    /// even if its claim has not yet expired.
    pub renew_deadline: time::Duration,

    /// The interval between attempts to acquire or renew the claim.
    pub retry_period: time::Duration,

    /// Vacate the lease on shutdown so that another replica may take over
    /// without waiting for the claim to expire.
    pub release_on_cancel: bool,
}

/// Acquires, renews and releases a lease on behalf of a claimant.
#[async_trait::async_trait]
pub trait LeaseClaims: Send + Sync + 'static {
    /// Returns the current claim, acquiring or renewing it for `claimant`
    /// when possible.
    async fn ensure_claimed(
        &self,
        claimant: &str,
        params: &ClaimParams,
    ) -> Result<Arc<Claim>, lease::Error>;

    /// Clears the claim if it is held by `claimant`. Returns whether a claim
    /// was released.
    async fn vacate(&self, claimant: &str) -> Result<bool, lease::Error>;
}

/// Observes leadership transitions.
#[async_trait::async_trait]
pub trait LeaderCallbacks: Send + Sync + 'static {
    async fn on_started_leading(&self);

    /// Returns once all work started by `on_started_leading` has stopped.
    async fn on_stopped_leading(&self);

    async fn on_new_leader(&self, identity: &str);
}

/// Contends for a lease and drives [`LeaderCallbacks`] as its holder changes.
pub struct LeaderElector<L = LeaseManager> {
    lease: L,
    identity: String,
    params: ElectionParams,
}

/// Tracks whether this replica leads, given a stream of claims.
struct Leadership<C> {
    identity: String,
    renew_deadline: time::Duration,
    callbacks: C,
    leading: bool,
    holder: Option<String>,
}

/// Runs the violation watcher only while this replica leads.
pub struct ViolationPipeline {
    spawn: Box<dyn Fn(drain::Watch) -> BoxFuture<'static, ()> + Send + Sync>,
    running: Mutex<Option<Running>>,
}

struct Running {
    signal: drain::Signal,
    task: JoinHandle<()>,
}

// === impl ElectionParams ===

impl ElectionParams {
    /// The claim is renewed once less than this remains before it expires.
    fn renew_grace_period(&self) -> time::Duration {
        self.lease_duration.saturating_sub(self.renew_deadline)
    }
}

impl Default for ElectionParams {
    fn default() -> Self {
        Self {
            lease_duration: time::Duration::from_secs(15),
            renew_deadline: time::Duration::from_secs(10),
            retry_period: time::Duration::from_secs(2),
            release_on_cancel: true,
        }
    }
}

// === impl LeaseManager ===

#[async_trait::async_trait]
impl LeaseClaims for LeaseManager {
    async fn ensure_claimed(
        &self,
        claimant: &str,
        params: &ClaimParams,
    ) -> Result<Arc<Claim>, lease::Error> {
        LeaseManager::ensure_claimed(self, claimant, params).await
    }

    async fn vacate(&self, claimant: &str) -> Result<bool, lease::Error> {
        LeaseManager::vacate(self, claimant).await
    }
}

// === impl LeaderElector ===

impl<L: LeaseClaims> LeaderElector<L> {
    pub fn new(lease: L, identity: impl Into<String>, params: ElectionParams) -> Self {
        Self {
            lease,
            identity: identity.into(),
            params,
        }
    }

    /// Contends for the lease until shutdown.
    ///
    /// When shutdown is signaled, leadership is given up (and the lease
    /// vacated, if configured) before the shutdown is released.
    pub async fn run(self, callbacks: impl LeaderCallbacks, shutdown: drain::Watch) {
        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);

        let (tx, rx) = loop {
            tokio::select! {
                claim = self.claim() => if let Some(claim) = claim {
                    break watch::channel(claim);
                },
                _release = &mut shutdown => return,
            }
            tokio::select! {
                _ = time::sleep(self.params.retry_period) => {}
                _release = &mut shutdown => return,
            }
        };

        let leadership = Leadership::new(
            self.identity.clone(),
            self.params.renew_deadline,
            callbacks,
        );
        let leadership = tokio::spawn(leadership.run(rx).in_current_span());

        let _release = loop {
            tokio::select! {
                _ = time::sleep(self.params.retry_period) => {}
                release = &mut shutdown => break release,
            }
            if let Some(claim) = self.claim().await {
                if tx.send(claim).is_err() {
                    warn!("Leadership task ended");
                }
            }
        };

        debug!("Shutdown");
        drop(tx);
        if let Err(error) = leadership.await {
            warn!(%error, "Leadership task failed");
        }

        if self.params.release_on_cancel {
            match self.lease.vacate(&self.identity).await {
                Ok(true) => info!("Released lease"),
                Ok(false) => debug!("Lease was not held"),
                Err(error) => warn!(%error, "Failed to release lease"),
            }
        }
    }

    /// Acquires or renews the claim, returning the current claim if the
    /// attempt completes in time.
    async fn claim(&self) -> Option<Arc<Claim>> {
        let params = ClaimParams {
            lease_duration: self.params.lease_duration,
            renew_grace_period: self.params.renew_grace_period(),
        };
        match time::timeout(
            self.params.renew_deadline,
            self.lease.ensure_claimed(&self.identity, &params),
        )
        .await
        {
            Ok(Ok(claim)) => Some(claim),
            Ok(Err(error)) => {
                warn!(%error, "Failed to claim lease");
                None
            }
            Err(_) => {
                warn!(deadline = ?self.params.renew_deadline, "Timed out claiming lease");
                None
            }
        }
    }
}

// === impl Leadership ===

impl<C: LeaderCallbacks> Leadership<C> {
    fn new(identity: String, renew_deadline: time::Duration, callbacks: C) -> Self {
        Self {
            identity,
            renew_deadline,
            callbacks,
            leading: false,
            holder: None,
        }
    }

    /// Follows claims until the sender is dropped, then stops leading.
    ///
    /// Each claim received counts as a successful renewal.
    async fn run(mut self, mut claims: watch::Receiver<Arc<Claim>>) {
        loop {
            let claim = claims.borrow_and_update().clone();
            self.observe(&claim).await;

            if self.leading {
                // Step down if the claim lapses or is not renewed in time.
                let lapse = until(claim.expiry).min(self.renew_deadline);
                tokio::select! {
                    res = claims.changed() => if res.is_err() { break },
                    _ = time::sleep(lapse) => {
                        warn!("Claim was not renewed");
                        self.stop().await;
                        if claims.changed().await.is_err() {
                            break;
                        }
                    }
                }
            } else if claims.changed().await.is_err() {
                break;
            }
        }

        self.stop().await;
    }

    async fn observe(&mut self, claim: &Claim) {
        if self.holder.as_deref() != Some(claim.holder.as_str()) {
            self.holder = Some(claim.holder.clone());
            info!(leader = %claim.holder, "New leader");
            self.callbacks.on_new_leader(&claim.holder).await;
        }

        let current = claim.is_current_for(&self.identity);
        if current && !self.leading {
            self.leading = true;
            info!("Started leading");
            self.callbacks.on_started_leading().await;
        } else if !current {
            self.stop().await;
        }
    }

    async fn stop(&mut self) {
        if self.leading {
            self.leading = false;
            info!("Stopped leading");
            self.callbacks.on_stopped_leading().await;
        }
    }
}

fn until(expiry: DateTime<Utc>) -> time::Duration {
    (expiry - Utc::now()).to_std().unwrap_or_default()
}

// === impl ViolationPipeline ===

impl ViolationPipeline {
    /// `spawn` builds the pipeline's task each time leadership is acquired.
    /// The task must complete once its shutdown watch is signaled.
    pub fn new<F, Fut>(spawn: F) -> Self
    where
        F: Fn(drain::Watch) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            spawn: Box::new(move |shutdown| Box::pin(spawn(shutdown))),
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

#[async_trait::async_trait]
impl LeaderCallbacks for ViolationPipeline {
    async fn on_started_leading(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }
        let (signal, shutdown) = drain::channel();
        let task = tokio::spawn((self.spawn)(shutdown).in_current_span());
        *running = Some(Running { signal, task });
    }

    async fn on_stopped_leading(&self) {
        let running = self.running.lock().take();
        if let Some(Running { signal, task }) = running {
            signal.drain().await;
            if let Err(error) = task.await {
                warn!(%error, "Violation pipeline failed");
            }
        }
    }

    async fn on_new_leader(&self, identity: &str) {
        debug!(%identity, "Violation pipeline follows new leader");
    }
}
