use crate::{
    core::{LifecyclePublisher, PolicyId, PolicyKind, PolicyStore, ViolationPublisher},
    health,
    index::{
        watcher::{run_watch, watch_policies},
        CacheListener, KubePolicySource, PolicyMetrics, PolicyWatcher, Queue, SyncTracker,
        CLUSTER_POLICIES, POLICIES,
    },
    lease,
    report::{
        watch_events, AggregatorConfig, ElectionParams, KubeReportStore, LeaderCallbacks,
        LeaderElector, ReportAggregator, ViolationPipeline, ViolationWatcher,
    },
};
use anyhow::{anyhow, bail, Result};
use chrono::offset::Utc;
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, sync::Arc};
use tokio::time::Duration;
use tracing::{debug, error, info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "policy-reporter",
    about = "Reports Kyverno policies and the admission requests they block"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "kyverno_policy_reporter=info,warn",
        env = "POLICY_REPORTER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Number of workers processing policy changes.
    #[clap(long, default_value = "5")]
    workers: usize,

    #[clap(long, default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Disables the `kyverno_policy` metric.
    #[clap(long)]
    metrics_disabled: bool,

    /// Records blocked admission requests in policy reports.
    #[clap(long)]
    block_reports_enabled: bool,

    #[clap(long, default_value = "Kyverno Event")]
    block_reports_source: String,

    #[clap(long, default_value = "100")]
    max_results_per_report: usize,

    /// Replaces a report result when its event recurs instead of appending
    /// another.
    #[clap(long)]
    keep_only_latest: bool,

    /// Watches events in this namespace only. All namespaces by default.
    #[clap(long)]
    event_namespace: Option<String>,

    /// Runs the block report pipeline on a single replica at a time.
    #[clap(long)]
    leader_election_enabled: bool,

    #[clap(long, default_value = "kyverno-policy-reporter")]
    lease_name: String,

    #[clap(long, env = "POD_NAMESPACE")]
    lease_namespace: Option<String>,

    /// The identity used to claim the lease. Falls back to `HOSTNAME`.
    #[clap(long, env = "POD_NAME")]
    pod_name: Option<String>,

    #[clap(long, default_value = "15")]
    lease_duration_secs: u64,

    #[clap(long, default_value = "10")]
    renew_deadline_secs: u64,

    #[clap(long, default_value = "2")]
    retry_period_secs: u64,

    #[clap(long, default_value = "true", action = clap::ArgAction::Set)]
    release_on_cancel: bool,

    /// Delay before a failed watch is restarted.
    #[clap(long, default_value = "2")]
    watch_restart_secs: u64,
}

/// Where and as whom to contend for leadership.
struct Election {
    namespace: String,
    identity: String,
    params: ElectionParams,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            workers,
            health_addr,
            metrics_disabled,
            block_reports_enabled,
            block_reports_source,
            max_results_per_report,
            keep_only_latest,
            event_namespace,
            leader_election_enabled,
            lease_name,
            lease_namespace,
            pod_name,
            lease_duration_secs,
            renew_deadline_secs,
            retry_period_secs,
            release_on_cancel,
            watch_restart_secs,
        } = self;

        if max_results_per_report == 0 {
            bail!("--max-results-per-report must be at least 1");
        }

        let election = if block_reports_enabled && leader_election_enabled {
            let params = ElectionParams {
                lease_duration: Duration::from_secs(lease_duration_secs),
                renew_deadline: Duration::from_secs(renew_deadline_secs),
                retry_period: Duration::from_secs(retry_period_secs),
                release_on_cancel,
            };
            if params.renew_deadline >= params.lease_duration {
                bail!("--renew-deadline-secs must be less than --lease-duration-secs");
            }
            let namespace = lease_namespace
                .ok_or_else(|| anyhow!("--lease-namespace must be set for leader election"))?;
            let identity = pod_name
                .or_else(|| std::env::var("HOSTNAME").ok())
                .ok_or_else(|| anyhow!("--pod-name must be set for leader election"))?;
            Some(Election {
                namespace,
                identity,
                params,
            })
        } else {
            None
        };

        let mut prom = <Registry>::default();
        let metrics = if metrics_disabled {
            None
        } else {
            Some(PolicyMetrics::register(&mut prom))
        };

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;
        let client = runtime.client();
        let backoff = Duration::from_secs(watch_restart_secs);

        // Build the policy cache and the listeners that keep it and the
        // metrics up to date.
        let store = PolicyStore::default();
        let lifecycle = LifecyclePublisher::shared();
        lifecycle.register(CacheListener::new(store.clone()));
        if let Some(metrics) = metrics {
            lifecycle.register(metrics);
        }

        // Spawn policy watches. Each watch only feeds keys into the queue;
        // the workers resolve them and publish lifecycle events.
        let sync = SyncTracker::new([POLICIES, CLUSTER_POLICIES]);
        let queue = Queue::<PolicyId>::shared();
        let watcher = Arc::new(PolicyWatcher::new(
            KubePolicySource::new(client.clone()),
            lifecycle,
            queue.clone(),
        ));
        let _workers = watcher.spawn_workers(workers);

        for (kind, name) in [
            (PolicyKind::Policy, POLICIES),
            (PolicyKind::ClusterPolicy, CLUSTER_POLICIES),
        ] {
            let handle = sync
                .handle(name)
                .ok_or_else(|| anyhow!("{name} are not tracked"))?;
            tokio::spawn(
                run_watch(
                    watch_policies(client.clone(), kind, backoff),
                    queue.clone(),
                    handle,
                    runtime.shutdown_handle(),
                )
                .instrument(info_span!("watch", %kind)),
            );
        }

        let shutdown = runtime.shutdown_handle();
        let health_sync = sync.clone();
        tokio::spawn(
            async move {
                if let Err(error) = health::serve(health_addr, health_sync, shutdown).await {
                    error!(%error, "Health server failed");
                }
            }
            .instrument(info_span!("health")),
        );

        if block_reports_enabled {
            let violations = ViolationPublisher::shared();
            violations.register(ReportAggregator::new(
                KubeReportStore::new(client.clone()),
                AggregatorConfig {
                    source: block_reports_source,
                    max_per_report: max_results_per_report,
                    keep_only_latest,
                },
            ));

            let pipeline = {
                let client = client.clone();
                let store = store.clone();
                let sync = sync.clone();
                ViolationPipeline::new(move |shutdown: drain::Watch| {
                    let client = client.clone();
                    let namespace = event_namespace.clone();
                    let store = store.clone();
                    let violations = violations.clone();
                    let sync = sync.clone();
                    async move {
                        if !policies_synced(&sync, &shutdown).await {
                            return;
                        }
                        // Only events observed after the policy cache synced
                        // and leadership was acquired are reported.
                        let events = watch_events(client, namespace.as_deref(), backoff);
                        ViolationWatcher::new(store, Utc::now())
                            .run(events, violations, shutdown)
                            .await
                    }
                })
            };

            match election {
                Some(Election {
                    namespace,
                    identity,
                    params,
                }) => {
                    let manager = lease::init(client.clone(), &namespace, &lease_name).await?;
                    info!(lease = %lease_name, %namespace, %identity, "Contending for leadership");
                    let elector = LeaderElector::new(manager, identity, params);
                    tokio::spawn(
                        elector
                            .run(pipeline, runtime.shutdown_handle())
                            .instrument(info_span!("leader", lease = %lease_name)),
                    );
                }
                None => {
                    let shutdown = runtime.shutdown_handle();
                    tokio::spawn(
                        async move {
                            pipeline.on_started_leading().await;
                            let _release = shutdown.signaled().await;
                            pipeline.on_stopped_leading().await;
                        }
                        .instrument(info_span!("violations")),
                    );
                }
            }
        }

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Waits until every policy kind has synced, so that violations can be
/// correlated with a populated cache. Returns false if shutdown is signaled
/// first.
async fn policies_synced(sync: &SyncTracker, shutdown: &drain::Watch) -> bool {
    tokio::select! {
        _ = sync.synced() => true,
        _release = shutdown.clone().signaled() => {
            debug!("Shutdown before policies synced");
            false
        }
    }
}
