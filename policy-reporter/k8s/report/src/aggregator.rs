use crate::{
    core::{Listener, PolicyViolation},
    k8s::{
        self,
        report::{ClusterPolicyReport, PolicyReport, PolicyReportResult, PolicyReportSummary, Timestamp},
        Api, ObjectMeta, ObjectReference, PostParams, ResourceExt,
    },
};
use chrono::{offset::Utc, DateTime};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const CLUSTER_REPORT_NAME: &str = "kyverno-cpolr-blocked";
pub const MANAGED_BY_LABEL: &str = "managed-by";
pub const MANAGED_BY: &str = "policy-reporter-kyverno-plugin";

const FAIL: &str = "fail";
const EVENT_NAME: &str = "eventName";
const RESULT_ID: &str = "resultID";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to get {0}: {1}")]
    Get(Scope, #[source] kube::Error),

    #[error("failed to create {0}: {1}")]
    Create(Scope, #[source] kube::Error),

    #[error("failed to update {0}: {1}")]
    Update(Scope, #[source] kube::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Identifies the report a violation is recorded in.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    Namespace(String),
    Cluster,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Report {
    Namespaced(PolicyReport),
    Cluster(ClusterPolicyReport),
}

/// Reads and writes reports in the cluster.
#[async_trait::async_trait]
pub trait ReportStore: Send + Sync + 'static {
    async fn get(&self, scope: &Scope) -> Result<Option<Report>>;

    /// Creates the report, or returns the existing one if it was created
    /// concurrently.
    async fn create(&self, report: Report) -> Result<Report>;

    /// Replaces the report. Fails if it was modified since it was read.
    async fn replace(&self, report: Report) -> Result<Report>;
}

#[derive(Clone)]
pub struct KubeReportStore {
    client: k8s::Client,
}

#[derive(Clone, Debug)]
pub struct AggregatorConfig {
    pub source: String,
    pub max_per_report: usize,
    pub keep_only_latest: bool,
}

/// Records violations in bounded, per-scope reports.
pub struct ReportAggregator<S> {
    store: S,
    config: AggregatorConfig,
}

// === impl Scope ===

impl Scope {
    pub fn for_violation(violation: &PolicyViolation) -> Self {
        match violation.resource.namespace() {
            Some(ns) => Self::Namespace(ns.to_string()),
            None => Self::Cluster,
        }
    }

    pub fn report_name(&self) -> String {
        match self {
            Self::Namespace(ns) => format!("polr-ns-{ns}-blocked"),
            Self::Cluster => CLUSTER_REPORT_NAME.to_string(),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Namespace(ns) => write!(f, "PolicyReport {ns}/{}", self.report_name()),
            Self::Cluster => write!(f, "ClusterPolicyReport {}", self.report_name()),
        }
    }
}

// === impl Report ===

impl Report {
    /// Builds an empty, labelled report for the scope.
    pub fn empty(scope: &Scope) -> Self {
        let labels = Some(
            [(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string())]
                .into_iter()
                .collect(),
        );
        match scope {
            Scope::Namespace(ns) => Self::Namespaced(PolicyReport::new(ObjectMeta {
                name: Some(scope.report_name()),
                namespace: Some(ns.clone()),
                labels,
                ..Default::default()
            })),
            Scope::Cluster => Self::Cluster(ClusterPolicyReport::new(ObjectMeta {
                name: Some(scope.report_name()),
                labels,
                ..Default::default()
            })),
        }
    }

    pub fn scope(&self) -> Scope {
        match self {
            Self::Namespaced(r) => Scope::Namespace(r.namespace().unwrap_or_default()),
            Self::Cluster(_) => Scope::Cluster,
        }
    }

    pub fn results(&self) -> &[PolicyReportResult] {
        match self {
            Self::Namespaced(r) => &r.results,
            Self::Cluster(r) => &r.results,
        }
    }

    pub fn summary(&self) -> &PolicyReportSummary {
        match self {
            Self::Namespaced(r) => &r.summary,
            Self::Cluster(r) => &r.summary,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::Namespaced(r) => &r.metadata,
            Self::Cluster(r) => &r.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::Namespaced(r) => &mut r.metadata,
            Self::Cluster(r) => &mut r.metadata,
        }
    }

    fn parts_mut(&mut self) -> (&mut Vec<PolicyReportResult>, &mut PolicyReportSummary) {
        match self {
            Self::Namespaced(r) => (&mut r.results, &mut r.summary),
            Self::Cluster(r) => (&mut r.results, &mut r.summary),
        }
    }
}

// === impl KubeReportStore ===

impl KubeReportStore {
    pub fn new(client: k8s::Client) -> Self {
        Self { client }
    }

    fn namespaced(&self, ns: &str) -> Api<PolicyReport> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn cluster(&self) -> Api<ClusterPolicyReport> {
        Api::all(self.client.clone())
    }
}

#[async_trait::async_trait]
impl ReportStore for KubeReportStore {
    async fn get(&self, scope: &Scope) -> Result<Option<Report>> {
        let name = scope.report_name();
        let res = match scope {
            Scope::Namespace(ns) => self
                .namespaced(ns)
                .get_opt(&name)
                .await
                .map(|r| r.map(Report::Namespaced)),
            Scope::Cluster => self
                .cluster()
                .get_opt(&name)
                .await
                .map(|r| r.map(Report::Cluster)),
        };
        res.map_err(|e| Error::Get(scope.clone(), e))
    }

    async fn create(&self, report: Report) -> Result<Report> {
        let scope = report.scope();
        let params = PostParams::default();
        let res = match &report {
            Report::Namespaced(r) => self
                .namespaced(&r.namespace().unwrap_or_default())
                .create(&params, r)
                .await
                .map(Report::Namespaced),
            Report::Cluster(r) => self
                .cluster()
                .create(&params, r)
                .await
                .map(Report::Cluster),
        };
        match res {
            Ok(report) => Ok(report),
            Err(kube::Error::Api(rsp)) if rsp.code == 409 => {
                debug!(%scope, "Report already exists");
                self.get(&scope)
                    .await?
                    .ok_or_else(|| Error::Create(scope, kube::Error::Api(rsp)))
            }
            Err(error) => Err(Error::Create(scope, error)),
        }
    }

    async fn replace(&self, report: Report) -> Result<Report> {
        let scope = report.scope();
        let name = scope.report_name();
        let params = PostParams::default();
        let res = match &report {
            Report::Namespaced(r) => self
                .namespaced(&r.namespace().unwrap_or_default())
                .replace(&name, &params, r)
                .await
                .map(Report::Namespaced),
            Report::Cluster(r) => self
                .cluster()
                .replace(&name, &params, r)
                .await
                .map(Report::Cluster),
        };
        res.map_err(|e| Error::Update(scope, e))
    }
}

// === impl ReportAggregator ===

impl<S: ReportStore> ReportAggregator<S> {
    pub fn new(store: S, config: AggregatorConfig) -> Self {
        Self { store, config }
    }

    pub async fn process_violation(&self, violation: &PolicyViolation) -> Result<()> {
        let scope = Scope::for_violation(violation);
        let mut report = match self.store.get(&scope).await? {
            Some(report) => report,
            None => self.store.create(Report::empty(&scope)).await?,
        };

        self.record(&mut report, violation);

        // The fetched resource version is carried through so that a
        // concurrent write fails rather than being overwritten.
        self.store.replace(report).await?;
        debug!(%scope, event = %violation.event.name, "Recorded violation");
        Ok(())
    }

    fn record(&self, report: &mut Report, violation: &PolicyViolation) {
        let (results, summary) = report.parts_mut();

        let max = self.config.max_per_report.max(1);
        if results.len() >= max {
            let evict = results.len() + 1 - max;
            for evicted in results.drain(..evict) {
                if evicted.result == FAIL {
                    summary.fail -= 1;
                }
            }
        }

        if violation.updated && self.config.keep_only_latest {
            let prior = results
                .iter()
                .position(|r| r.properties.get(EVENT_NAME) == Some(&violation.event.name));
            if let Some(idx) = prior {
                let superseded = results.remove(idx);
                if superseded.result == FAIL {
                    summary.fail -= 1;
                }
            }
        }

        results.push(build_result(violation, &self.config.source));
        summary.fail += 1;
    }
}

#[async_trait::async_trait]
impl<S: ReportStore> Listener<PolicyViolation> for ReportAggregator<S> {
    async fn on_event(&self, violation: &PolicyViolation) {
        if let Err(error) = self.process_violation(violation).await {
            warn!(%error, event = %violation.event.name, "Failed to record violation");
        }
    }
}

fn build_result(violation: &PolicyViolation, source: &str) -> PolicyReportResult {
    let resource = &violation.resource;
    PolicyReportResult {
        source: source.to_string(),
        policy: violation.policy.name.clone(),
        rule: violation.policy.rule.clone(),
        category: violation.policy.category.clone(),
        severity: violation.policy.severity.clone(),
        message: violation.policy.message.clone(),
        result: FAIL.to_string(),
        resources: vec![ObjectReference {
            kind: Some(resource.kind.clone()),
            namespace: resource.namespace().map(str::to_string),
            name: Some(resource.name.clone()),
            ..Default::default()
        }],
        timestamp: Timestamp {
            seconds: violation.timestamp.timestamp(),
            nanos: 0,
        },
        properties: BTreeMap::from([
            (EVENT_NAME.to_string(), violation.event.name.clone()),
            (
                RESULT_ID.to_string(),
                result_id(&violation.event.uid, violation.timestamp),
            ),
        ]),
    }
}

/// Derives a stable identifier for a result from the event that produced it.
pub fn result_id(event_uid: &str, timestamp: DateTime<Utc>) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{event_uid}_{}", timestamp.timestamp()));
    format!("{:x}", hasher.finalize())
}
