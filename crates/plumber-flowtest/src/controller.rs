//! FlowTest controller implementation
//!
//! Each reconcile performs at most one step of the lifecycle and returns how
//! long to wait before the next one:
//!
//! - (unset) → attach finalizer, mark Created
//! - Created → provision simulation, aggregator and slices, mark Running
//! - Running → after warm-up, verify slices until all pass or the deadline
//! - Completed → remove test resources (finalizer stays until deletion)
//! - Error → wait for deletion
//!
//! Deletion takes precedence over every phase.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use plumber_common::crd::{FlowTest, FlowTestPhase, FlowTestStatus};
use plumber_common::events::{
    actions, reasons, EventPublisher, KubeEventPublisher, NoopEventPublisher,
};
use plumber_common::{Error, Result};

use crate::cleanup::cleanup;
use crate::client::{KubeClient, KubeClientImpl};
use crate::config::ControllerConfig;
use crate::index::{AggregatorClient, LogIndex};
use crate::provision::provision;
use crate::verify::verify;

/// Finalizer guarding cleanup of test resources
pub const FLOWTEST_FINALIZER: &str = "loggingpipelineplumber.isala.me/finalizer";

/// Name the controller reports events as
pub const CONTROLLER_NAME: &str = "flowtest-controller";

/// Requeue delay after an unexpected reconcile error
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Shared context for the FlowTest controller
pub struct Context {
    /// Kubernetes operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Aggregator index listing
    pub index: Arc<dyn LogIndex>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Timings, images and policies
    pub config: ControllerConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context from explicit parts, for tests
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        index: Arc<dyn LogIndex>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            kube,
            index,
            events: Arc::new(NoopEventPublisher),
            config,
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    config: ControllerConfig,
    kube: Option<Arc<dyn KubeClient>>,
    index: Option<Arc<dyn LogIndex>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            config: ControllerConfig::default(),
            kube: None,
            index: None,
            events: None,
        }
    }

    /// Set the controller configuration
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the Kubernetes client
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the aggregator client
    pub fn log_index(mut self, index: Arc<dyn LogIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context> {
        let index = match self.index {
            Some(index) => index,
            None => {
                let client = AggregatorClient::new(self.config.index_endpoint())?;
                info!(endpoint = %client.endpoint(), "polling log aggregator indexes");
                Arc::new(client)
            }
        };
        Ok(Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            index,
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
            }),
            config: self.config,
        })
    }
}

/// What a Running FlowTest should do next
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunningStep {
    /// Deadline reached or everything passed
    Complete,
    /// Slices may not be active yet; wait this long
    WarmUp(Duration),
    /// Run a verification pass, then wait at most this long
    Verify(Duration),
}

/// Decide the next step of a Running FlowTest
pub fn running_step(
    created: DateTime<Utc>,
    now: DateTime<Utc>,
    status: &FlowTestStatus,
    config: &ControllerConfig,
) -> RunningStep {
    let elapsed = (now - created).to_std().unwrap_or(Duration::ZERO);
    if elapsed >= config.timeout || status.all_passed() {
        return RunningStep::Complete;
    }
    if elapsed < config.warmup {
        return RunningStep::WarmUp(config.warmup - elapsed);
    }
    RunningStep::Verify(config.poll_interval.min(config.timeout - elapsed))
}

fn created_at(flow_test: &FlowTest, now: DateTime<Utc>) -> DateTime<Utc> {
    flow_test
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0)
        .unwrap_or(now)
}

async fn publish(
    ctx: &Context,
    flow_test: &FlowTest,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    ctx.events
        .publish(&flow_test.object_ref(&()), type_, reason, action, Some(note))
        .await;
}

/// Reconcile a FlowTest
#[instrument(skip(flow_test, ctx), fields(flowtest = %flow_test.name_any()))]
pub async fn reconcile(flow_test: Arc<FlowTest>, ctx: Arc<Context>) -> Result<Action> {
    reconcile_at(&flow_test, &ctx, Utc::now()).await
}

/// Reconcile as of `now`
pub async fn reconcile_at(
    flow_test: &FlowTest,
    ctx: &Context,
    now: DateTime<Utc>,
) -> Result<Action> {
    if flow_test.is_deleting() {
        return handle_deletion(flow_test, ctx).await;
    }

    match flow_test.phase() {
        None => mark_created(flow_test, ctx).await,
        Some(FlowTestPhase::Created) => provision_test(flow_test, ctx, now).await,
        Some(FlowTestPhase::Running) => check_running(flow_test, ctx, now).await,
        Some(FlowTestPhase::Completed) => cleanup_completed(flow_test, ctx).await,
        Some(FlowTestPhase::Error) => {
            debug!("flow test is in Error, waiting for deletion");
            Ok(Action::await_change())
        }
    }
}

async fn mark_created(flow_test: &FlowTest, ctx: &Context) -> Result<Action> {
    if !flow_test.has_finalizer(FLOWTEST_FINALIZER) {
        ctx.kube.add_finalizer(flow_test, FLOWTEST_FINALIZER).await?;
    }
    ctx.kube
        .patch_status(flow_test, &FlowTestStatus::phase(FlowTestPhase::Created))
        .await?;
    info!("flow test accepted");
    publish(
        ctx,
        flow_test,
        EventType::Normal,
        reasons::CREATED,
        actions::RECONCILE,
        "flow test accepted".to_string(),
    )
    .await;
    Ok(Action::requeue(Duration::ZERO))
}

async fn provision_test(flow_test: &FlowTest, ctx: &Context, now: DateTime<Utc>) -> Result<Action> {
    match provision(flow_test, ctx.kube.as_ref(), &ctx.config).await {
        Ok(status) => {
            ctx.kube
                .patch_status(flow_test, &FlowTestStatus::phase(FlowTestPhase::Running))
                .await?;
            publish(
                ctx,
                flow_test,
                EventType::Normal,
                reasons::PROVISIONED,
                actions::PROVISION,
                format!(
                    "deployed {} match and {} filter slices",
                    status.match_status.len(),
                    status.filter_status.len()
                ),
            )
            .await;
            let created = created_at(flow_test, now);
            let wait = match running_step(created, now, &status, &ctx.config) {
                RunningStep::WarmUp(wait) => wait,
                RunningStep::Complete | RunningStep::Verify(_) => Duration::ZERO,
            };
            Ok(Action::requeue(wait))
        }
        Err(e) => {
            warn!(error = %e, "provisioning failed");
            publish(
                ctx,
                flow_test,
                EventType::Warning,
                reasons::PROVISION_FAILED,
                actions::PROVISION,
                e.to_string(),
            )
            .await;
            ctx.kube
                .patch_status(flow_test, &FlowTestStatus::phase(FlowTestPhase::Error))
                .await?;
            Ok(Action::await_change())
        }
    }
}

async fn check_running(flow_test: &FlowTest, ctx: &Context, now: DateTime<Utc>) -> Result<Action> {
    let status = flow_test.status.clone().unwrap_or_default();
    let created = created_at(flow_test, now);

    let next = match running_step(created, now, &status, &ctx.config) {
        RunningStep::Complete => return complete(flow_test, ctx).await,
        RunningStep::WarmUp(wait) => {
            debug!(remaining = ?wait, "waiting for slices to warm up");
            return Ok(Action::requeue(wait));
        }
        RunningStep::Verify(next) => next,
    };

    match verify(
        flow_test,
        ctx.kube.as_ref(),
        ctx.index.as_ref(),
        ctx.config.pass_policy,
    )
    .await
    {
        Ok(outcome) => {
            for slice in &outcome.passed {
                publish(
                    ctx,
                    flow_test,
                    EventType::Normal,
                    reasons::SLICE_PASSED,
                    actions::VERIFY,
                    format!("slice {slice} delivered logs"),
                )
                .await;
            }
            if outcome.all_passed() {
                return complete(flow_test, ctx).await;
            }
        }
        Err(e) => {
            warn!(error = %e, "verification pass failed");
            publish(
                ctx,
                flow_test,
                EventType::Warning,
                reasons::VERIFICATION_FAILED,
                actions::VERIFY,
                e.to_string(),
            )
            .await;
        }
    }
    Ok(Action::requeue(next))
}

async fn complete(flow_test: &FlowTest, ctx: &Context) -> Result<Action> {
    ctx.kube
        .patch_status(flow_test, &FlowTestStatus::phase(FlowTestPhase::Completed))
        .await?;
    info!("flow test completed");
    publish(
        ctx,
        flow_test,
        EventType::Normal,
        reasons::COMPLETED,
        actions::RECONCILE,
        "verification finished".to_string(),
    )
    .await;
    Ok(Action::requeue(Duration::ZERO))
}

async fn run_cleanup(flow_test: &FlowTest, ctx: &Context) -> Result<()> {
    match cleanup(ctx.kube.as_ref(), flow_test).await {
        Ok(report) => {
            if report.changed() {
                publish(
                    ctx,
                    flow_test,
                    EventType::Normal,
                    reasons::CLEANED_UP,
                    actions::CLEANUP,
                    format!(
                        "removed {} test resources{}",
                        report.test_resources,
                        if report.aggregator_removed {
                            " and the shared log aggregator"
                        } else {
                            ""
                        }
                    ),
                )
                .await;
            }
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "cleanup failed");
            publish(
                ctx,
                flow_test,
                EventType::Warning,
                reasons::CLEANUP_FAILED,
                actions::CLEANUP,
                e.to_string(),
            )
            .await;
            Err(e)
        }
    }
}

async fn cleanup_completed(flow_test: &FlowTest, ctx: &Context) -> Result<Action> {
    match run_cleanup(flow_test, ctx).await {
        Ok(()) => Ok(Action::await_change()),
        Err(_) => Ok(Action::requeue(ctx.config.poll_interval)),
    }
}

async fn handle_deletion(flow_test: &FlowTest, ctx: &Context) -> Result<Action> {
    if !flow_test.has_finalizer(FLOWTEST_FINALIZER) {
        return Ok(Action::await_change());
    }
    if run_cleanup(flow_test, ctx).await.is_err() {
        return Ok(Action::requeue(ctx.config.poll_interval));
    }
    ctx.kube
        .remove_finalizer(flow_test, FLOWTEST_FINALIZER)
        .await?;
    info!("finalizer removed");
    Ok(Action::await_change())
}

/// Error policy for the controller
pub fn error_policy(flow_test: Arc<FlowTest>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        flowtest = %flow_test.name_any(),
        "reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use plumber_common::crd::{
        ClusterFlow, ClusterFlowSpec, Flow, FlowSpec, FlowTestSpec, ReferenceObject, Rule,
    };
    use plumber_common::labels::flow_test_selector;
    use plumber_common::AGGREGATOR_NAME;
    use serde_json::json;

    use crate::client::MockKubeClient;
    use crate::fake::FakeKube;
    use crate::index::{Index, MockLogIndex};
    use crate::pipeline::{PipelineFlow, PipelineKind, PipelineOutput};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 3, 1, 10, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn sample_flow_test() -> FlowTest {
        let mut ft = FlowTest::new(
            "nginx-test",
            FlowTestSpec {
                reference_pod: ReferenceObject {
                    kind: "Pod".into(),
                    name: "nginx".into(),
                    namespace: "default".into(),
                },
                reference_flow: ReferenceObject {
                    kind: "Flow".into(),
                    name: "nginx-flow".into(),
                    namespace: "default".into(),
                },
                sent_messages: vec!["127.0.0.1 - GET /".into(), "127.0.0.1 - GET /health".into()],
            },
        );
        ft.metadata.namespace = Some("default".into());
        ft.metadata.uid = Some("uid1".into());
        ft.metadata.creation_timestamp = Some(Time(t0()));
        ft
    }

    fn with_phase(phase: FlowTestPhase) -> FlowTest {
        let mut ft = sample_flow_test();
        ft.metadata.finalizers = Some(vec![FLOWTEST_FINALIZER.to_string()]);
        ft.status = Some(FlowTestStatus::allocated(phase, 2, 1));
        ft
    }

    fn reference_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("nginx".into()),
                namespace: Some("default".into()),
                labels: Some(BTreeMap::from([("app".to_string(), "nginx".to_string())])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "nginx".into(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn reference_flow() -> PipelineFlow {
        PipelineFlow::Flow(Flow {
            metadata: ObjectMeta {
                name: Some("nginx-flow".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: FlowSpec {
                matches: vec![
                    Rule::new(json!({"select": {"labels": {"app": "nginx"}}})),
                    Rule::new(json!({"exclude": {"labels": {"env": "dev"}}})),
                ],
                filters: vec![Rule::new(json!({"parser": {"parse": {"type": "nginx"}}}))],
                local_output_refs: vec!["es-output".into()],
                global_output_refs: vec![],
            },
            status: None,
        })
    }

    /// Index listing whose content the test controls between reconciles
    #[derive(Default)]
    struct StaticIndex {
        indexes: Mutex<Vec<Index>>,
    }

    impl StaticIndex {
        fn set(&self, indexes: Vec<Index>) {
            *self.indexes.lock().expect("lock") = indexes;
        }
    }

    #[async_trait]
    impl LogIndex for StaticIndex {
        async fn list_indexes(&self) -> Result<Vec<Index>> {
            Ok(self.indexes.lock().expect("lock").clone())
        }
    }

    /// Captured status updates, checked without coupling to call order
    #[derive(Clone, Default)]
    struct StatusCapture {
        updates: Arc<Mutex<Vec<FlowTestStatus>>>,
    }

    impl StatusCapture {
        fn record(&self, status: FlowTestStatus) {
            self.updates.lock().expect("lock").push(status);
        }

        fn last_phase(&self) -> Option<FlowTestPhase> {
            self.updates
                .lock()
                .expect("lock")
                .iter()
                .rev()
                .find_map(|s| s.status)
        }

        fn was_updated(&self) -> bool {
            !self.updates.lock().expect("lock").is_empty()
        }
    }

    fn mock_with_capture() -> (MockKubeClient, StatusCapture) {
        let capture = StatusCapture::default();
        let c = capture.clone();
        let mut mock = MockKubeClient::new();
        mock.expect_patch_status().returning(move |_, s| {
            c.record(s.clone());
            Ok(())
        });
        (mock, capture)
    }

    fn context(kube: Arc<dyn KubeClient>, index: Arc<dyn LogIndex>) -> Context {
        Context::for_testing(kube, index, ControllerConfig::default())
    }

    mod running_schedule {
        use super::*;

        fn running(matches: usize, filters: usize) -> FlowTestStatus {
            FlowTestStatus::allocated(FlowTestPhase::Running, matches, filters)
        }

        #[test]
        fn warm_up_waits_for_the_remainder() {
            let config = ControllerConfig::default();
            assert_eq!(
                running_step(t0(), t0() + secs(20), &running(1, 0), &config),
                RunningStep::WarmUp(Duration::from_secs(40))
            );
        }

        #[test]
        fn verification_starts_after_warm_up() {
            let config = ControllerConfig::default();
            assert_eq!(
                running_step(t0(), t0() + secs(60), &running(1, 0), &config),
                RunningStep::Verify(Duration::from_secs(30))
            );
        }

        #[test]
        fn poll_never_overshoots_the_deadline() {
            let config = ControllerConfig::default();
            assert_eq!(
                running_step(t0(), t0() + secs(290), &running(1, 0), &config),
                RunningStep::Verify(Duration::from_secs(10))
            );
        }

        /// Story: a pipeline that never delivers completes exactly at the
        /// deadline, not before it.
        #[test]
        fn story_timeout_completes_at_deadline() {
            let config = ControllerConfig::default();
            assert_ne!(
                running_step(t0(), t0() + secs(299), &running(1, 0), &config),
                RunningStep::Complete
            );
            assert_eq!(
                running_step(t0(), t0() + secs(300), &running(1, 0), &config),
                RunningStep::Complete
            );
            assert_eq!(
                running_step(t0(), t0() + secs(3600), &running(1, 0), &config),
                RunningStep::Complete
            );
        }

        #[test]
        fn everything_passed_completes_early() {
            let config = ControllerConfig::default();
            let mut status = running(1, 1);
            status.match_status[0] = true;
            status.filter_status[0] = true;
            assert_eq!(
                running_step(t0(), t0() + secs(61), &status, &config),
                RunningStep::Complete
            );
        }

        #[test]
        fn clock_skew_counts_as_just_created() {
            let config = ControllerConfig::default();
            assert_eq!(
                running_step(t0(), t0() - secs(5), &running(1, 0), &config),
                RunningStep::WarmUp(config.warmup)
            );
        }
    }

    mod lifecycle {
        use super::*;

        /// Story: a freshly created FlowTest gets the finalizer and Created
        /// phase, then is requeued immediately.
        #[tokio::test]
        async fn story_new_flow_test_is_accepted() {
            let (mut mock, capture) = mock_with_capture();
            mock.expect_add_finalizer()
                .withf(|_, f| f == FLOWTEST_FINALIZER)
                .times(1)
                .returning(|_, _| Ok(()));
            let ctx = context(Arc::new(mock), Arc::new(MockLogIndex::new()));

            let action = reconcile_at(&sample_flow_test(), &ctx, t0())
                .await
                .expect("reconcile should succeed");

            assert_eq!(capture.last_phase(), Some(FlowTestPhase::Created));
            assert_eq!(action, Action::requeue(Duration::ZERO));
        }

        #[tokio::test]
        async fn finalizer_already_present_is_not_added_twice() {
            let (mut mock, capture) = mock_with_capture();
            mock.expect_add_finalizer().never();
            let ctx = context(Arc::new(mock), Arc::new(MockLogIndex::new()));
            let mut ft = sample_flow_test();
            ft.metadata.finalizers = Some(vec![FLOWTEST_FINALIZER.to_string()]);

            reconcile_at(&ft, &ctx, t0())
                .await
                .expect("reconcile should succeed");
            assert!(capture.was_updated());
        }

        /// Story: the reference pod was deleted before provisioning; the test
        /// lands in Error and the reconcile itself still succeeds.
        #[tokio::test]
        async fn story_provision_failure_moves_to_error() {
            let (mut mock, capture) = mock_with_capture();
            mock.expect_get_pod().returning(|_, _| Ok(None));
            let ctx = context(Arc::new(mock), Arc::new(MockLogIndex::new()));

            let action = reconcile_at(&with_phase(FlowTestPhase::Created), &ctx, t0())
                .await
                .expect("provision failure is not a reconcile error");

            assert_eq!(capture.last_phase(), Some(FlowTestPhase::Error));
            assert_eq!(action, Action::await_change());
        }

        #[tokio::test]
        async fn error_phase_waits_for_deletion() {
            // no expectations: any API call would panic
            let ctx = context(Arc::new(MockKubeClient::new()), Arc::new(MockLogIndex::new()));

            let action = reconcile_at(&with_phase(FlowTestPhase::Error), &ctx, t0())
                .await
                .expect("reconcile should succeed");
            assert_eq!(action, Action::await_change());
        }

        #[tokio::test]
        async fn running_in_warm_up_makes_no_calls() {
            let ctx = context(Arc::new(MockKubeClient::new()), Arc::new(MockLogIndex::new()));

            let action = reconcile_at(&with_phase(FlowTestPhase::Running), &ctx, t0() + secs(45))
                .await
                .expect("reconcile should succeed");
            assert_eq!(action, Action::requeue(Duration::from_secs(15)));
        }

        #[tokio::test]
        async fn running_past_deadline_completes() {
            let (mock, capture) = mock_with_capture();
            let ctx = context(Arc::new(mock), Arc::new(MockLogIndex::new()));

            let action = reconcile_at(&with_phase(FlowTestPhase::Running), &ctx, t0() + secs(301))
                .await
                .expect("reconcile should succeed");

            assert_eq!(capture.last_phase(), Some(FlowTestPhase::Completed));
            assert_eq!(action, Action::requeue(Duration::ZERO));
        }

        /// Story: the aggregator is briefly unreachable; the pass is reported
        /// as a warning and retried on the normal schedule.
        #[tokio::test]
        async fn story_verification_errors_are_not_fatal() {
            let (mut mock, capture) = mock_with_capture();
            mock.expect_get_flow()
                .returning(|_, _, _| Ok(Some(reference_flow())));
            mock.expect_list_flows().returning(|_, _| Ok(vec![]));
            let mut index = MockLogIndex::new();
            index
                .expect_list_indexes()
                .returning(|| Err(Error::aggregator("http://agg/", "connection refused")));
            let ctx = context(Arc::new(mock), Arc::new(index));

            let action = reconcile_at(&with_phase(FlowTestPhase::Running), &ctx, t0() + secs(90))
                .await
                .expect("verification errors do not fail the reconcile");

            assert!(!capture.was_updated());
            assert_eq!(action, Action::requeue(Duration::from_secs(30)));
        }

        #[tokio::test]
        async fn status_patch_failure_is_a_reconcile_error() {
            let mut mock = MockKubeClient::new();
            mock.expect_add_finalizer().returning(|_, _| Ok(()));
            mock.expect_patch_status()
                .returning(|_, _| Err(Error::internal("apiserver unavailable")));
            let ctx = context(Arc::new(mock), Arc::new(MockLogIndex::new()));

            assert!(reconcile_at(&sample_flow_test(), &ctx, t0()).await.is_err());
        }

        #[tokio::test]
        async fn deletion_without_finalizer_is_a_no_op() {
            let ctx = context(Arc::new(MockKubeClient::new()), Arc::new(MockLogIndex::new()));
            let mut ft = sample_flow_test();
            ft.metadata.deletion_timestamp = Some(Time(t0()));

            let action = reconcile_at(&ft, &ctx, t0())
                .await
                .expect("reconcile should succeed");
            assert_eq!(action, Action::await_change());
        }

        #[test]
        fn error_policy_requeues() {
            let ctx = Arc::new(context(
                Arc::new(MockKubeClient::new()),
                Arc::new(MockLogIndex::new()),
            ));
            let action = error_policy(
                Arc::new(sample_flow_test()),
                &Error::internal("boom"),
                ctx,
            );
            assert_eq!(action, Action::requeue(ERROR_REQUEUE));
        }
    }

    /// Multi-step scenarios against the in-memory cluster
    mod end_to_end {
        use super::*;

        fn cluster() -> Arc<FakeKube> {
            let fake = Arc::new(FakeKube::new());
            fake.add_flow_test(sample_flow_test());
            fake.add_pod(reference_pod());
            fake.add_flow(reference_flow());
            fake
        }

        async fn step(fake: &FakeKube, ctx: &Context, at: DateTime<Utc>) -> Action {
            let ft = fake.flow_test("nginx-test");
            reconcile_at(&ft, ctx, at)
                .await
                .expect("reconcile should succeed")
        }

        /// Story: a Flow with two match rules and one filter. Only the first
        /// match slice ever delivers; after the deadline the test completes
        /// with exactly that rule marked, and deletion leaves nothing behind.
        #[tokio::test]
        async fn story_two_matches_one_filter() {
            let fake = cluster();
            let index = Arc::new(StaticIndex::default());
            let ctx = context(fake.clone(), index.clone());

            // unset → Created
            assert_eq!(step(&fake, &ctx, t0()).await, Action::requeue(Duration::ZERO));
            let ft = fake.flow_test("nginx-test");
            assert_eq!(ft.phase(), Some(FlowTestPhase::Created));
            assert!(ft.has_finalizer(FLOWTEST_FINALIZER));

            // Created → Running
            let action = step(&fake, &ctx, t0() + secs(2)).await;
            assert_eq!(action, Action::requeue(Duration::from_secs(58)));
            let ft = fake.flow_test("nginx-test");
            assert_eq!(ft.phase(), Some(FlowTestPhase::Running));
            let status = ft.status.clone().expect("status");
            assert_eq!(status.match_status, vec![false, false]);
            assert_eq!(status.filter_status, vec![false]);

            let mut slices = fake.slice_flow_names();
            slices.sort();
            assert_eq!(slices, vec!["uid1-0-match", "uid1-1-match", "uid1-2-filter"]);
            assert_eq!(fake.output_names().len(), 3);
            assert_eq!(fake.config_map_names(), vec!["uid1-configmap"]);
            let mut pods = fake.pod_names();
            pods.sort();
            assert_eq!(pods, vec![AGGREGATOR_NAME, "nginx", "uid1-simulation"]);
            assert_eq!(fake.service_names(), vec![AGGREGATOR_NAME]);

            // first verification pass
            index.set(vec![Index {
                name: "uid1-0-match".into(),
                log_count: 3,
                ..Default::default()
            }]);
            let action = step(&fake, &ctx, t0() + secs(61)).await;
            assert_eq!(action, Action::requeue(Duration::from_secs(30)));
            let status = fake.flow_test("nginx-test").status.expect("status");
            assert_eq!(status.match_status, vec![true, false]);
            assert_eq!(status.filter_status, vec![false]);
            assert!(!fake.slice_flow_names().contains(&"uid1-0-match".to_string()));

            // a second pass with the same listing changes nothing
            step(&fake, &ctx, t0() + secs(91)).await;
            let status = fake.flow_test("nginx-test").status.expect("status");
            assert_eq!(status.match_status, vec![true, false]);

            // deadline
            assert_eq!(
                step(&fake, &ctx, t0() + secs(301)).await,
                Action::requeue(Duration::ZERO)
            );
            assert_eq!(
                fake.flow_test("nginx-test").phase(),
                Some(FlowTestPhase::Completed)
            );

            // Completed → cleanup; finalizer stays
            assert_eq!(step(&fake, &ctx, t0() + secs(302)).await, Action::await_change());
            assert!(fake.slice_flow_names().is_empty());
            assert!(fake.output_names().is_empty());
            assert!(fake.config_map_names().is_empty());
            assert_eq!(fake.pod_names(), vec!["nginx"]);
            assert!(fake.service_names().is_empty());
            assert!(fake.flow_test("nginx-test").has_finalizer(FLOWTEST_FINALIZER));

            // deletion releases the finalizer
            fake.update_flow_test("nginx-test", |ft| {
                ft.metadata.deletion_timestamp = Some(Time(t0() + secs(400)));
            });
            assert_eq!(step(&fake, &ctx, t0() + secs(400)).await, Action::await_change());
            assert!(!fake.flow_test("nginx-test").has_finalizer(FLOWTEST_FINALIZER));
        }

        /// Story: every slice delivers on the first pass, so the test does not
        /// wait for the deadline.
        #[tokio::test]
        async fn story_all_passing_completes_early() {
            let fake = cluster();
            let index = Arc::new(StaticIndex::default());
            let ctx = context(fake.clone(), index.clone());

            step(&fake, &ctx, t0()).await;
            step(&fake, &ctx, t0() + secs(1)).await;
            index.set(
                ["uid1-0-match", "uid1-1-match", "uid1-2-filter"]
                    .into_iter()
                    .map(|name| Index {
                        name: name.into(),
                        log_count: 1,
                        ..Default::default()
                    })
                    .collect(),
            );

            assert_eq!(
                step(&fake, &ctx, t0() + secs(61)).await,
                Action::requeue(Duration::ZERO)
            );
            let ft = fake.flow_test("nginx-test");
            assert_eq!(ft.phase(), Some(FlowTestPhase::Completed));
            assert!(ft.status.expect("status").all_passed());
        }

        /// Story: a user deletes a Running test. Its own resources go and the
        /// finalizer is released, but the aggregator stays: the deleting test
        /// still counts as a user of it. A repeated cleanup finds nothing.
        #[tokio::test]
        async fn story_deleting_running_test_cleans_up() {
            let fake = cluster();
            let ctx = context(fake.clone(), Arc::new(StaticIndex::default()));
            step(&fake, &ctx, t0()).await;
            step(&fake, &ctx, t0() + secs(1)).await;

            fake.update_flow_test("nginx-test", |ft| {
                ft.metadata.deletion_timestamp = Some(Time(t0() + secs(10)));
            });
            step(&fake, &ctx, t0() + secs(10)).await;

            assert!(fake.slice_flow_names().is_empty());
            assert!(fake.output_names().is_empty());
            assert!(fake.config_map_names().is_empty());
            let mut pods = fake.pod_names();
            pods.sort();
            assert_eq!(pods, vec![AGGREGATOR_NAME, "nginx"]);
            assert_eq!(fake.service_names(), vec![AGGREGATOR_NAME]);
            assert!(!fake.flow_test("nginx-test").has_finalizer(FLOWTEST_FINALIZER));

            let ft = fake.flow_test("nginx-test");
            let report = cleanup(fake.as_ref(), &ft)
                .await
                .expect("second cleanup should succeed");
            assert_eq!(report.test_resources, 0);
        }

        /// Story: the API server refuses deletes; the finalizer must stay so
        /// the test resources are not orphaned.
        #[tokio::test]
        async fn story_failed_cleanup_keeps_finalizer() {
            let fake = cluster();
            let ctx = context(fake.clone(), Arc::new(StaticIndex::default()));
            step(&fake, &ctx, t0()).await;
            step(&fake, &ctx, t0() + secs(1)).await;

            fake.set_fail_deletes(true);
            fake.update_flow_test("nginx-test", |ft| {
                ft.metadata.deletion_timestamp = Some(Time(t0() + secs(10)));
            });
            let action = step(&fake, &ctx, t0() + secs(10)).await;

            assert_eq!(action, Action::requeue(ctx.config.poll_interval));
            assert!(fake.flow_test("nginx-test").has_finalizer(FLOWTEST_FINALIZER));
        }

        /// Story: the reference is a ClusterFlow. Slices are ClusterFlows
        /// routing to ClusterOutputs through globalOutputRefs, and cleanup
        /// removes both cluster kinds.
        #[tokio::test]
        async fn story_cluster_flow_reference() {
            let fake = Arc::new(FakeKube::new());
            let mut ft = sample_flow_test();
            ft.spec.reference_flow.kind = "ClusterFlow".into();
            ft.spec.reference_flow.name = "all-nginx".into();
            fake.add_flow_test(ft);
            fake.add_pod(reference_pod());
            fake.add_flow(PipelineFlow::ClusterFlow(ClusterFlow {
                metadata: ObjectMeta {
                    name: Some("all-nginx".into()),
                    namespace: Some("default".into()),
                    ..Default::default()
                },
                spec: ClusterFlowSpec {
                    matches: vec![Rule::new(json!({"select": {"labels": {"app": "nginx"}}}))],
                    filters: vec![Rule::new(json!({"parser": {"parse": {"type": "nginx"}}}))],
                    global_output_refs: vec!["es-output".into()],
                },
                status: None,
            }));
            let index = Arc::new(StaticIndex::default());
            let ctx = context(fake.clone(), index.clone());

            step(&fake, &ctx, t0()).await;
            step(&fake, &ctx, t0() + secs(1)).await;

            let slices = fake
                .list_flows(PipelineKind::ClusterFlow, &flow_test_selector("nginx-test"))
                .await
                .expect("listing slices should succeed");
            assert_eq!(slices.len(), 2);
            for slice in &slices {
                let PipelineFlow::ClusterFlow(flow) = slice else {
                    panic!("slice {} should be a ClusterFlow", slice.name());
                };
                assert_eq!(flow.spec.global_output_refs, vec![slice.name()]);
            }
            let outputs = fake.outputs();
            assert_eq!(outputs.len(), 2);
            assert!(outputs
                .iter()
                .all(|o| matches!(o, PipelineOutput::ClusterOutput(_))));

            index.set(vec![
                Index {
                    name: "uid1-0-match".into(),
                    log_count: 2,
                    ..Default::default()
                },
                Index {
                    name: "uid1-1-filter".into(),
                    log_count: 2,
                    ..Default::default()
                },
            ]);
            assert_eq!(
                step(&fake, &ctx, t0() + secs(61)).await,
                Action::requeue(Duration::ZERO)
            );
            let ft = fake.flow_test("nginx-test");
            assert_eq!(ft.phase(), Some(FlowTestPhase::Completed));
            assert!(ft.status.expect("status").all_passed());

            step(&fake, &ctx, t0() + secs(62)).await;
            assert!(fake.slice_flow_names().is_empty());
            assert!(fake.outputs().is_empty());
            assert_eq!(fake.pod_names(), vec!["nginx"]);
        }

        /// Story: another FlowTest is still Running when this one completes;
        /// the shared aggregator must survive.
        #[tokio::test]
        async fn story_aggregator_survives_active_sibling() {
            let fake = cluster();
            let mut sibling = sample_flow_test();
            sibling.metadata.name = Some("other-test".into());
            sibling.metadata.uid = Some("uid2".into());
            sibling.status = Some(FlowTestStatus::phase(FlowTestPhase::Running));
            fake.add_flow_test(sibling);
            let ctx = context(fake.clone(), Arc::new(StaticIndex::default()));

            step(&fake, &ctx, t0()).await;
            step(&fake, &ctx, t0() + secs(1)).await;
            step(&fake, &ctx, t0() + secs(301)).await;
            step(&fake, &ctx, t0() + secs(302)).await;

            assert_eq!(
                fake.flow_test("nginx-test").phase(),
                Some(FlowTestPhase::Completed)
            );
            assert!(fake.slice_flow_names().is_empty());
            assert_eq!(fake.service_names(), vec![AGGREGATOR_NAME]);
            assert!(fake.pod_names().contains(&AGGREGATOR_NAME.to_string()));
        }
    }
}
