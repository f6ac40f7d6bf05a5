use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{Api, Client, runtime::watcher};
use pod_identity_crds::v1::{
    assigned::AzureAssignedIdentity, binding::AzureIdentityBinding, identity::AzureIdentity,
};
use pod_identity_k8s_utils::create_store_with_notifier;
use tokio::{
    select,
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    time::{Instant, Interval, MissedTickBehavior, interval_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    Result,
    cloud::CloudProvider,
    controller::{Context, PassState, reconcile},
    events::{EventSink, KubeEventRecorder},
    kubernetes::KubeSource,
    metrics::MicMetrics,
    source::ClusterSource,
};

const CONTROLLER_NAME: &str = "aad-pod-identity-mic";

/// Reason a pass was requested. Every trigger causes a full pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    PodCreated,
    PodDeleted,
    Resync,
}

#[derive(Debug, Clone)]
pub struct MicConfig {
    /// Namespace assigned identity records are written to.
    pub assignment_namespace: String,
    /// Interval of passes run without any trigger. `None` disables them.
    pub resync_interval: Option<Duration>,
    pub trigger_queue_capacity: usize,
    pub event_buffer_capacity: usize,
    /// How long to wait for the initial listing of each watched resource.
    pub store_timeout: Duration,
}

impl Default for MicConfig {
    fn default() -> Self {
        Self {
            assignment_namespace: "default".into(),
            resync_interval: Some(Duration::from_secs(3600)),
            trigger_queue_capacity: 64,
            event_buffer_capacity: 256,
            store_timeout: Duration::from_secs(30),
        }
    }
}

/// Producer side of the trigger queue.
#[derive(Clone)]
pub struct TriggerSender {
    tx: mpsc::Sender<Trigger>,
}

impl TriggerSender {
    /// Queues `trigger` without waiting. A full queue already holds a pass
    /// request, so the trigger is dropped.
    pub fn notify(&self, trigger: Trigger) {
        match self.tx.try_send(trigger) {
            Ok(()) => {}
            Err(TrySendError::Full(t)) => {
                debug!(trigger = ?t, "trigger queue full, pass already pending")
            }
            Err(TrySendError::Closed(t)) => {
                debug!(trigger = ?t, "sync loop stopped, dropping trigger")
            }
        }
    }
}

pub fn trigger_channel(capacity: usize) -> (TriggerSender, mpsc::Receiver<Trigger>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (TriggerSender { tx }, rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Reconciling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopStatus {
    pub state: LoopState,
    /// Passes completed, failed ones included.
    pub passes: u64,
}

/// Single consumer of the trigger queue. Runs one pass at a time.
pub struct SyncLoop<S, C, E> {
    ctx: Context<S, C, E>,
    state: PassState,
    triggers: mpsc::Receiver<Trigger>,
    resync_interval: Option<Duration>,
    status: watch::Sender<LoopStatus>,
}

impl<S, C, E> SyncLoop<S, C, E>
where
    S: ClusterSource,
    C: CloudProvider,
    E: EventSink,
{
    pub fn new(
        ctx: Context<S, C, E>,
        triggers: mpsc::Receiver<Trigger>,
        resync_interval: Option<Duration>,
    ) -> Self {
        let (status, _) = watch::channel(LoopStatus {
            state: LoopState::Idle,
            passes: 0,
        });
        Self {
            ctx,
            state: PassState::default(),
            triggers,
            resync_interval,
            status,
        }
    }

    pub fn status(&self) -> watch::Receiver<LoopStatus> {
        self.status.subscribe()
    }

    /// Runs until `cancel` fires or every trigger sender is dropped. A pass
    /// in flight when `cancel` fires runs to completion.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut resync = self.resync_interval.map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            let trigger = select! {
                biased;
                _ = cancel.cancelled() => break,
                trigger = self.triggers.recv() => match trigger {
                    Some(trigger) => trigger,
                    None => {
                        info!("trigger queue closed");
                        break;
                    }
                },
                _ = tick(&mut resync) => Trigger::Resync,
            };
            let coalesced = self.drain_pending();
            debug!(?trigger, coalesced, "starting pass");
            self.pass().await;
        }
        info!("sync loop stopped");
        Ok(())
    }

    /// Consumes triggers that arrived before the pass started; the pass
    /// covers them.
    fn drain_pending(&mut self) -> usize {
        let mut drained = 0;
        while self.triggers.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    async fn pass(&mut self) {
        self.status
            .send_modify(|status| status.state = LoopState::Reconciling);
        match reconcile(&self.ctx, &mut self.state).await {
            Ok(summary) if summary.is_complete() => {
                debug!(
                    applied = summary.applied,
                    removed = summary.removed,
                    "pass complete"
                )
            }
            Ok(summary) => info!(
                applied = summary.applied,
                removed = summary.removed,
                failed = ?summary.failed,
                deferred = ?summary.deferred,
                "pass left work for a later pass"
            ),
            Err(e) => error!("pass aborted: {e}"),
        }
        self.status.send_modify(|status| {
            status.state = LoopState::Idle;
            status.passes += 1;
        });
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn pod_trigger(event: &watcher::Event<Pod>) -> Option<Trigger> {
    match event {
        watcher::Event::Apply(_) => Some(Trigger::PodCreated),
        watcher::Event::Delete(_) => Some(Trigger::PodDeleted),
        watcher::Event::InitDone => Some(Trigger::Resync),
        watcher::Event::Init | watcher::Event::InitApply(_) => None,
    }
}

fn resync_on_change<K: 'static>(
    triggers: TriggerSender,
) -> impl Fn(&watcher::Event<K>) + Send + 'static {
    move |event: &watcher::Event<K>| match event {
        watcher::Event::Apply(_) | watcher::Event::Delete(_) | watcher::Event::InitDone => {
            triggers.notify(Trigger::Resync)
        }
        watcher::Event::Init | watcher::Event::InitApply(_) => {}
    }
}

/// Starts the watches feeding the trigger queue and runs the sync loop until
/// `cancel` fires. `ready` is cancelled once every watched resource has been
/// listed.
pub async fn start_mic<C>(
    client: Client,
    config: MicConfig,
    cloud: C,
    metrics: MicMetrics,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()>
where
    C: CloudProvider + 'static,
{
    let (triggers, receiver) = trigger_channel(config.trigger_queue_capacity);
    let timeout = Some(config.store_timeout);

    let pod_triggers = triggers.clone();
    let (pods, nodes, identities, bindings) = tokio::try_join!(
        create_store_with_notifier(Api::<Pod>::all(client.clone()), timeout, move |event| {
            if let Some(trigger) = pod_trigger(event) {
                pod_triggers.notify(trigger);
            }
        }),
        create_store_with_notifier(
            Api::<Node>::all(client.clone()),
            timeout,
            resync_on_change(triggers.clone()),
        ),
        create_store_with_notifier(
            Api::<AzureIdentity>::all(client.clone()),
            timeout,
            resync_on_change(triggers.clone()),
        ),
        create_store_with_notifier(
            Api::<AzureIdentityBinding>::all(client.clone()),
            timeout,
            resync_on_change(triggers.clone()),
        ),
    )?;
    info!("watches ready");

    let source = KubeSource::new(
        pods,
        nodes,
        identities,
        bindings,
        Api::<AzureAssignedIdentity>::namespaced(client.clone(), &config.assignment_namespace),
    );
    let (events, publisher) =
        KubeEventRecorder::start(client, CONTROLLER_NAME, config.event_buffer_capacity);
    let ctx = Context {
        source,
        cloud,
        events,
        assignment_namespace: config.assignment_namespace,
        metrics,
    };
    let sync_loop = SyncLoop::new(ctx, receiver, config.resync_interval);

    triggers.notify(Trigger::Resync);
    ready.cancel();
    let result = sync_loop.run(cancel).await;

    // The loop owned the last recorder handle; wait for its backlog.
    if let Err(e) = publisher.await {
        warn!("event recorder task failed: {e}");
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pod_identity_crds::v1::identity::IdentityType;
    use tokio::{task::JoinHandle, time::timeout};

    use super::*;
    use crate::{
        events::{Severity, reasons},
        memory::{MemoryCloud, MemoryCluster, MemoryEvents},
    };

    const WAIT: Duration = Duration::from_secs(5);

    struct Running {
        cluster: Arc<MemoryCluster>,
        cloud: Arc<MemoryCloud>,
        events: Arc<MemoryEvents>,
        triggers: TriggerSender,
        status: watch::Receiver<LoopStatus>,
        cancel: CancellationToken,
        handle: JoinHandle<Result<()>>,
    }

    impl Running {
        async fn wait_for_passes(&mut self, passes: u64) {
            timeout(WAIT, self.status.wait_for(|s| s.passes >= passes))
                .await
                .expect("passes completed in time")
                .expect("sync loop alive");
        }

        async fn stop(self) -> LoopStatus {
            self.cancel.cancel();
            timeout(WAIT, self.handle)
                .await
                .expect("sync loop stopped in time")
                .expect("sync loop task")
                .expect("sync loop result");
            *self.status.borrow()
        }
    }

    fn cluster() -> Arc<MemoryCluster> {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_identity(
            "test-id",
            "default",
            IdentityType::UserAssigned,
            "test-user-msi-resourceid",
            "test-user-msi-clientid",
        );
        cluster.add_binding("testbinding", "default", "test-id", "test-select");
        cluster.add_node("test-node");
        cluster
    }

    /// Queues `queued` triggers and then starts the loop.
    fn start(
        cluster: Arc<MemoryCluster>,
        queued: &[Trigger],
        resync_interval: Option<Duration>,
    ) -> Running {
        let events = Arc::new(MemoryEvents::new());
        let cloud = Arc::new(MemoryCloud::new());
        let ctx = Context {
            source: cluster.clone(),
            cloud: cloud.clone(),
            events: events.clone(),
            assignment_namespace: "default".into(),
            metrics: MicMetrics::default(),
        };
        let (triggers, receiver) = trigger_channel(8);
        for trigger in queued {
            triggers.notify(*trigger);
        }
        let sync_loop = SyncLoop::new(ctx, receiver, resync_interval);
        let status = sync_loop.status();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sync_loop.run(cancel.clone()));
        Running {
            cluster,
            cloud,
            events,
            triggers,
            status,
            cancel,
            handle,
        }
    }

    #[tokio::test]
    async fn pod_created_trigger_assigns_identity() {
        let cluster = cluster();
        cluster.add_pod("test-pod", "default", "test-node", "test-select");
        let mut running = start(cluster, &[Trigger::PodCreated], None);

        running.wait_for_passes(1).await;

        assert!(
            running
                .cluster
                .assigned_identity("test-pod-default-test-id")
                .is_some()
        );
        assert!(running.events.contains(
            Severity::Normal,
            reasons::BINDING_APPLIED,
            "Binding testbinding applied on node test-node for pod test-pod-default-test-id"
        ));
        let status = running.stop().await;
        assert_eq!(status.state, LoopState::Idle);
    }

    #[tokio::test]
    async fn pod_deleted_trigger_removes_identity() {
        let cluster = cluster();
        cluster.add_pod("test-pod", "default", "test-node", "test-select");
        let mut running = start(cluster, &[Trigger::PodCreated], None);
        running.wait_for_passes(1).await;

        running.cluster.delete_pod("test-pod", "default");
        running.triggers.notify(Trigger::PodDeleted);
        running.wait_for_passes(2).await;

        assert!(running.cluster.assigned_identities().is_empty());
        assert!(running.events.contains(
            Severity::Normal,
            reasons::BINDING_REMOVED,
            "Binding testbinding removed from node test-node for pod test-pod"
        ));
        running.stop().await;
    }

    #[tokio::test]
    async fn queued_triggers_coalesce_into_one_pass() {
        let cluster = cluster();
        cluster.add_pod("test-pod", "default", "test-node", "test-select");
        let mut running = start(
            cluster,
            &[Trigger::PodCreated, Trigger::PodCreated, Trigger::Resync],
            None,
        );

        running.wait_for_passes(1).await;
        let status = running.stop().await;

        assert_eq!(status.passes, 1);
    }

    #[tokio::test]
    async fn resync_interval_runs_passes_without_triggers() {
        let cluster = cluster();
        cluster.add_pod("test-pod", "default", "test-node", "test-select");
        let mut running = start(cluster, &[], Some(Duration::from_millis(20)));

        running.wait_for_passes(1).await;

        assert!(
            running
                .cluster
                .assigned_identity("test-pod-default-test-id")
                .is_some()
        );
        running.stop().await;
    }

    #[tokio::test]
    async fn cancel_during_pass_lets_the_pass_finish() {
        let cluster = cluster();
        cluster.add_pod("test-pod", "default", "test-node", "test-select");
        let mut running = start(cluster.clone(), &[Trigger::PodCreated], None);
        running.cloud.pause();

        timeout(
            WAIT,
            running
                .status
                .wait_for(|s| s.state == LoopState::Reconciling),
        )
        .await
        .expect("pass started in time")
        .expect("sync loop alive");
        running.cancel.cancel();
        tokio::task::yield_now().await;
        assert!(!running.handle.is_finished());

        running.cloud.resume();
        let status = running.stop().await;

        assert_eq!(status.passes, 1);
        assert_eq!(status.state, LoopState::Idle);
        assert!(cluster.assigned_identity("test-pod-default-test-id").is_some());
    }

    #[tokio::test]
    async fn aborted_pass_does_not_stop_the_loop() {
        let cluster = cluster();
        cluster.add_pod("test-pod", "default", "test-node", "test-select");
        cluster.set_listing_error(Some("apiserver unavailable"));
        let mut running = start(cluster, &[Trigger::PodCreated], None);
        running.wait_for_passes(1).await;
        assert!(running.cluster.assigned_identities().is_empty());

        running.cluster.set_listing_error(None);
        running.triggers.notify(Trigger::Resync);
        running.wait_for_passes(2).await;

        assert!(
            running
                .cluster
                .assigned_identity("test-pod-default-test-id")
                .is_some()
        );
        running.stop().await;
    }

    #[tokio::test]
    async fn loop_stops_on_cancel_while_idle() {
        let running = start(cluster(), &[], None);

        let status = running.stop().await;

        assert_eq!(status.passes, 0);
        assert_eq!(status.state, LoopState::Idle);
    }

    #[tokio::test]
    async fn loop_stops_when_every_sender_is_dropped() {
        let Running {
            triggers, handle, ..
        } = start(cluster(), &[], None);

        drop(triggers);

        timeout(WAIT, handle)
            .await
            .expect("sync loop stopped in time")
            .expect("sync loop task")
            .expect("sync loop result");
    }

    #[test]
    fn pod_watch_events_map_to_triggers() {
        let pod = Pod::default();
        assert_eq!(
            pod_trigger(&watcher::Event::Apply(pod.clone())),
            Some(Trigger::PodCreated)
        );
        assert_eq!(
            pod_trigger(&watcher::Event::Delete(pod.clone())),
            Some(Trigger::PodDeleted)
        );
        assert_eq!(pod_trigger(&watcher::Event::InitDone), Some(Trigger::Resync));
        assert_eq!(pod_trigger(&watcher::Event::Init), None);
        assert_eq!(pod_trigger(&watcher::Event::InitApply(pod)), None);
    }

    #[tokio::test]
    async fn full_queue_drops_triggers() {
        let (triggers, mut receiver) = trigger_channel(1);
        triggers.notify(Trigger::PodCreated);
        triggers.notify(Trigger::PodDeleted);

        assert_eq!(receiver.recv().await, Some(Trigger::PodCreated));
        assert!(receiver.try_recv().is_err());
    }
}
