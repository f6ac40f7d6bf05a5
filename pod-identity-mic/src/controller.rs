use std::collections::{BTreeMap, BTreeSet};

use futures::future::join_all;
use pod_identity_crds::v1::assigned::AzureAssignedIdentity;
use tracing::{info, warn};

use crate::{
    Result,
    assignment::AssignmentStore,
    cloud::CloudProvider,
    desired::{Snapshot, build_desired_state},
    diff::{diff_assignments, same_placement},
    events::EventSink,
    metrics::MicMetrics,
    source::ClusterSource,
    synchronizer::{CloudSynchronizer, ItemResult, Outcome},
};

pub struct Context<S, C, E> {
    pub source: S,
    pub cloud: C,
    pub events: E,
    /// Namespace the assigned identity records are written to.
    pub assignment_namespace: String,
    pub metrics: MicMetrics,
}

/// State carried between passes by the single sync loop.
#[derive(Debug, Default)]
pub struct PassState {
    /// Assignments attached in the cloud whose record write failed, by key.
    unrecorded: BTreeMap<String, AzureAssignedIdentity>,
}

impl PassState {
    pub fn unrecorded_keys(&self) -> impl Iterator<Item = &str> {
        self.unrecorded.keys().map(String::as_str)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub applied: usize,
    pub removed: usize,
    /// Keys whose attach, detach or record write failed.
    pub failed: Vec<String>,
    /// Creations postponed because the key's previous record is still there.
    pub deferred: Vec<String>,
}

impl PassSummary {
    /// False when any item failed or was deferred; the next pass retries it.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.deferred.is_empty()
    }
}

/// Runs one reconciliation pass. Per-item failures are reported in the
/// summary; only failing to list the cluster state aborts the pass.
#[tracing::instrument(skip_all)]
pub async fn reconcile<S, C, E>(
    ctx: &Context<S, C, E>,
    state: &mut PassState,
) -> Result<PassSummary>
where
    S: ClusterSource,
    C: CloudProvider,
    E: EventSink,
{
    let _measure = ctx.metrics.count_and_measure();
    match run_pass(ctx, state).await {
        Ok(summary) => Ok(summary),
        Err(e) => {
            ctx.metrics.count_failure(&e);
            Err(e)
        }
    }
}

async fn run_pass<S, C, E>(
    ctx: &Context<S, C, E>,
    state: &mut PassState,
) -> Result<PassSummary>
where
    S: ClusterSource,
    C: CloudProvider,
    E: EventSink,
{
    let snapshot = take_snapshot(&ctx.source).await?;
    let store = AssignmentStore::new(&ctx.source);
    let current = store.list().await?;

    let desired = build_desired_state(&snapshot, &ctx.assignment_namespace);
    let diff = diff_assignments(&desired.assignments, &current);

    // A record that exists now no longer needs remembering.
    state.unrecorded.retain(|key, _| !current.contains_key(key));
    let orphans: Vec<AzureAssignedIdentity> = state
        .unrecorded
        .iter()
        .filter(|(key, record)| {
            desired
                .assignments
                .get(*key)
                .is_none_or(|wanted| !same_placement(wanted, record))
        })
        .map(|(_, record)| record.clone())
        .collect();

    if diff.is_empty() && orphans.is_empty() {
        ctx.metrics.assigned_identities.set(current.len() as i64);
        return Ok(PassSummary::default());
    }
    info!(
        "reconciling {} creations and {} deletions",
        diff.to_create.len(),
        diff.to_delete.len() + orphans.len()
    );

    let placement = |record: &AzureAssignedIdentity| {
        snapshot
            .node(&record.spec.node_name)
            .map(|node| ctx.cloud.placement(node))
            .unwrap_or_else(|| record.spec.node_name.clone())
    };
    // Identities each placement keeps once the pass is done.
    let in_use: BTreeSet<(String, &str)> = desired
        .assignments
        .values()
        .map(|record| {
            (
                placement(record),
                record.spec.identity_ref.resource_id.as_str(),
            )
        })
        .collect();

    let sync = &CloudSynchronizer::new(&ctx.cloud, &ctx.source, &ctx.events, &snapshot);
    let mut summary = PassSummary::default();
    let mut recorded = current.len();

    let removals: Vec<_> = diff
        .to_delete
        .iter()
        .map(|record| (record, true))
        .chain(orphans.iter().map(|record| (record, false)))
        .map(|(record, was_recorded)| {
            let target = placement(record);
            let resource_id = record.spec.identity_ref.resource_id.as_str();
            let detach = !in_use.contains(&(target.clone(), resource_id));
            (target, (record, was_recorded, detach))
        })
        .collect();
    let removed = run_by_placement(removals, move |(record, was_recorded, detach)| {
        sync.remove(record, was_recorded, detach)
    })
    .await;

    let mut undeleted = BTreeSet::new();
    for ((_, was_recorded, _), item) in removed {
        count(ctx, &item);
        match item.outcome {
            Outcome::Done => {
                summary.removed += 1;
                if was_recorded {
                    recorded -= 1;
                } else {
                    state.unrecorded.remove(&item.key);
                }
            }
            Outcome::CloudFailed(_) | Outcome::StoreFailed(_) => {
                undeleted.insert(item.key.clone());
                summary.failed.push(item.key);
            }
        }
    }

    let mut pending = Vec::new();
    for record in &diff.to_create {
        let key = record.key();
        if undeleted.contains(&key) {
            summary.deferred.push(key);
            continue;
        }
        let already_attached = state
            .unrecorded
            .get(&key)
            .is_some_and(|attached| same_placement(attached, record));
        pending.push((placement(record), (record, already_attached)));
    }
    let applied = run_by_placement(pending, move |(record, attached)| {
        sync.apply(record, attached)
    })
    .await;

    for ((record, _), item) in applied {
        count(ctx, &item);
        match item.outcome {
            Outcome::Done => {
                summary.applied += 1;
                recorded += 1;
                state.unrecorded.remove(&item.key);
            }
            Outcome::StoreFailed(_) => {
                state.unrecorded.insert(item.key.clone(), record.clone());
                summary.failed.push(item.key);
            }
            Outcome::CloudFailed(_) => summary.failed.push(item.key),
        }
    }

    ctx.metrics.assigned_identities.set(recorded as i64);
    if !summary.is_complete() {
        warn!(
            failed = summary.failed.len(),
            deferred = summary.deferred.len(),
            "pass finished with outstanding work"
        );
    }
    Ok(summary)
}

async fn take_snapshot<S: ClusterSource>(source: &S) -> Result<Snapshot> {
    let (pods, nodes, bindings, identities) = tokio::try_join!(
        source.list_pods(),
        source.list_nodes(),
        source.list_bindings(),
        source.list_identities(),
    )?;
    Ok(Snapshot::new(pods, nodes, bindings, identities))
}

/// Runs work items grouped by placement. Groups run concurrently; items in
/// one group run one after another since each cloud update reads and then
/// rewrites the identities of the whole VM or scale set.
async fn run_by_placement<T, F, Fut>(items: Vec<(String, T)>, run: F) -> Vec<(T, ItemResult)>
where
    T: Copy,
    F: Fn(T) -> Fut,
    Fut: Future<Output = ItemResult>,
{
    let mut groups: BTreeMap<String, Vec<T>> = BTreeMap::new();
    for (placement, item) in items {
        groups.entry(placement).or_default().push(item);
    }
    let run = &run;
    join_all(groups.into_values().map(|group| async move {
        let mut results = Vec::with_capacity(group.len());
        for item in group {
            results.push((item, run(item).await));
        }
        results
    }))
    .await
    .into_iter()
    .flatten()
    .collect()
}

fn count<S, C, E>(ctx: &Context<S, C, E>, item: &ItemResult) {
    ctx.metrics
        .count_cloud_operation(item.operation.as_str(), item.outcome.label());
}
