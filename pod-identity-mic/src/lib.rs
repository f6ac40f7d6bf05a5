mod assignment;
pub mod cloud;
mod controller;
mod desired;
mod diff;
mod error;
pub mod events;
mod index;
pub mod kubernetes;
pub mod memory;
pub mod metrics;
mod runtime;
pub mod scope;
mod source;
mod synchronizer;

pub use controller::{Context, PassState, PassSummary, reconcile};
pub use desired::{DesiredState, Snapshot, build_desired_state};
pub use diff::{AssignmentDiff, diff_assignments};
pub use error::Error;
pub use index::{IdentityIndex, index_by_name};
pub use runtime::{
    LoopState, LoopStatus, MicConfig, SyncLoop, Trigger, TriggerSender, start_mic, trigger_channel,
};
pub use source::{ClusterSource, CrdSource, NodeSource, PodSource};
pub use synchronizer::{ItemResult, Operation, Outcome};

pub type Result<T, E = Error> = std::result::Result<T, E>;
