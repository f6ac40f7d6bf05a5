use kube::Client;
use pod_identity_mic::{cloud::arm::ArmCloudProvider, metrics::MicMetrics, start_mic};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{Result, config::ControllerArgs};

/// Runs the managed identity controller against the cluster from the
/// ambient kubeconfig or in-cluster service account.
pub async fn start(
    args: ControllerArgs,
    metrics: MicMetrics,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    let client = Client::try_default().await?;
    let cloud = ArmCloudProvider::new(args.arm_config())?;
    info!(
        "starting mic, assigned identities in namespace {}",
        args.assigned_identity_namespace
    );
    start_mic(client, args.mic_config(), cloud, metrics, ready, cancel).await?;
    Ok(())
}
