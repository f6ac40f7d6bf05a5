use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use pod_identity_mic::{
    MicConfig,
    cloud::arm::{ArmConfig, DEFAULT_API_VERSION, DEFAULT_ENDPOINT},
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Run the managed identity controller
    Controller(ControllerArgs),
    /// Print the CRDs as YAML
    Crdgen,
}

#[derive(Parser, Debug, Clone)]
pub struct ControllerArgs {
    /// Metrics and readiness listener
    #[arg(long, env = "MIC_METRICS_ADDRESS", default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,

    /// Seconds between passes run without any cluster change, 0 disables them
    #[arg(long, env = "MIC_SYNC_INTERVAL_SECS", default_value_t = 3600)]
    pub sync_interval_secs: u64,

    /// Namespace assigned identities are written to
    #[arg(long, env = "MIC_ASSIGNED_IDENTITY_NAMESPACE", default_value = "default")]
    pub assigned_identity_namespace: String,

    /// Pending pass requests kept while a pass runs
    #[arg(long, default_value_t = 64)]
    pub trigger_queue_capacity: usize,

    /// Kubernetes events buffered before new ones are dropped
    #[arg(long, default_value_t = 256)]
    pub event_buffer_capacity: usize,

    /// Seconds to wait for the initial listing of watched resources
    #[arg(long, default_value_t = 30)]
    pub store_timeout_secs: u64,

    /// Azure Resource Manager endpoint
    #[arg(long, env = "ARM_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub arm_endpoint: String,

    /// Compute API version used for virtual machines and scale sets
    #[arg(long, env = "ARM_API_VERSION", default_value = DEFAULT_API_VERSION)]
    pub arm_api_version: String,

    /// File holding the bearer token for Azure Resource Manager
    #[arg(long, env = "ARM_TOKEN_FILE", default_value = "/var/run/secrets/azure/token")]
    pub arm_token_file: PathBuf,
}

impl ControllerArgs {
    pub fn mic_config(&self) -> MicConfig {
        MicConfig {
            assignment_namespace: self.assigned_identity_namespace.clone(),
            resync_interval: (self.sync_interval_secs > 0)
                .then(|| Duration::from_secs(self.sync_interval_secs)),
            trigger_queue_capacity: self.trigger_queue_capacity,
            event_buffer_capacity: self.event_buffer_capacity,
            store_timeout: Duration::from_secs(self.store_timeout_secs),
        }
    }

    pub fn arm_config(&self) -> ArmConfig {
        ArmConfig {
            endpoint: self.arm_endpoint.clone(),
            api_version: self.arm_api_version.clone(),
            ..ArmConfig::new(self.arm_token_file.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller_args(args: &[&str]) -> ControllerArgs {
        let argv = ["mic", "controller"].into_iter().chain(args.iter().copied());
        let cli = Cli::try_parse_from(argv).expect("arguments parse");
        match cli.command {
            Commands::Controller(args) => args,
            Commands::Crdgen => panic!("expected controller command"),
        }
    }

    #[test]
    fn controller_defaults() {
        let args = controller_args(&[]);
        let config = args.mic_config();
        assert_eq!(config.assignment_namespace, "default");
        assert_eq!(config.resync_interval, Some(Duration::from_secs(3600)));
        assert_eq!(config.store_timeout, Duration::from_secs(30));
        assert_eq!(args.arm_config().endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn zero_sync_interval_disables_resync() {
        let args = controller_args(&[
            "--sync-interval-secs",
            "0",
            "--assigned-identity-namespace",
            "aad-pod-identity",
        ]);
        let config = args.mic_config();
        assert_eq!(config.resync_interval, None);
        assert_eq!(config.assignment_namespace, "aad-pod-identity");
    }

    #[test]
    fn parses_crdgen() {
        let cli = Cli::try_parse_from(["mic", "crdgen"]).expect("arguments parse");
        assert!(matches!(cli.command, Commands::Crdgen));
    }
}
