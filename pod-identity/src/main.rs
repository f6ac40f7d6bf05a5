use std::sync::Arc;

use clap::Parser;
use pod_identity::{
    Result, controller,
    config::{Cli, Commands},
    http,
};
use pod_identity_mic::metrics::MicMetrics;
use prometheus_client::registry::Registry;
use tokio::task::JoinError;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Controller(controller_args) => {
            setup_subscriber();
            let cancel = tokio_util::sync::CancellationToken::new();
            let ready = tokio_util::sync::CancellationToken::new();

            let mut registry = Registry::with_prefix("pod_identity");
            let metrics = MicMetrics::register(&mut registry);

            let mut metrics_handle = tokio::spawn(http::serve_metrics(
                controller_args.metrics_address,
                Arc::new(registry),
                ready.clone(),
                cancel.child_token(),
            ));
            let mut controller_handle = tokio::spawn(controller::start(
                controller_args,
                metrics,
                ready,
                cancel.child_token(),
            ));
            let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });
            // watch for shutdown and errors
            tokio::select! {
                h = &mut metrics_handle => exit("metrics", h),
                h = &mut controller_handle => exit("controller", h),
                _ = &mut shutdown_handle => {
                        cancel.cancel();
                        let (metrics, controller) = tokio::join!(metrics_handle, controller_handle);
                        if let Err(m) = metrics {
                            error!("metrics exited with error: {}", m.to_string());
                        }
                        if let Err(c) = controller {
                            error!("controller exited with error: {}", c.to_string());
                        }
                    },
            };
            info!("Exiting...");
        }
        Commands::Crdgen => pod_identity_crds::crd_gen_all()?,
    }
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pod_identity=info,pod_identity_mic=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl_c: {e}");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {
          info!("captured ctrl_c signal");
        },
        _ = terminate => {
          info!("captured terminate signal");
        },
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited")
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}")
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}")
        }
    }
}
