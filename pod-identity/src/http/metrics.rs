use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::State as AxumState,
    response::{IntoResponse, Response},
    routing::get,
};
use http::{StatusCode, header};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{Result, http::shutdown};

#[derive(Clone)]
pub(crate) struct State {
    registry: Arc<Registry>,
    ready: CancellationToken,
}

impl State {
    pub fn new(registry: Arc<Registry>, ready: CancellationToken) -> Self {
        Self { registry, ready }
    }

    pub fn ready(&self) -> Readiness {
        if self.ready.is_cancelled() {
            Readiness::Ready
        } else {
            Readiness::NotReady
        }
    }

    pub fn metrics(&self) -> String {
        let mut buffer = String::new();
        match prometheus_client::encoding::text::encode(&mut buffer, &self.registry) {
            Ok(_) => buffer,
            Err(e) => {
                error!("failed to encode metrics: {e}");
                "".into()
            }
        }
    }
}

pub(crate) async fn serve(
    addr: SocketAddr,
    state: Arc<State>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("metrics listening on {}", addr);

    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(cancel))
        .await?;
    Ok(())
}

pub(crate) fn router(state: Arc<State>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/readyz", get(readyz))
        .with_state(state)
}

async fn metrics(AxumState(handler): AxumState<Arc<State>>) -> String {
    handler.metrics()
}

async fn readyz(AxumState(handler): AxumState<Arc<State>>) -> Readiness {
    handler.ready()
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Readiness {
    Ready,
    NotReady,
}

impl IntoResponse for Readiness {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Readiness::Ready => (StatusCode::OK, "Ok"),
            Readiness::NotReady => (StatusCode::INTERNAL_SERVER_ERROR, "NotReady"),
        };
        (status, [(header::CONTENT_TYPE, "text/plain")], body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use pod_identity_mic::metrics::MicMetrics;

    use super::*;

    #[test]
    fn ready_once_token_cancelled() {
        let ready = CancellationToken::new();
        let state = State::new(Arc::new(Registry::default()), ready.clone());
        assert_eq!(state.ready(), Readiness::NotReady);
        assert_eq!(
            state.ready().into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        ready.cancel();

        assert_eq!(state.ready(), Readiness::Ready);
        assert_eq!(state.ready().into_response().status(), StatusCode::OK);
    }

    #[test]
    fn metrics_are_encoded_with_prefix() {
        let mut registry = Registry::with_prefix("pod_identity");
        let metrics = MicMetrics::register(&mut registry);
        metrics.passes.inc();
        let state = State::new(Arc::new(registry), CancellationToken::new());

        let text = state.metrics();

        assert!(text.contains("pod_identity_passes_total 1"));
        assert!(text.ends_with("# EOF\n"));
    }
}
