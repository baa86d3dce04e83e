//! Optional debug HTTP server bound to `--pprof`, exposing a liveness check
//! and a profiling index. Grounded on `services/http_gateway`'s `axum`
//! router setup; the profiling endpoint is a placeholder index rather than
//! a wired-up `pprof` exporter, since Rust has no drop-in equivalent to
//! Go's `net/http/pprof` (spec §4.6 calls this address "debug-only").

use axum::{routing::get, Router};
use tracing::info;

pub async fn serve(addr: &str) -> std::io::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/debug/pprof", get(pprof_index));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr, "debug server listening");
    axum::serve(listener, app).await
}

async fn healthz() -> &'static str {
    "ok"
}

async fn pprof_index() -> &'static str {
    "profiling is not wired up in this build"
}
