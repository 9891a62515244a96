//! Binary entry point: wires the bundled reference `DocumentStore` and
//! `AuthResolver` implementations into a `SessionCoordinator` and serves
//! the `/ws/{documentId}` upgrade endpoint over axum.
//!
//! A production deployment swaps `FsDocumentStore`/`DevTokenResolver` for
//! the real relational store and JWT resolver, per spec.md \S1/\S6; the
//! core (`marginalia` lib) is agnostic to which implementations it gets.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use marginalia::auth::DevTokenResolver;
use marginalia::config::Config;
use marginalia::coordinator::SessionCoordinator;
use marginalia::store::FsDocumentStore;
use marginalia::telemetry;
use marginalia::ws;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init();

    let config = Config::load()?;
    let addr = config.addr;
    let store_dir = config.store_dir.clone();

    let store = Arc::new(FsDocumentStore::new(store_dir));
    let auth = Arc::new(DevTokenResolver::new());
    let coordinator = SessionCoordinator::new(config, store, auth);

    let app = Router::new()
        .route("/ws/:document_id", get(ws::upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "marginalia-server listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    server.await?;

    info!("shutting down; flushing dirty rooms");
    coordinator.shutdown().await;

    Ok(())
}

/// Waits for Ctrl-C (or, on unix, SIGTERM) so the process can run the
/// forced-flush shutdown pass from spec.md \S4.4/\S7 instead of dropping
/// connections mid-write.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
