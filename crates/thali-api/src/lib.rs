//! thali-api — the HTTP surface peers replicate through.
//!
//! Assembles the router: the beacon endpoint, the externally-supplied
//! document-store router nested under the configured db path, and the
//! two-stage admission middleware (PSK role assignment, then the ACL
//! gate) applied to every request.
//!
//! TLS-PSK termination is out of scope; the acceptor in front of this
//! router injects the authenticated identity as a [`PskIdentity`]
//! request extension.

pub mod admission;
pub mod handlers;

use axum::routing::get;
use axum::{middleware, Router};

use thali_core::psk::PskStore;
use thali_services::BeaconStreamCell;

pub use admission::{PskIdentity, Role};

/// Shared state for the admission gate and the beacon handler.
#[derive(Clone)]
pub struct ApiState {
    pub psk: PskStore,
    pub beacon_stream: BeaconStreamCell,
    pub base_db_path: String,
    pub local_seq_point_prefix: String,
}

/// Build the full router: beacon endpoint + nested document-store
/// router, everything behind the admission gate.
pub fn build_router(state: ApiState, db_router: Router) -> Router {
    let beacon_routes = Router::new()
        .route(
            "/NotificationBeacons",
            get(handlers::handle_notification_beacons),
        )
        .with_state(state.clone());

    Router::new()
        .merge(beacon_routes)
        .nest(&state.base_db_path.clone(), db_router)
        .layer(middleware::from_fn_with_state(state, admission::admission))
}

/// Serve the router on an already-bound listener.
pub async fn serve(
    state: ApiState,
    db_router: Router,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    let app = build_router(state, db_router);
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "replication router listening");
    axum::serve(listener, app).await?;
    Ok(())
}
