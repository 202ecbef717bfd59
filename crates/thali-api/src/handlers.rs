//! /NotificationBeacons handler.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::ApiState;

/// Serve the currently published beacon stream.
///
/// Admission has already confirmed the beacon role; this handler only
/// hands out bytes. An empty cell means the sender is not running.
pub async fn handle_notification_beacons(State(state): State<ApiState>) -> Response {
    let stream = state.beacon_stream.load();
    if stream.is_empty() {
        return StatusCode::NO_CONTENT.into_response();
    }
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes::Bytes::copy_from_slice(&stream),
    )
        .into_response()
}
