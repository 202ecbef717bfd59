//! Request admission — PSK role assignment and the ACL gate.
//!
//! Stage one maps the TLS-PSK identity the acceptor authenticated to a
//! role: the fixed beacon identity gets `Beacon`, any identity in the
//! current PSK tables gets `Replication`, everything else is `Public`.
//! Stage two checks the (role, method, path) triple against the ACL; for
//! sequence-checkpoint documents the id must additionally match the hash
//! of the public key the identity was derived for.
//!
//! The role is stored as a request extension; later stages read it but
//! never change it.

use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use thali_core::crypto::{key_hash, key_hash_id};
use thali_core::psk::{PskTables, BEACON_PSK_SECRET};

use crate::ApiState;

/// The authenticated TLS-PSK identity, injected per connection by the
/// out-of-scope acceptor.
#[derive(Debug, Clone)]
pub struct PskIdentity(pub String);

/// Privilege tier derived from the PSK identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// May fetch the beacon stream, nothing else.
    Beacon,
    /// A recognized recipient identity; may drive replication.
    Replication,
    /// Unrecognized; denied by default.
    Public,
}

/// The two-stage admission middleware applied to every request.
pub async fn admission(State(state): State<ApiState>, mut req: Request, next: Next) -> Response {
    // No authenticated identity means the TLS handshake never happened
    let Some(identity) = req.extensions().get::<PskIdentity>().cloned() else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let tables = state.psk.snapshot();
    let role = assign_role(&identity.0, &tables);
    let checkpoint_id = tables
        .public_key(&identity.0)
        .map(|public| key_hash_id(&key_hash(public)));

    req.extensions_mut().insert(role);

    let allowed = acl_allows(
        role,
        req.method(),
        req.uri().path(),
        checkpoint_id.as_deref(),
        &state.base_db_path,
        &state.local_seq_point_prefix,
    );

    if allowed {
        next.run(req).await
    } else {
        tracing::debug!(
            identity = %identity.0,
            role = ?role,
            method = %req.method(),
            path = req.uri().path(),
            "request denied by admission gate"
        );
        StatusCode::FORBIDDEN.into_response()
    }
}

/// Map an identity to its role via the current PSK tables.
///
/// The beacon secret is 16 bytes of zero; every replication secret is a
/// 32-byte derived key, so the two can never collide.
pub fn assign_role(identity: &str, tables: &PskTables) -> Role {
    match tables.replication_secret(identity) {
        Some(secret) if secret == BEACON_PSK_SECRET => Role::Beacon,
        Some(_) => Role::Replication,
        None => Role::Public,
    }
}

/// The ACL table. `checkpoint_id` is the id this identity may touch
/// under the sequence-checkpoint prefix.
pub fn acl_allows(
    role: Role,
    method: &Method,
    path: &str,
    checkpoint_id: Option<&str>,
    base_db_path: &str,
    local_seq_point_prefix: &str,
) -> bool {
    match role {
        Role::Beacon => *method == Method::GET && path == "/NotificationBeacons",
        Role::Public => false,
        Role::Replication => {
            let Some(rel) = path.strip_prefix(base_db_path) else {
                return false;
            };
            // `/dbx` must not pass as `/db` + `x`
            if !rel.is_empty() && !rel.starts_with('/') {
                return false;
            }

            let segments: Vec<&str> = rel.split('/').filter(|s| !s.is_empty()).collect();
            match segments.as_slice() {
                [] => *method == Method::GET,
                ["_all_docs"] => {
                    matches!(*method, Method::GET | Method::HEAD | Method::POST)
                }
                ["_changes"] => matches!(*method, Method::GET | Method::POST),
                ["_bulk_get"] | ["_revs_diff"] => *method == Method::POST,
                ["_local", id] => {
                    if !matches!(*method, Method::GET | Method::PUT | Method::DELETE) {
                        return false;
                    }
                    match id.strip_prefix(local_seq_point_prefix) {
                        // A checkpoint document belongs to exactly one
                        // identity
                        Some(suffix) => checkpoint_id == Some(suffix),
                        None => true,
                    }
                }
                [id] if !id.starts_with('_') => *method == Method::GET,
                [id, "attachment"] if !id.starts_with('_') => *method == Method::GET,
                _ => false,
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use thali_core::psk::BEACON_PSK_IDENTITY;

    fn live_tables() -> PskTables {
        let mut tables = PskTables {
            expires_at: Some(Instant::now() + Duration::from_secs(60)),
            ..PskTables::default()
        };
        tables
            .id_to_secret
            .insert(BEACON_PSK_IDENTITY.to_string(), BEACON_PSK_SECRET.to_vec());
        tables
            .id_to_secret
            .insert("peer".to_string(), vec![9u8; 32]);
        tables
    }

    #[test]
    fn role_assignment_covers_all_tiers() {
        let tables = live_tables();
        assert_eq!(assign_role(BEACON_PSK_IDENTITY, &tables), Role::Beacon);
        assert_eq!(assign_role("peer", &tables), Role::Replication);
        assert_eq!(assign_role("stranger", &tables), Role::Public);
    }

    #[test]
    fn expired_tables_demote_everyone_to_public() {
        let mut tables = live_tables();
        tables.expires_at = Some(Instant::now() - Duration::from_secs(1));
        assert_eq!(assign_role(BEACON_PSK_IDENTITY, &tables), Role::Public);
        assert_eq!(assign_role("peer", &tables), Role::Public);
    }

    #[test]
    fn beacon_role_is_single_purpose() {
        assert!(acl_allows(
            Role::Beacon,
            &Method::GET,
            "/NotificationBeacons",
            None,
            "/db",
            "thali_"
        ));
        assert!(!acl_allows(Role::Beacon, &Method::GET, "/db", None, "/db", "thali_"));
        assert!(!acl_allows(
            Role::Beacon,
            &Method::POST,
            "/NotificationBeacons",
            None,
            "/db",
            "thali_"
        ));
    }

    #[test]
    fn replication_prefix_match_is_exact() {
        let ok = |method: &Method, path: &str| {
            acl_allows(Role::Replication, method, path, Some("abc"), "/db", "thali_")
        };
        assert!(ok(&Method::GET, "/db"));
        assert!(!ok(&Method::GET, "/dbx"));
        assert!(!ok(&Method::GET, "/database"));
    }

    #[test]
    fn checkpoint_id_must_match_identity() {
        let ok = |path: &str| {
            acl_allows(
                Role::Replication,
                &Method::PUT,
                path,
                Some("abc"),
                "/db",
                "thali_",
            )
        };
        assert!(ok("/db/_local/thali_abc"));
        assert!(!ok("/db/_local/thali_xyz"));
        // Non-checkpoint _local documents are unrestricted
        assert!(ok("/db/_local/replication-log"));
    }

    #[test]
    fn public_role_is_denied_by_default() {
        assert!(!acl_allows(Role::Public, &Method::GET, "/db", None, "/db", "thali_"));
        assert!(!acl_allows(
            Role::Public,
            &Method::GET,
            "/NotificationBeacons",
            None,
            "/db",
            "thali_"
        ));
    }
}
