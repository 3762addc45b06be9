//! Handshake token validation.
//!
//! The opaque `token` query parameter is hashed with SHA-256 and
//! base64-encoded before being looked up against [`crate::store::Store`]'s
//! session table — the core never sees or stores a raw token.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};
use crate::store::{SessionRow, Store, TenantId, UserId};

/// SHA-256/base64 hash of an opaque token, matching the session store's
/// lookup key.
pub fn hash_token(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// The identity resolved from a validated session.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: UserId,
    pub tenant_id: TenantId,
}

/// Validate a raw handshake token against the store, rejecting missing or
/// expired sessions.
pub async fn validate_token(store: &dyn Store, raw_token: &str) -> AppResult<Identity> {
    let hash = hash_token(raw_token);
    let session: SessionRow = store
        .get_session(&hash)
        .await?
        .ok_or_else(|| AppError::AuthFailed("unknown token".into()))?;

    if session.expires_at < Utc::now() {
        return Err(AppError::AuthFailed("token expired".into()));
    }

    Ok(Identity {
        user_id: session.user_id,
        tenant_id: session.tenant_id,
    })
}
