use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::store::now_rfc3339;

/// A verified user identity, bound to a connection at handshake time
/// and never re-derived from client input afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub username: String,
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("authentication token required")]
    MissingCredential,
    #[error("invalid or expired token")]
    InvalidCredential,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Collaborator seam for credential verification. Called exactly once
/// per connection, before the connection is admitted to the registry.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Identity, VerifyError>;
}

/// Looks opaque tokens up in the `auth_tokens` table. Minting tokens
/// (login/registration) belongs to the surrounding account API.
pub struct DbTokenVerifier {
    db_pool: SqlitePool,
}

impl DbTokenVerifier {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl IdentityVerifier for DbTokenVerifier {
    async fn verify(&self, credential: &str) -> Result<Identity, VerifyError> {
        if credential.is_empty() {
            return Err(VerifyError::MissingCredential);
        }

        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT u.id, u.username FROM auth_tokens t \
             JOIN users u ON u.id = t.user_id \
             WHERE t.token = ? AND t.expires_at > ?",
        )
        .bind(credential)
        .bind(now_rfc3339())
        .fetch_optional(&self.db_pool)
        .await?;

        let (id, username) = row.ok_or(VerifyError::InvalidCredential)?;
        Ok(Identity { id, username })
    }
}
