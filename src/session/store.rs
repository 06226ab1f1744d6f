//! Durable mapping from opaque handles to signed assertions.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Deserialize;
use surrealdb::RecordId;
use tracing::{debug, info};

use crate::db::Db;
use crate::error::{GatewayError, GatewayResult};
use crate::types::{OpaqueHandle, SignedAssertion};

/// Entropy behind every opaque handle.
pub const HANDLE_BYTES: usize = 32;

/// One sign-in. Created once, deleted on logout, never updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: RecordId,
    pub user_id: i64,
    pub assertion: SignedAssertion,
    pub opaque: OpaqueHandle,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct SessionRow {
    id: RecordId,
    user_id: i64,
    assertion: String,
    opaque: String,
    created_at: String,
}

impl TryFrom<SessionRow> for SessionRecord {
    type Error = GatewayError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| GatewayError::Database(format!("bad created_at: {}", e)))?
            .with_timezone(&Utc);

        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            assertion: SignedAssertion::new(row.assertion),
            opaque: OpaqueHandle::new(row.opaque),
            created_at,
        })
    }
}

/// Fresh handle from the OS CSPRNG: 256 bits, 43 URL-safe characters.
pub fn generate_handle() -> OpaqueHandle {
    let mut bytes = [0u8; HANDLE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    OpaqueHandle::new(URL_SAFE_NO_PAD.encode(bytes))
}

/// Session persistence. Every method is a single statement.
#[derive(Clone)]
pub struct SessionStore {
    db: Db,
}

impl SessionStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Persist a new session for `user_id` under a freshly generated handle.
    pub async fn save_token(
        &self,
        user_id: i64,
        assertion: &SignedAssertion,
    ) -> GatewayResult<SessionRecord> {
        let opaque = generate_handle();
        let query = r#"
            CREATE opaque_store CONTENT {
                user_id: $user_id,
                assertion: $assertion,
                opaque: $opaque,
                created_at: $created_at
            }
        "#;

        let mut res = self
            .db
            .query(query)
            .bind(("user_id", user_id))
            .bind(("assertion", assertion.as_str().to_string()))
            .bind(("opaque", opaque.as_str().to_string()))
            .bind(("created_at", Utc::now().to_rfc3339()))
            .await?
            .check()?;

        let rows: Vec<SessionRow> = res.take(0)?;
        let record: SessionRecord = rows
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Database("CREATE returned no row".to_string()))?
            .try_into()?;

        info!(
            user_id,
            handle = %record.opaque.fingerprint(),
            "Saved session"
        );
        Ok(record)
    }

    /// Look up the live session behind `opaque`.
    pub async fn find_token(&self, opaque: &OpaqueHandle) -> GatewayResult<SessionRecord> {
        let mut res = self
            .db
            .query("SELECT * FROM opaque_store WHERE opaque = $opaque LIMIT 1")
            .bind(("opaque", opaque.as_str().to_string()))
            .await?;

        let rows: Vec<SessionRow> = res.take(0)?;
        match rows.into_iter().next() {
            Some(row) => row.try_into(),
            None => {
                debug!(handle = %opaque.fingerprint(), "Unknown opaque handle");
                Err(GatewayError::NotFound("session".to_string()))
            }
        }
    }

    /// Delete the session behind `opaque`. Deleting an unknown handle is an
    /// error, not a no-op.
    pub async fn remove_token(&self, opaque: &OpaqueHandle) -> GatewayResult<()> {
        let mut res = self
            .db
            .query("DELETE opaque_store WHERE opaque = $opaque RETURN BEFORE")
            .bind(("opaque", opaque.as_str().to_string()))
            .await?;

        let removed: Vec<SessionRow> = res.take(0)?;
        if removed.is_empty() {
            return Err(GatewayError::NotFound("session".to_string()));
        }

        info!(handle = %opaque.fingerprint(), "Removed session");
        Ok(())
    }

    /// Number of live sessions held by `user_id`.
    pub async fn count_for_user(&self, user_id: i64) -> GatewayResult<usize> {
        #[derive(Deserialize)]
        struct Count {
            count: usize,
        }

        let mut res = self
            .db
            .query("SELECT count() FROM opaque_store WHERE user_id = $user_id GROUP ALL")
            .bind(("user_id", user_id))
            .await?;

        let counts: Vec<Count> = res.take(0)?;
        Ok(counts.first().map(|c| c.count).unwrap_or(0))
    }
}
