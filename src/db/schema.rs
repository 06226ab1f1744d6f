use anyhow::Result;

use crate::db::Db;

/// Create the session table and its indexes. Safe to run on every start.
pub async fn ensure_schema(db: &Db) -> Result<()> {
    let schema_queries = [
        // Opaque handle -> signed assertion
        "DEFINE TABLE IF NOT EXISTS opaque_store SCHEMAFULL;
         DEFINE FIELD IF NOT EXISTS user_id ON TABLE opaque_store TYPE int;
         DEFINE FIELD IF NOT EXISTS assertion ON TABLE opaque_store TYPE string;
         DEFINE FIELD IF NOT EXISTS opaque ON TABLE opaque_store TYPE string;
         DEFINE FIELD IF NOT EXISTS created_at ON TABLE opaque_store TYPE string;",
        "DEFINE INDEX IF NOT EXISTS opaque_store_opaque ON TABLE opaque_store COLUMNS opaque UNIQUE;
         DEFINE INDEX IF NOT EXISTS opaque_store_user ON TABLE opaque_store COLUMNS user_id;",
    ];

    for query in schema_queries {
        db.query(query).await?.check()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DatabaseConfig, create_connection};

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent() {
        let db = create_connection(DatabaseConfig {
            url: "memory".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

        ensure_schema(&db).await.unwrap();
        ensure_schema(&db).await.unwrap();
    }
}
