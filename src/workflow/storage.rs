//! SQLite persistence layer for workflow definitions.
//!
//! Definitions are immutable and versioned: every save writes a new
//! `(workflow_type, version)` row, so running instances stay pinned to the
//! exact version they started with while new starts pick up the latest.

use crate::error::EngineResult;
use crate::workflow::types::WorkflowDefinition;
use sqlx::{sqlite::SqlitePool, Row};

/// SQLite-backed definition storage.
#[derive(Debug, Clone)]
pub struct DefinitionStorage {
    pool: SqlitePool,
}

impl DefinitionStorage {
    /// Create new storage instance with database connection.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the definition storage schema.
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS).
    pub async fn init_schema(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_definitions (
                workflow_type TEXT NOT NULL,
                version INTEGER NOT NULL,
                name TEXT NOT NULL,
                definition JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (workflow_type, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_definitions_type
            ON workflow_definitions(workflow_type)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Validate and store a definition as a new version.
    ///
    /// Returns the version assigned to this save. Existing versions are
    /// never rewritten.
    pub async fn save_definition(&self, definition: &WorkflowDefinition) -> EngineResult<i64> {
        definition.validate()?;

        let row = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) AS latest FROM workflow_definitions WHERE workflow_type = ?",
        )
        .bind(&definition.workflow_type)
        .fetch_one(&self.pool)
        .await?;
        let next_version: i64 = row.get::<i64, _>("latest") + 1;

        let mut stored = definition.clone();
        stored.version = next_version;
        let definition_json = serde_json::to_string(&stored)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_definitions (workflow_type, version, name, definition)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&stored.workflow_type)
        .bind(next_version)
        .bind(&stored.name)
        .bind(&definition_json)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            "📜 Saved definition '{}' as v{next_version}",
            stored.workflow_type
        );

        Ok(next_version)
    }

    /// Retrieve the latest version of a definition.
    pub async fn get_latest(&self, workflow_type: &str) -> EngineResult<Option<WorkflowDefinition>> {
        let row = sqlx::query(
            r#"
            SELECT definition FROM workflow_definitions
            WHERE workflow_type = ?
            ORDER BY version DESC LIMIT 1
            "#,
        )
        .bind(workflow_type)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition_json)?))
            }
            None => Ok(None),
        }
    }

    /// Retrieve an exact definition version (instances are pinned to one).
    pub async fn get_version(
        &self,
        workflow_type: &str,
        version: i64,
    ) -> EngineResult<Option<WorkflowDefinition>> {
        let row = sqlx::query(
            "SELECT definition FROM workflow_definitions WHERE workflow_type = ? AND version = ?",
        )
        .bind(workflow_type)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition_json)?))
            }
            None => Ok(None),
        }
    }

    /// List the latest version of every definition.
    pub async fn list_latest(&self) -> EngineResult<Vec<DefinitionMetadata>> {
        let rows = sqlx::query(
            r#"
            SELECT workflow_type, name, MAX(version) AS version, created_at
            FROM workflow_definitions
            GROUP BY workflow_type
            ORDER BY workflow_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut definitions = Vec::new();
        for row in rows {
            definitions.push(DefinitionMetadata {
                workflow_type: row.get("workflow_type"),
                name: row.get("name"),
                version: row.get("version"),
                created_at: row.get("created_at"),
            });
        }

        Ok(definitions)
    }

    /// Load the latest version of every definition for registry init.
    pub async fn load_all_latest(&self) -> EngineResult<Vec<WorkflowDefinition>> {
        let rows = sqlx::query(
            r#"
            SELECT definition FROM workflow_definitions d
            WHERE version = (
                SELECT MAX(version) FROM workflow_definitions
                WHERE workflow_type = d.workflow_type
            )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut definitions = Vec::new();
        for row in rows {
            let definition_json: String = row.get("definition");
            definitions.push(serde_json::from_str(&definition_json)?);
        }

        Ok(definitions)
    }

    /// Delete every version of a definition. Returns true if any existed.
    ///
    /// Running instances keep their pinned copy only as long as it is
    /// stored; deleting a definition with live instances will fail them at
    /// recovery with DefinitionMissing.
    pub async fn delete_definition(&self, workflow_type: &str) -> EngineResult<bool> {
        let result = sqlx::query("DELETE FROM workflow_definitions WHERE workflow_type = ?")
            .bind(workflow_type)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Basic definition metadata for listing operations.
#[derive(Debug, serde::Serialize)]
pub struct DefinitionMetadata {
    pub workflow_type: String,
    pub name: String,
    pub version: i64,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{RetryPolicy, StepKind, StepSpec, SCHEMA_VERSION};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn storage() -> DefinitionStorage {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let storage = DefinitionStorage::new(pool);
        storage.init_schema().await.unwrap();
        storage
    }

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition {
            workflow_type: "warmup".into(),
            name: "Warmup".into(),
            version: 0,
            schema_version: SCHEMA_VERSION,
            steps: vec![StepSpec {
                id: "a".into(),
                kind: StepKind::Wait,
                delay_ms: 0,
                critical: false,
                parallel: false,
                timeout_ms: None,
                params: serde_json::Value::Null,
            }],
            retry: RetryPolicy::default(),
        }
    }

    #[tokio::test]
    async fn save_assigns_incrementing_versions() {
        let storage = storage().await;
        let def = definition();

        assert_eq!(storage.save_definition(&def).await.unwrap(), 1);
        assert_eq!(storage.save_definition(&def).await.unwrap(), 2);

        let latest = storage.get_latest("warmup").await.unwrap().unwrap();
        assert_eq!(latest.version, 2);

        let pinned = storage.get_version("warmup", 1).await.unwrap().unwrap();
        assert_eq!(pinned.version, 1);
    }

    #[tokio::test]
    async fn save_rejects_invalid_definition() {
        let storage = storage().await;
        let mut def = definition();
        def.steps.clear();
        assert!(storage.save_definition(&def).await.is_err());
    }

    #[tokio::test]
    async fn delete_removes_all_versions() {
        let storage = storage().await;
        let def = definition();
        storage.save_definition(&def).await.unwrap();
        storage.save_definition(&def).await.unwrap();

        assert!(storage.delete_definition("warmup").await.unwrap());
        assert!(storage.get_latest("warmup").await.unwrap().is_none());
        assert!(!storage.delete_definition("warmup").await.unwrap());
    }
}
