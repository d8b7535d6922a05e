use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};

/// A stored model definition layered over a pipe: an alias with default
/// parameters and an optional system prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelOverride {
    pub id: String,
    pub base_model_id: Option<String>,
    pub name: String,
    pub params: Map<String, Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpsertModelInput {
    pub id: String,
    #[serde(default)]
    pub base_model_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Clone)]
pub struct ModelStore {
    pool: Pool<Sqlite>,
}

impl ModelStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, StoreError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS models (
                id TEXT PRIMARY KEY,
                base_model_id TEXT,
                name TEXT NOT NULL,
                params TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )"#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    pub async fn upsert_model(&self, input: UpsertModelInput) -> Result<ModelOverride, StoreError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"INSERT INTO models (id, base_model_id, name, params, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 base_model_id = excluded.base_model_id,
                 name = excluded.name,
                 params = excluded.params,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&input.id)
        .bind(&input.base_model_id)
        .bind(&input.name)
        .bind(serde_json::to_string(&input.params)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_model_by_id(&input.id)
            .await?
            .ok_or(StoreError::Database(sqlx::Error::RowNotFound))
    }

    pub async fn get_model_by_id(&self, id: &str) -> Result<Option<ModelOverride>, StoreError> {
        let row = sqlx::query(
            "SELECT id, base_model_id, name, params, created_at, updated_at FROM models WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| row_to_model(&row)).transpose()
    }
}

fn row_to_model(row: &SqliteRow) -> Result<ModelOverride, StoreError> {
    let params_str: String = row.try_get("params")?;
    let params = match serde_json::from_str::<Value>(&params_str)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Ok(ModelOverride {
        id: row.try_get("id")?,
        base_model_id: row.try_get("base_model_id")?,
        name: row.try_get("name")?,
        params,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
