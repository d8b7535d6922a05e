use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionType {
    Pipe,
    Filter,
    Action,
}

impl FunctionType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pipe" => Some(Self::Pipe),
            "filter" => Some(Self::Filter),
            "action" => Some(Self::Action),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pipe => "pipe",
            Self::Filter => "filter",
            Self::Action => "action",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub function_type: FunctionType,
    /// Name of the compiled-in pipe module this record instantiates.
    pub module: String,
    pub meta: Value,
    pub is_active: bool,
    pub is_global: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateFunctionInput {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default = "default_function_type")]
    pub function_type: FunctionType,
    pub module: String,
    #[serde(default)]
    pub meta: Value,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub is_global: bool,
}

fn default_function_type() -> FunctionType {
    FunctionType::Pipe
}

fn default_active() -> bool {
    true
}

#[derive(Clone)]
pub struct FunctionStore {
    pool: Pool<Sqlite>,
}

impl FunctionStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, StoreError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS functions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                module TEXT NOT NULL,
                meta TEXT NOT NULL DEFAULT '{}',
                valves TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_global INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )"#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_functions_type_active ON functions(type, is_active)",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS function_user_valves (
                function_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                valves TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (function_id, user_id)
            )"#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Inserts a new function record. Returns `None` when the id is taken.
    pub async fn insert_function(
        &self,
        user_id: &str,
        input: CreateFunctionInput,
    ) -> Result<Option<FunctionRecord>, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let meta = if input.meta.is_null() {
            Value::Object(Map::new())
        } else {
            input.meta
        };
        let result = sqlx::query(
            r#"INSERT INTO functions
                (id, user_id, name, type, module, meta, valves, is_active, is_global, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?, ?, ?)
               ON CONFLICT(id) DO NOTHING"#,
        )
        .bind(&input.id)
        .bind(user_id)
        .bind(&input.name)
        .bind(input.function_type.as_str())
        .bind(&input.module)
        .bind(serde_json::to_string(&meta)?)
        .bind(input.is_active)
        .bind(input.is_global)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_function_by_id(&input.id).await
    }

    pub async fn get_function_by_id(&self, id: &str) -> Result<Option<FunctionRecord>, StoreError> {
        let row = sqlx::query(
            r#"SELECT id, user_id, name, type, module, meta, is_active, is_global, created_at, updated_at
               FROM functions WHERE id = ?"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| row_to_function(&row)).transpose()
    }

    /// Records of one type, in insertion order.
    pub async fn get_functions_by_type(
        &self,
        function_type: FunctionType,
        active_only: bool,
    ) -> Result<Vec<FunctionRecord>, StoreError> {
        let sql = if active_only {
            r#"SELECT id, user_id, name, type, module, meta, is_active, is_global, created_at, updated_at
               FROM functions WHERE type = ? AND is_active = 1 ORDER BY rowid ASC"#
        } else {
            r#"SELECT id, user_id, name, type, module, meta, is_active, is_global, created_at, updated_at
               FROM functions WHERE type = ? ORDER BY rowid ASC"#
        };
        let rows = sqlx::query(sql)
            .bind(function_type.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_function).collect()
    }

    pub async fn set_active(
        &self,
        id: &str,
        is_active: bool,
    ) -> Result<Option<FunctionRecord>, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query("UPDATE functions SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(is_active)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_function_by_id(id).await
    }

    pub async fn get_function_valves_by_id(
        &self,
        id: &str,
    ) -> Result<Option<Map<String, Value>>, StoreError> {
        let row = sqlx::query("SELECT valves FROM functions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let raw: Option<String> = row.try_get("valves")?;
        parse_object(raw)
    }

    /// Returns false when the function does not exist.
    pub async fn update_function_valves(
        &self,
        id: &str,
        valves: &Map<String, Value>,
    ) -> Result<bool, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query("UPDATE functions SET valves = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(valves)?)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_user_valves_by_id_and_user_id(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<Option<Map<String, Value>>, StoreError> {
        let row = sqlx::query(
            "SELECT valves FROM function_user_valves WHERE function_id = ? AND user_id = ?",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let raw: Option<String> = row.try_get("valves")?;
        parse_object(raw)
    }

    pub async fn update_user_valves(
        &self,
        id: &str,
        user_id: &str,
        valves: &Map<String, Value>,
    ) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"INSERT INTO function_user_valves (function_id, user_id, valves, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(function_id, user_id) DO UPDATE SET valves = excluded.valves, updated_at = excluded.updated_at"#,
        )
        .bind(id)
        .bind(user_id)
        .bind(serde_json::to_string(valves)?)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn parse_object(raw: Option<String>) -> Result<Option<Map<String, Value>>, StoreError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match serde_json::from_str::<Value>(&raw)? {
        Value::Object(map) => Ok(Some(map)),
        _ => Ok(None),
    }
}

fn row_to_function(row: &SqliteRow) -> Result<FunctionRecord, StoreError> {
    let type_str: String = row.try_get("type")?;
    let meta_str: String = row.try_get("meta")?;
    Ok(FunctionRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        function_type: FunctionType::from_str(&type_str).unwrap_or(FunctionType::Pipe),
        module: row.try_get("module")?,
        meta: serde_json::from_str(&meta_str)?,
        is_active: row.try_get("is_active")?,
        is_global: row.try_get("is_global")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
