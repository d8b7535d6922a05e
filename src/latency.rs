use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};

/// Client-reported timings for one assistant message.
#[derive(Debug, Clone, Deserialize)]
pub struct LatencyMetricForm {
    pub chat_id: String,
    pub message_id: String,
    pub question_time: f64,
    pub response_start_time: f64,
    pub response_end_time: f64,
    #[serde(default)]
    pub total_tokens: Option<i64>,
    pub llm_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub chat_context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyMetric {
    pub id: String,
    pub chat_id: String,
    pub message_id: String,
    pub question_time: f64,
    pub response_start_time: f64,
    pub response_end_time: f64,
    pub total_tokens: Option<i64>,
    pub llm_id: String,
    pub created_at: i64,
    pub user_id: Option<String>,
    pub chat_context: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(LatencyMetric),
    /// A metric for the same message id already exists; the stored row is kept.
    AlreadyRecorded,
}

#[derive(Clone)]
pub struct LatencyStore {
    pool: Pool<Sqlite>,
}

const SELECT_COLUMNS: &str = "SELECT id, chat_id, message_id, question_time, response_start_time, \
     response_end_time, total_tokens, llm_id, created_at, user_id, chat_context FROM latency_metrics";

impl LatencyStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, StoreError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS latency_metrics (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                question_time REAL NOT NULL,
                response_start_time REAL NOT NULL,
                response_end_time REAL NOT NULL,
                total_tokens INTEGER,
                llm_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                user_id TEXT,
                chat_context TEXT
            )"#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_latency_metrics_chat ON latency_metrics(chat_id, created_at)",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_latency_metrics_llm ON latency_metrics(llm_id, created_at)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub async fn insert_metric(&self, form: LatencyMetricForm) -> Result<InsertOutcome, StoreError> {
        let metric = LatencyMetric {
            id: form.message_id.clone(),
            chat_id: form.chat_id,
            message_id: form.message_id,
            question_time: form.question_time,
            response_start_time: form.response_start_time,
            response_end_time: form.response_end_time,
            total_tokens: form.total_tokens,
            llm_id: form.llm_id,
            created_at: chrono::Utc::now().timestamp(),
            user_id: form.user_id,
            chat_context: form.chat_context,
        };

        let result = sqlx::query(
            r#"INSERT INTO latency_metrics
                (id, chat_id, message_id, question_time, response_start_time, response_end_time,
                 total_tokens, llm_id, created_at, user_id, chat_context)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO NOTHING"#,
        )
        .bind(&metric.id)
        .bind(&metric.chat_id)
        .bind(&metric.message_id)
        .bind(metric.question_time)
        .bind(metric.response_start_time)
        .bind(metric.response_end_time)
        .bind(metric.total_tokens)
        .bind(&metric.llm_id)
        .bind(metric.created_at)
        .bind(&metric.user_id)
        .bind(&metric.chat_context)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(InsertOutcome::AlreadyRecorded);
        }
        Ok(InsertOutcome::Inserted(metric))
    }

    pub async fn list_metrics(&self) -> Result<Vec<LatencyMetric>, StoreError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} ORDER BY created_at DESC, rowid DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_metric).collect()
    }

    pub async fn list_metrics_by_chat_id(
        &self,
        chat_id: &str,
    ) -> Result<Vec<LatencyMetric>, StoreError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE chat_id = ? ORDER BY created_at DESC, rowid DESC"
        ))
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_metric).collect()
    }

    pub async fn list_metrics_by_model_id(
        &self,
        llm_id: &str,
    ) -> Result<Vec<LatencyMetric>, StoreError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE llm_id = ? ORDER BY created_at DESC, rowid DESC"
        ))
        .bind(llm_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_metric).collect()
    }

    /// Returns whether any row existed.
    pub async fn delete_all_metrics(&self) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM latency_metrics")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_metric(row: &SqliteRow) -> Result<LatencyMetric, StoreError> {
    Ok(LatencyMetric {
        id: row.try_get("id")?,
        chat_id: row.try_get("chat_id")?,
        message_id: row.try_get("message_id")?,
        question_time: row.try_get("question_time")?,
        response_start_time: row.try_get("response_start_time")?,
        response_end_time: row.try_get("response_end_time")?,
        total_tokens: row.try_get("total_tokens")?,
        llm_id: row.try_get("llm_id")?,
        created_at: row.try_get("created_at")?,
        user_id: row.try_get("user_id")?,
        chat_context: row.try_get("chat_context")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> LatencyStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("pool");
        LatencyStore::new(pool).await.expect("store")
    }

    fn form(message_id: &str, chat_id: &str, llm_id: &str) -> LatencyMetricForm {
        LatencyMetricForm {
            chat_id: chat_id.to_string(),
            message_id: message_id.to_string(),
            question_time: 1.0,
            response_start_time: 1.5,
            response_end_time: 3.0,
            total_tokens: Some(42),
            llm_id: llm_id.to_string(),
            user_id: None,
            chat_context: None,
        }
    }

    #[tokio::test]
    async fn duplicate_message_id_keeps_first_row() {
        let store = store().await;
        let first = store.insert_metric(form("m1", "c1", "llm-a")).await.unwrap();
        let InsertOutcome::Inserted(metric) = first else {
            panic!("first insert must succeed");
        };
        assert_eq!(metric.id, "m1");

        let second = store.insert_metric(form("m1", "c2", "llm-b")).await.unwrap();
        assert_eq!(second, InsertOutcome::AlreadyRecorded);

        let all = store.list_metrics().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].chat_id, "c1");
        assert_eq!(all[0].llm_id, "llm-a");
    }

    #[tokio::test]
    async fn filters_by_chat_and_model_newest_first() {
        let store = store().await;
        store.insert_metric(form("m1", "c1", "llm-a")).await.unwrap();
        store.insert_metric(form("m2", "c1", "llm-b")).await.unwrap();
        store.insert_metric(form("m3", "c2", "llm-a")).await.unwrap();

        let by_chat = store.list_metrics_by_chat_id("c1").await.unwrap();
        let ids: Vec<_> = by_chat.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m1"]);

        let by_model = store.list_metrics_by_model_id("llm-a").await.unwrap();
        let ids: Vec<_> = by_model.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m1"]);
    }

    #[tokio::test]
    async fn delete_all_reports_whether_rows_existed() {
        let store = store().await;
        assert!(!store.delete_all_metrics().await.unwrap());
        store.insert_metric(form("m1", "c1", "llm-a")).await.unwrap();
        assert!(store.delete_all_metrics().await.unwrap());
        assert!(store.list_metrics().await.unwrap().is_empty());
    }
}
