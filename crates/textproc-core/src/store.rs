use crate::error::StoreError;
use crate::model::{PartialTaskUpdate, Task, TaskStatus};
use sqlx::PgPool;
use uuid::Uuid;

/// Task Store (C1). Wraps a pooled async Postgres driver; every call leases its
/// own connection from the pool rather than holding one across calls, so sessions
/// never share mutable state between callers.
#[derive(Clone)]
pub struct TaskStore {
    pool: PgPool,
}

impl TaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// INSERT; fails with [`StoreError::AlreadyExists`] if `task_id` is taken.
    pub async fn create(&self, task_id: Uuid, r#type: crate::model::TextType) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (task_id, type, status, created_at, updated_at)
            VALUES ($1, $2, 'pending', now(), now())
            "#,
        )
        .bind(task_id)
        .bind(r#type)
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => {
                tx.commit().await?;
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                tx.rollback().await.ok();
                Err(StoreError::AlreadyExists(task_id))
            }
            Err(err) => {
                tx.rollback().await.ok();
                Err(StoreError::Db(err))
            }
        }
    }

    /// INSERT ... ON CONFLICT (task_id) DO UPDATE, merging only the fields set in
    /// `update`; unset fields leave the existing column untouched. Always stamps
    /// `updated_at = now()`.
    pub async fn upsert(&self, task_id: Uuid, update: PartialTaskUpdate) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let status = update.status.unwrap_or(TaskStatus::Pending);

        sqlx::query(
            r#"
            INSERT INTO tasks (
                task_id, original_text, processed_text, word_count, language,
                type, status, cause, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now(), now())
            ON CONFLICT (task_id) DO UPDATE SET
                original_text  = COALESCE(EXCLUDED.original_text, tasks.original_text),
                processed_text = COALESCE(EXCLUDED.processed_text, tasks.processed_text),
                word_count     = COALESCE(EXCLUDED.word_count, tasks.word_count),
                language       = COALESCE(EXCLUDED.language, tasks.language),
                type           = COALESCE(EXCLUDED.type, tasks.type),
                status         = COALESCE(EXCLUDED.status, tasks.status),
                cause          = COALESCE(EXCLUDED.cause, tasks.cause),
                updated_at     = now()
            "#,
        )
        .bind(task_id)
        .bind(&update.original_text)
        .bind(&update.processed_text)
        .bind(update.word_count)
        .bind(&update.language)
        .bind(update.r#type)
        .bind(status)
        .bind(&update.cause)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn exists(&self, task_id: Uuid) -> Result<bool, StoreError> {
        let row: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn get(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::model::{PartialTaskUpdate, TaskStatus, TextType};

    async fn test_store() -> anyhow::Result<TaskStore> {
        let cfg = AppConfig::from_env()?;
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(&cfg.database_url)
            .await?;
        sqlx::migrate!("../../service/migrations").run(&pool).await?;
        Ok(TaskStore::new(pool))
    }

    #[tokio::test]
    async fn create_rejects_duplicate_task_id() -> anyhow::Result<()> {
        let store = test_store().await?;
        let task_id = Uuid::new_v4();

        store.create(task_id, TextType::ChatItem).await?;
        let err = store.create(task_id, TextType::ChatItem).await;
        assert!(matches!(err, Err(StoreError::AlreadyExists(id)) if id == task_id));
        Ok(())
    }

    #[tokio::test]
    async fn exists_reflects_create() -> anyhow::Result<()> {
        let store = test_store().await?;
        let task_id = Uuid::new_v4();

        assert!(!store.exists(task_id).await?);
        store.create(task_id, TextType::Summary).await?;
        assert!(store.exists(task_id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn upsert_merges_unset_fields_as_untouched() -> anyhow::Result<()> {
        let store = test_store().await?;
        let task_id = Uuid::new_v4();

        store
            .upsert(
                task_id,
                PartialTaskUpdate {
                    original_text: Some("hello world".to_string()),
                    r#type: Some(TextType::ChatItem),
                    status: Some(TaskStatus::Pending),
                    ..Default::default()
                },
            )
            .await?;

        store
            .upsert(
                task_id,
                PartialTaskUpdate::completed(
                    "hello world".to_string(),
                    "hello world".to_string(),
                    2,
                    "en".to_string(),
                    TextType::ChatItem,
                ),
            )
            .await?;

        let task = store.get(task_id).await?.expect("row exists");
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.original_text.as_deref(), Some("hello world"));
        assert_eq!(task.word_count, Some(2));
        assert_eq!(task.language.as_deref(), Some("en"));
        Ok(())
    }

    #[tokio::test]
    async fn get_returns_none_for_unknown_task() -> anyhow::Result<()> {
        let store = test_store().await?;
        assert!(store.get(Uuid::new_v4()).await?.is_none());
        Ok(())
    }
}
