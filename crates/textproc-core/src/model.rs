use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Serializes/deserializes a [`Uuid`] as 32-char lowercase hex on the wire while
/// still accepting canonical 8-4-4-4-12 hyphenated input.
pub mod uuid_hex {
    use serde::{Deserialize, Deserializer, Serializer};
    use uuid::Uuid;

    pub fn serialize<S: Serializer>(id: &Uuid, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&id.simple().to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Uuid, D::Error> {
        let raw = String::deserialize(de)?;
        Uuid::parse_str(&raw).map_err(serde::de::Error::custom)
    }
}

/// As [`uuid_hex`], but for `Option<Uuid>`.
pub mod uuid_hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use uuid::Uuid;

    pub fn serialize<S: Serializer>(id: &Option<Uuid>, ser: S) -> Result<S::Ok, S::Error> {
        match id {
            Some(id) => ser.serialize_str(&id.simple().to_string()),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Uuid>, D::Error> {
        let raw = Option::<String>::deserialize(de)?;
        raw.map(|s| Uuid::parse_str(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
    Failed,
    FailedFinal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TextType {
    ChatItem,
    Summary,
    Article,
}

impl TextType {
    /// Inclusive `(min, max)` length bounds for `text` under this type, per the ingress
    /// validation rules.
    pub fn length_bounds(self, article_max_length: usize) -> (usize, usize) {
        match self {
            TextType::ChatItem => (1, 300),
            TextType::Summary => (1, 3000),
            TextType::Article => (300_000, article_max_length),
        }
    }
}

/// A persisted task row (§3).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    #[serde(with = "uuid_hex")]
    pub task_id: Uuid,
    pub original_text: Option<String>,
    pub processed_text: Option<String>,
    pub word_count: Option<i32>,
    pub language: Option<String>,
    pub r#type: Option<TextType>,
    pub status: TaskStatus,
    pub cause: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Inbound `POST /process-text` body. Distinct from [`TaskDto`]: the HTTP surface
/// calls the payload field `text`, the broker message calls it `original_text`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessTextRequest {
    #[serde(default, with = "uuid_hex_opt")]
    pub task_id: Option<Uuid>,
    pub r#type: TextType,
    pub text: String,
}

/// The broker message body the worker routine parses (§3, §4.4 step 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDto {
    pub original_text: String,
    pub r#type: TextType,
}

impl TaskDto {
    /// Schema validation beyond well-formed JSON: non-blank text, valid enum
    /// (the enum is already guaranteed by successful deserialization).
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.original_text.trim().is_empty() {
            return Err("original_text must be non-blank");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskIdResponse {
    #[serde(with = "uuid_hex")]
    pub task_id: Uuid,
}

/// Explicit partial-update struct for `UPDATE tasks SET ...` (§9 re-architecture:
/// no dynamic per-call field dictionaries). `None` means "leave column untouched".
#[derive(Debug, Clone, Default)]
pub struct PartialTaskUpdate {
    pub original_text: Option<String>,
    pub processed_text: Option<String>,
    pub word_count: Option<i32>,
    pub language: Option<String>,
    pub r#type: Option<TextType>,
    pub status: Option<TaskStatus>,
    pub cause: Option<String>,
}

impl PartialTaskUpdate {
    pub fn completed(
        original_text: String,
        processed_text: String,
        word_count: i32,
        language: String,
        r#type: TextType,
    ) -> Self {
        Self {
            original_text: Some(original_text),
            processed_text: Some(processed_text),
            word_count: Some(word_count),
            language: Some(language),
            r#type: Some(r#type),
            status: Some(TaskStatus::Completed),
            cause: None,
        }
    }

    pub fn failed_final(cause: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::FailedFinal),
            cause: Some(cause.into()),
            ..Default::default()
        }
    }

    pub fn failed_final_with_payload(
        cause: impl Into<String>,
        original_text: String,
        r#type: TextType,
    ) -> Self {
        Self {
            original_text: Some(original_text),
            r#type: Some(r#type),
            status: Some(TaskStatus::FailedFinal),
            cause: Some(cause.into()),
            ..Default::default()
        }
    }

    pub fn failed_with_payload(
        cause: impl Into<String>,
        original_text: String,
        r#type: TextType,
    ) -> Self {
        Self {
            original_text: Some(original_text),
            r#type: Some(r#type),
            status: Some(TaskStatus::Failed),
            cause: Some(cause.into()),
            ..Default::default()
        }
    }
}
