//! Shared types for the text-processing pipeline: the task model, the task store
//! (C1), process configuration (C6), and logging setup (C7).

pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod store;

pub use error::StoreError;
pub use model::{
    PartialTaskUpdate, ProcessTextRequest, Task, TaskDto, TaskIdResponse, TaskStatus, TextType,
};
pub use store::TaskStore;

#[cfg(test)]
mod tests {
    use super::*;
    use model::TextType;

    #[test]
    fn text_type_length_bounds() {
        assert_eq!(TextType::ChatItem.length_bounds(1_000_000), (1, 300));
        assert_eq!(TextType::Summary.length_bounds(1_000_000), (1, 3000));
        assert_eq!(TextType::Article.length_bounds(1_000_000), (300_000, 1_000_000));
    }

    #[test]
    fn task_dto_rejects_blank_text() {
        let dto = TaskDto {
            original_text: "   ".to_string(),
            r#type: TextType::ChatItem,
        };
        assert!(dto.validate().is_err());
    }

    #[test]
    fn task_dto_accepts_non_blank_text() {
        let dto = TaskDto {
            original_text: "hello".to_string(),
            r#type: TextType::ChatItem,
        };
        assert!(dto.validate().is_ok());
    }

    #[test]
    fn uuid_hex_round_trips_as_32_char_lowercase() {
        let id = uuid::Uuid::parse_str("8c8b4e08-34ac-41f9-8cad-44b9f938180a").unwrap();
        let resp = TaskIdResponse { task_id: id };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"task_id":"8c8b4e0834ac41f98cad44b9f938180a"}"#);
    }

    #[test]
    fn process_text_request_accepts_hex_or_hyphenated_task_id() {
        let hex = r#"{"task_id":"8c8b4e0834ac41f98cad44b9f938180a","type":"chat_item","text":"hi"}"#;
        let hyphenated =
            r#"{"task_id":"8c8b4e08-34ac-41f9-8cad-44b9f938180a","type":"chat_item","text":"hi"}"#;
        let a: ProcessTextRequest = serde_json::from_str(hex).unwrap();
        let b: ProcessTextRequest = serde_json::from_str(hyphenated).unwrap();
        assert_eq!(a.task_id, b.task_id);
    }
}
