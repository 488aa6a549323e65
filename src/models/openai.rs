// OpenAI wire models
//
// The unified request/response types in `models::unified` already carry the
// OpenAI chat-completion shape, so this module only holds the pieces that are
// OpenAI-specific: the `/v1/models` listing.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIModel {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

impl OpenAIModel {
    pub fn new(id: String, owned_by: String) -> Self {
        Self {
            id,
            object: "model".to_string(),
            created: chrono::Utc::now().timestamp(),
            owned_by,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<OpenAIModel>,
}

impl ModelList {
    pub fn new(models: Vec<OpenAIModel>) -> Self {
        Self {
            object: "list".to_string(),
            data: models,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_list_shape() {
        let list = ModelList::new(vec![OpenAIModel::new("gpt-4".into(), "openai".into())]);
        let json = serde_json::to_value(&list).unwrap();
        assert_eq!(json["object"], "list");
        assert_eq!(json["data"][0]["id"], "gpt-4");
        assert_eq!(json["data"][0]["object"], "model");
    }
}
