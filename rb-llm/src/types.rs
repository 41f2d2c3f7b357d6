use crate::error::{LlmError, Result};
use serde::{Deserialize, Serialize};

/// How the system text is delivered to a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptShape {
    /// System text goes into the dedicated `system_instruction` field.
    SystemInstruction,
    /// System text is prepended to the user text. Used by models that reject
    /// `system_instruction`.
    InlinePreamble,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    fn text(role: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            role: role.map(ToOwned::to_owned),
            parts: vec![Part { text: text.into() }],
        }
    }
}

/// Request body for `models/{model}:generateContent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum GenerateContentRequest {
    Structured {
        system_instruction: Content,
        contents: Vec<Content>,
    },
    Inline {
        contents: Vec<Content>,
    },
}

impl GenerateContentRequest {
    pub fn build(shape: PromptShape, system_text: &str, user_text: &str) -> Self {
        match shape {
            PromptShape::SystemInstruction => Self::Structured {
                system_instruction: Content::text(None, system_text),
                contents: vec![Content::text(None, user_text)],
            },
            PromptShape::InlinePreamble => Self::Inline {
                contents: vec![Content::text(
                    Some("user"),
                    format!("{system_text}{user_text}"),
                )],
            },
        }
    }

    pub fn shape(&self) -> PromptShape {
        match self {
            Self::Structured { .. } => PromptShape::SystemInstruction,
            Self::Inline { .. } => PromptShape::InlinePreamble,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
}

impl GenerateContentResponse {
    /// Text of the first part of the first candidate.
    ///
    /// Any missing field or blank text is an error; callers treat it the same
    /// as a failed request.
    pub fn into_text(self) -> Result<String> {
        let candidate = self
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::ResponseFormat("response has no candidates".to_string()))?;
        let content = candidate
            .content
            .ok_or_else(|| LlmError::ResponseFormat("candidate has no content".to_string()))?;
        let part = content
            .parts
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::ResponseFormat("content has no parts".to_string()))?;
        if part.text.trim().is_empty() {
            return Err(LlmError::EmptyCompletion);
        }
        Ok(part.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_request_uses_system_instruction() {
        let req = GenerateContentRequest::build(PromptShape::SystemInstruction, "be nice", "hi");
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(
            body,
            json!({
                "system_instruction": { "parts": [{ "text": "be nice" }] },
                "contents": [{ "parts": [{ "text": "hi" }] }]
            })
        );
    }

    #[test]
    fn inline_request_prepends_preamble_to_user_text() {
        let req = GenerateContentRequest::build(PromptShape::InlinePreamble, "be nice. ", "hi");
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(
            body,
            json!({
                "contents": [{ "role": "user", "parts": [{ "text": "be nice. hi" }] }]
            })
        );
        assert!(body.get("system_instruction").is_none());
        assert_eq!(req.shape(), PromptShape::InlinePreamble);
    }

    #[test]
    fn response_text_is_first_part_of_first_candidate() {
        let resp: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [
                { "content": { "parts": [{ "text": "hello" }, { "text": "ignored" }] } },
                { "content": { "parts": [{ "text": "second" }] } }
            ]
        }))
        .unwrap();
        assert_eq!(resp.into_text().unwrap(), "hello");
    }

    #[test]
    fn response_missing_fields_fails_closed() {
        let cases = [
            json!({}),
            json!({ "candidates": [] }),
            json!({ "candidates": [{}] }),
            json!({ "candidates": [{ "content": { "parts": [] } }] }),
        ];
        for case in cases {
            let resp: GenerateContentResponse = serde_json::from_value(case.clone()).unwrap();
            assert!(
                matches!(resp.into_text(), Err(LlmError::ResponseFormat(_))),
                "expected format error for {case}"
            );
        }
    }

    #[test]
    fn blank_completion_is_rejected() {
        let resp: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{ "content": { "parts": [{ "text": "  \n" }] } }]
        }))
        .unwrap();
        assert!(matches!(resp.into_text(), Err(LlmError::EmptyCompletion)));
    }
}
