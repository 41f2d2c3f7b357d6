use crate::traits::ChatRelay;
use crate::types::{ConversationId, MessageId, SenderId};
use anyhow::{Context, Result, anyhow};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const API_PREFIX: &str = "/api/v1";

/// Relay backed by a BlueBubbles server's REST API.
#[derive(Clone)]
pub struct BlueBubblesRelay {
    http: reqwest::Client,
    api_base_url: String,
    password: String,
    resolve_timeout: Duration,
    send_timeout: Duration,
    fallback_scope: String,
}

impl BlueBubblesRelay {
    pub fn new(base_url: &str, password: &str) -> Result<Self> {
        let api_base_url = normalize_relay_base_url(base_url)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            api_base_url,
            password: password.to_string(),
            resolve_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            fallback_scope: "any".to_string(),
        })
    }

    pub fn with_resolve_timeout(mut self, resolve_timeout: Duration) -> Self {
        self.resolve_timeout = resolve_timeout;
        self
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn with_fallback_scope(mut self, scope: &str) -> Self {
        let scope = scope.trim();
        if !scope.is_empty() {
            self.fallback_scope = scope.to_string();
        }
        self
    }

    fn api_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}{}", self.api_base_url, API_PREFIX))
            .map_err(|e| anyhow!("invalid relay API URL: {e}"))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("relay base URL cannot carry a path"))?
            .extend(segments);
        Ok(url)
    }

    async fn lookup_conversation(&self, message_id: &MessageId) -> Result<Option<ConversationId>> {
        let url = self.api_url(&["message", message_id.as_str()])?;
        let response = self
            .http
            .get(url)
            .query(&[("password", self.password.as_str()), ("with", "chats")])
            .send()
            .await
            .map_err(reqwest::Error::without_url)?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("message lookup failed: status={status}"));
        }
        let body: MessageLookupResponse = response
            .json()
            .await
            .map_err(reqwest::Error::without_url)
            .context("decode message lookup response")?;
        Ok(body.first_chat_guid())
    }
}

#[async_trait::async_trait]
impl ChatRelay for BlueBubblesRelay {
    #[tracing::instrument(level = "info", skip_all, fields(sender = %sender))]
    async fn resolve_conversation(
        &self,
        message_id: &MessageId,
        sender: &SenderId,
    ) -> ConversationId {
        let fallback = fallback_conversation_id(&self.fallback_scope, sender);
        if message_id.trim().is_empty() {
            return fallback;
        }

        match tokio::time::timeout(self.resolve_timeout, self.lookup_conversation(message_id)).await
        {
            Ok(Ok(Some(conversation))) => conversation,
            Ok(Ok(None)) => {
                tracing::debug!(%message_id, "message has no chats; using fallback conversation");
                fallback
            }
            Ok(Err(e)) => {
                tracing::warn!(%e, %message_id, "conversation lookup failed; using fallback");
                fallback
            }
            Err(_) => {
                tracing::warn!(
                    %message_id,
                    timeout_ms = self.resolve_timeout.as_millis() as u64,
                    "conversation lookup timed out; using fallback"
                );
                fallback
            }
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(conversation_id = %conversation))]
    async fn send_text(&self, conversation: &ConversationId, text: &str) -> Result<()> {
        if conversation.trim().is_empty() {
            return Err(anyhow!("conversation id is required"));
        }
        if text.trim().is_empty() {
            return Err(anyhow!("message content is empty"));
        }

        let url = self.api_url(&["message", "text"])?;
        let payload = SendTextRequest {
            chat_guid: conversation.as_str(),
            message: text,
            method: "apple-script",
            temp_guid: format!("PT-{}", uuid::Uuid::new_v4()),
        };
        let request = self
            .http
            .post(url)
            .query(&[("password", self.password.as_str())])
            .json(&payload)
            .send();

        let response = tokio::time::timeout(self.send_timeout, request)
            .await
            .map_err(|_| anyhow!("send timed out after {:?}", self.send_timeout))?
            .map_err(reqwest::Error::without_url)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("send failed: status={status} body={body}"));
        }
        tracing::info!("reply sent");
        Ok(())
    }
}

/// Synthetic conversation identifier used when the relay cannot resolve one.
pub fn fallback_conversation_id(scope: &str, sender: &SenderId) -> ConversationId {
    ConversationId::new(format!("{scope};-;{sender}"))
}

fn normalize_relay_base_url(raw: &str) -> Result<String> {
    let normalized = raw.trim().trim_end_matches('/').to_string();
    if normalized.is_empty() {
        return Err(anyhow!("relay base_url is required"));
    }
    let parsed = Url::parse(&normalized).map_err(|e| anyhow!("invalid relay base_url: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(normalized),
        other => Err(anyhow!(
            "invalid relay base_url scheme: {other} (expected http or https)"
        )),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendTextRequest<'a> {
    chat_guid: &'a str,
    message: &'a str,
    method: &'a str,
    temp_guid: String,
}

#[derive(Debug, Default, Deserialize)]
struct MessageLookupResponse {
    #[serde(default)]
    data: Option<MessageLookupData>,
}

#[derive(Debug, Default, Deserialize)]
struct MessageLookupData {
    #[serde(default)]
    chats: Vec<ChatRef>,
}

#[derive(Debug, Deserialize)]
struct ChatRef {
    #[serde(default)]
    guid: String,
}

impl MessageLookupResponse {
    fn first_chat_guid(self) -> Option<ConversationId> {
        self.data?
            .chats
            .into_iter()
            .next()
            .map(|chat| chat.guid)
            .filter(|guid| !guid.trim().is_empty())
            .map(ConversationId::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn relay(server: &MockServer) -> BlueBubblesRelay {
        BlueBubblesRelay::new(&server.uri(), "secret").unwrap()
    }

    #[test]
    fn fallback_identifier_embeds_sender() {
        let id = fallback_conversation_id("any", &SenderId::from("S"));
        assert_eq!(id.as_str(), "any;-;S");
        assert!(!id.is_group(";+;"));
    }

    #[test]
    fn base_url_requires_http_or_https() {
        assert_eq!(
            normalize_relay_base_url("http://localhost:1234/").unwrap(),
            "http://localhost:1234"
        );
        assert!(normalize_relay_base_url("ftp://localhost").is_err());
        assert!(normalize_relay_base_url("  ").is_err());
    }

    #[tokio::test]
    async fn resolves_first_chat_guid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/message/MSG-1"))
            .and(query_param("password", "secret"))
            .and(query_param("with", "chats"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "chats": [{ "guid": "iMessage;-;+1555" }, { "guid": "other" }] }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let id = relay(&server)
            .resolve_conversation(&MessageId::from("MSG-1"), &SenderId::from("+1555"))
            .await;
        assert_eq!(id.as_str(), "iMessage;-;+1555");
    }

    #[tokio::test]
    async fn non_success_status_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let id = relay(&server)
            .resolve_conversation(&MessageId::from("MSG-1"), &SenderId::from("S"))
            .await;
        assert_eq!(id.as_str(), "any;-;S");
    }

    #[tokio::test]
    async fn missing_chats_falls_back_with_configured_scope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "chats": [] } })))
            .mount(&server)
            .await;

        let id = relay(&server)
            .with_fallback_scope("iMessage")
            .resolve_conversation(&MessageId::from("MSG-1"), &SenderId::from("S"))
            .await;
        assert_eq!(id.as_str(), "iMessage;-;S");
    }

    #[tokio::test]
    async fn malformed_body_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let id = relay(&server)
            .resolve_conversation(&MessageId::from("MSG-1"), &SenderId::from("S"))
            .await;
        assert_eq!(id.as_str(), "any;-;S");
    }

    #[tokio::test]
    async fn slow_lookup_times_out_to_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "data": { "chats": [{ "guid": "late" }] } }))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let id = relay(&server)
            .with_resolve_timeout(Duration::from_millis(100))
            .resolve_conversation(&MessageId::from("MSG-1"), &SenderId::from("S"))
            .await;
        assert_eq!(id.as_str(), "any;-;S");
    }

    #[tokio::test]
    async fn empty_message_id_skips_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let id = relay(&server)
            .resolve_conversation(&MessageId::from(""), &SenderId::from("S"))
            .await;
        assert_eq!(id.as_str(), "any;-;S");
    }

    #[tokio::test]
    async fn send_posts_relay_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/message/text"))
            .and(query_param("password", "secret"))
            .and(body_partial_json(json!({
                "chatGuid": "iMessage;-;A",
                "message": "hello",
                "method": "apple-script"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        relay(&server)
            .send_text(&ConversationId::from("iMessage;-;A"), "hello")
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert!(body["tempGuid"].as_str().unwrap().starts_with("PT-"));
    }

    #[tokio::test]
    async fn send_reports_failure_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = relay(&server)
            .send_text(&ConversationId::from("c"), "hello")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn transport_errors_never_carry_the_password() {
        let relay = BlueBubblesRelay::new("http://127.0.0.1:9", "HUNTER2PW").unwrap();

        let err = relay
            .lookup_conversation(&MessageId::from("M"))
            .await
            .unwrap_err();
        assert!(!format!("{err:#}").contains("HUNTER2PW"), "{err:#}");

        let err = relay
            .send_text(&ConversationId::from("iMessage;-;A"), "hello")
            .await
            .unwrap_err();
        assert!(!format!("{err:#}").contains("HUNTER2PW"), "{err:#}");
    }

    #[tokio::test]
    async fn send_rejects_empty_text() {
        let server = MockServer::start().await;
        let err = relay(&server)
            .send_text(&ConversationId::from("c"), "   ")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}
