use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::stream::BoxStream;
use serde::Serialize;
use snafu::Snafu;

pub const DEFAULT_ENDPOINT: &str = "https://text.pollinations.ai/openai";
pub const DEFAULT_MODEL: &str = "openai";
pub const DEFAULT_VISION_MAX_TOKENS: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub vision_max_tokens: u64,
    /// Longest silence tolerated between two reads of a streaming response.
    pub idle_timeout: Option<Duration>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT, DEFAULT_MODEL)
    }
}

impl ProviderConfig {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim().to_string(),
            model: model.into().trim().to_string(),
            api_key: None,
            vision_max_tokens: DEFAULT_VISION_MAX_TOKENS,
            idle_timeout: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into().trim().to_string();
        self.api_key = (!api_key.is_empty()).then_some(api_key);
        self
    }

    pub fn with_vision_max_tokens(mut self, max_tokens: u64) -> Self {
        self.vision_max_tokens = max_tokens;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

/// Chat speaker role on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ProviderContent {
    Text(String),
    Parts(Vec<ProviderContentPart>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: ProviderContent,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: ProviderContent::Text(content.into()),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Decoded text lines of one streaming response.
///
/// Finite and single-use: once exhausted or failed, issue a new request to retry.
pub type LineStream = BoxStream<'static, ProviderResult<String>>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("failed to build http client: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request failed on `{stage}`, {source}"))]
    SendRequest {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("completion endpoint returned status {status}: {body}"))]
    HttpStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("stream read failed on `{stage}`, {source}"))]
    ReadStream {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("stream produced no data for {idle_secs}s"))]
    StreamIdle { stage: &'static str, idle_secs: u64 },
    #[snafu(display("failed to decode completion response on `{stage}`, {source}"))]
    DecodeResponse {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("completion response carried no message content"))]
    MissingContent { stage: &'static str },
    #[snafu(display("malformed stream chunk '{payload}': {source}"))]
    MalformedChunk {
        stage: &'static str,
        payload: String,
        source: serde_json::Error,
    },
}

impl ProviderError {
    /// Chunk-level problems are skippable; everything else ends the request.
    pub fn is_malformed_chunk(&self) -> bool {
        matches!(self, Self::MalformedChunk { .. })
    }
}

/// Hosted language-model endpoint.
pub trait CompletionClient: Send + Sync {
    /// Opens a streaming completion over the given context, oldest message first.
    fn stream_completion(
        &self,
        messages: Vec<ProviderMessage>,
    ) -> BoxFuture<'_, ProviderResult<LineStream>>;

    /// One-shot vision call; returns the model's description of the image.
    fn describe_image(
        &self,
        image_url: String,
        prompt: String,
    ) -> BoxFuture<'_, ProviderResult<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_api_key_is_treated_as_absent() {
        let config = ProviderConfig::default().with_api_key("   ");
        assert_eq!(config.api_key, None);

        let config = ProviderConfig::default().with_api_key(" sk-test ");
        assert_eq!(config.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn text_messages_serialize_as_role_and_string() {
        let value = serde_json::to_value(ProviderMessage::system("be brief")).unwrap();
        assert_eq!(value, serde_json::json!({"role": "system", "content": "be brief"}));
    }
}
