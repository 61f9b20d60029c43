#![deny(unsafe_code)]

//! Streaming chat-completion client for OpenAI-compatible endpoints.

pub mod http_client;
pub mod provider;
pub mod sse;

use std::sync::Arc;

pub use http_client::HttpCompletionClient;
pub use provider::{
    BoxFuture, CompletionClient, DEFAULT_ENDPOINT, DEFAULT_MODEL, DEFAULT_VISION_MAX_TOKENS,
    ImageUrl, LineStream, ProviderConfig, ProviderContent, ProviderContentPart, ProviderError,
    ProviderMessage, ProviderResult, Role,
};
pub use sse::{DATA_PREFIX, DONE_MARKER, LineDecoder, SseEvent, decode_lines, parse_event_line};

/// Builds the HTTP-backed client behind the shared trait object.
pub fn create_client(config: ProviderConfig) -> ProviderResult<Arc<dyn CompletionClient>> {
    tracing::info!(
        endpoint = %config.endpoint,
        model = %config.model,
        authenticated = config.api_key.is_some(),
        "creating completion client"
    );
    Ok(Arc::new(HttpCompletionClient::new(config)?))
}
