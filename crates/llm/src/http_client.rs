use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};

use super::provider::{
    BoxFuture, BuildClientSnafu, CompletionClient, DecodeResponseSnafu, HttpStatusSnafu, ImageUrl,
    LineStream, MissingContentSnafu, ProviderConfig, ProviderContent, ProviderContentPart,
    ProviderMessage, ProviderResult, ReadStreamSnafu, Role, SendRequestSnafu,
};
use super::sse::decode_lines;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ProviderMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ResponseChoice>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat-completions client over HTTP.
#[derive(Debug, Clone)]
pub struct HttpCompletionClient {
    client: Client,
    config: ProviderConfig,
}

impl HttpCompletionClient {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context(BuildClientSnafu {
                stage: "build-http-client",
            })?;
        Ok(Self { client, config })
    }

    fn post(&self) -> RequestBuilder {
        let request = self
            .client
            .post(&self.config.endpoint)
            .header(CONTENT_TYPE, "application/json");
        match &self.config.api_key {
            Some(api_key) => request.bearer_auth(api_key),
            None => request,
        }
    }
}

async fn ensure_success(response: Response, stage: &'static str) -> ProviderResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    HttpStatusSnafu {
        stage,
        status: status.as_u16(),
        body,
    }
    .fail()
}

impl CompletionClient for HttpCompletionClient {
    fn stream_completion(
        &self,
        messages: Vec<ProviderMessage>,
    ) -> BoxFuture<'_, ProviderResult<LineStream>> {
        Box::pin(async move {
            let body = ChatCompletionRequest {
                model: &self.config.model,
                messages: &messages,
                stream: Some(true),
                max_tokens: None,
            };

            tracing::debug!(
                endpoint = %self.config.endpoint,
                model = %self.config.model,
                message_count = messages.len(),
                "opening completion stream"
            );

            let response = self
                .post()
                .header(ACCEPT, "text/event-stream")
                .json(&body)
                .send()
                .await
                .context(SendRequestSnafu {
                    stage: "send-stream-request",
                })?;
            let response = ensure_success(response, "stream-response-status").await?;

            let bytes = response.bytes_stream().map(|chunk| {
                chunk.context(ReadStreamSnafu {
                    stage: "read-stream-body",
                })
            });
            Ok(decode_lines(bytes, self.config.idle_timeout))
        })
    }

    fn describe_image(
        &self,
        image_url: String,
        prompt: String,
    ) -> BoxFuture<'_, ProviderResult<String>> {
        Box::pin(async move {
            let messages = [ProviderMessage {
                role: Role::User,
                content: ProviderContent::Parts(vec![
                    ProviderContentPart::Text { text: prompt },
                    ProviderContentPart::ImageUrl {
                        image_url: ImageUrl { url: image_url },
                    },
                ]),
            }];
            let body = ChatCompletionRequest {
                model: &self.config.model,
                messages: &messages,
                stream: None,
                max_tokens: Some(self.config.vision_max_tokens),
            };

            tracing::debug!(
                endpoint = %self.config.endpoint,
                model = %self.config.model,
                max_tokens = self.config.vision_max_tokens,
                "requesting image description"
            );

            let response = self
                .post()
                .json(&body)
                .send()
                .await
                .context(SendRequestSnafu {
                    stage: "send-vision-request",
                })?;
            let response = ensure_success(response, "vision-response-status").await?;
            let parsed: ChatCompletionResponse =
                response.json().await.context(DecodeResponseSnafu {
                    stage: "decode-vision-response",
                })?;

            parsed
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .context(MissingContentSnafu {
                    stage: "vision-response-content",
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_body_omits_max_tokens() {
        let messages = vec![ProviderMessage::user("hi")];
        let body = ChatCompletionRequest {
            model: "openai",
            messages: &messages,
            stream: Some(true),
            max_tokens: None,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "model": "openai",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true,
            })
        );
    }

    #[test]
    fn image_parts_use_image_url_shape() {
        let part = ProviderContentPart::ImageUrl {
            image_url: ImageUrl {
                url: "data:image/png;base64,AAAA".into(),
            },
        };
        let value = serde_json::to_value(&part).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}})
        );
    }
}
