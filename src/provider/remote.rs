use std::time::Duration;

use log::{debug, warn};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;

use super::{CaptionProvider, EmbeddingProvider, data_url};
use crate::error::{ConfigError, ProviderError};

pub const DEFAULT_EMBEDDING_ENDPOINT: &str =
    "https://dashscope.aliyuncs.com/api/v1/services/embeddings/multimodal-embedding/multimodal-embedding";
pub const DEFAULT_EMBEDDING_MODEL: &str = "multimodal-embedding-v1";
pub const DEFAULT_CHAT_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
pub const DEFAULT_CAPTION_MODEL: &str = "qwen-vl-max";

const CAPTION_PROMPT: &str = "Identify the main object category/type in this image. \
    Answer with 1-2 words describing the species or object type only \
    (e.g., 'dog', 'car', 'tree', 'building'). Focus on WHAT it is, not how it looks.";

fn build_client(timeout: Duration) -> Result<Client, ConfigError> {
    Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(16)
        .build()
        .map_err(|e| ConfigError::invalid("http-client", e.to_string()))
}

/// 将非 2xx 响应转换为对应的错误
async fn check_status(resp: Response) -> Result<Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after = parse_retry_after(resp.headers());
    let body = resp.text().await.unwrap_or_default();
    Err(classify(status, retry_after, body))
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub(crate) fn classify(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: String,
) -> ProviderError {
    let message = format!("{}: {}", status, body.chars().take(256).collect::<String>());
    match status.as_u16() {
        401 | 403 => ProviderError::Auth(message),
        402 => ProviderError::QuotaExhausted(message),
        429 => ProviderError::RateLimited { retry_after },
        400 | 413 | 415 | 422 => ProviderError::InvalidImage(message),
        408 => ProviderError::Timeout,
        500..=599 => ProviderError::Unavailable(message),
        _ => ProviderError::InvalidResponse(message),
    }
}

#[derive(Debug, Clone)]
pub struct RemoteEmbedderConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    pub dimension: usize,
    pub timeout: Duration,
}

impl Default for RemoteEmbedderConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_EMBEDDING_ENDPOINT.to_string(),
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            api_key: String::new(),
            dimension: 1024,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    output: EmbeddingOutput,
}

#[derive(Deserialize)]
struct EmbeddingOutput {
    embeddings: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

/// DashScope 多模态向量接口
pub struct RemoteEmbedder {
    client: Client,
    config: RemoteEmbedderConfig,
}

impl RemoteEmbedder {
    pub fn new(config: RemoteEmbedderConfig) -> Result<Self, ConfigError> {
        if config.api_key.is_empty() {
            return Err(ConfigError::missing("embedding-api-key", "远程向量服务需要 API key"));
        }
        let client = build_client(config.timeout)?;
        Ok(Self { client, config })
    }
}

impl EmbeddingProvider for RemoteEmbedder {
    fn dimension(&self) -> usize {
        self.config.dimension
    }

    async fn embed(&self, image: &[u8]) -> Result<Vec<f32>, ProviderError> {
        let body = json!({
            "model": self.config.model,
            "input": { "contents": [{ "image": data_url(image)? }] },
        });
        let resp = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;
        let resp: EmbeddingResponse = check_status(resp).await?.json().await?;
        let embedding = resp
            .output
            .embeddings
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .ok_or_else(|| ProviderError::InvalidResponse("响应中没有向量".to_string()))?;
        debug!("获取到 {} 维向量", embedding.len());
        Ok(embedding)
    }
}

#[derive(Debug, Clone)]
pub struct ChatCaptionerConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl Default for ChatCaptionerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_CHAT_BASE_URL.to_string(),
            model: DEFAULT_CAPTION_MODEL.to_string(),
            api_key: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// OpenAI 兼容的 chat completions 接口，用视觉模型生成图片描述
pub struct ChatCaptioner {
    client: Client,
    config: ChatCaptionerConfig,
}

impl ChatCaptioner {
    pub fn new(config: ChatCaptionerConfig) -> Result<Self, ConfigError> {
        if config.api_key.is_empty() {
            return Err(ConfigError::missing("caption-api-key", "图片描述服务需要 API key"));
        }
        let client = build_client(config.timeout)?;
        Ok(Self { client, config })
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

impl CaptionProvider for ChatCaptioner {
    async fn caption(&self, image: &[u8]) -> Result<String, ProviderError> {
        let body = json!({
            "model": self.config.model,
            "temperature": 0.1,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": CAPTION_PROMPT },
                    { "type": "image_url", "image_url": { "url": data_url(image)? } },
                ],
            }],
        });
        let resp = self
            .client
            .post(self.url())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;
        let resp: ChatResponse = check_status(resp).await?.json().await?;
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("响应中没有 choices".to_string()))?;
        match choice.message.content {
            Some(content) => Ok(content.trim().to_string()),
            None => {
                warn!("模型没有返回图片描述");
                Ok(String::new())
            }
        }
    }
}
