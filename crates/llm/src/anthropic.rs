//! Anthropic Messages API adapter.

use std::time::Duration;

use async_trait::async_trait;
use pipeline::alignment::AlignmentFinding;
use pipeline::ports::{
    DelegateError, GenerateRequest, Generated, JudgeRequest, Judgement, LlmProvider,
};
use pipeline::{DelegateId, RetryPolicy, TokenCost, TokenCount};
use reqwest::{header, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::extract::extract_json_object;
use crate::prompt::{generation_prompt, judge_prompt, Prompt};
use crate::LlmError;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_API_VERSION: &str = "2023-06-01";

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
        }
    }
}

impl Pricing {
    /// Cost of a call with the given token usage.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> TokenCost {
        let micros = (input_tokens as f64 * self.input_per_mtok
            + output_tokens as f64 * self.output_per_mtok)
            .max(0.0);
        // Per-million-token prices times token counts are micro-dollars.
        TokenCost::from_micros(micros.ceil() as u64)
    }

    /// Largest output that keeps a call with `input_tokens` under `ceiling`.
    pub fn output_tokens_within(&self, ceiling: TokenCost, input_tokens: u64) -> u64 {
        if self.output_per_mtok <= 0.0 {
            return u64::MAX;
        }
        let left = ceiling.as_micros() as f64 - input_tokens as f64 * self.input_per_mtok;
        (left / self.output_per_mtok).floor().max(0.0) as u64
    }
}

/// Connection and model settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnthropicConfig {
    #[serde(skip_serializing)]
    pub api_key: String,
    pub base_url: String,
    pub api_version: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub pricing: Pricing,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 8192,
            timeout_secs: 300,
            pricing: Pricing::default(),
        }
    }
}

pub struct AnthropicProvider {
    client: Client,
    config: AnthropicConfig,
    identity: DelegateId,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig) -> Result<Self, LlmError> {
        if config.api_key.trim().is_empty() {
            return Err(LlmError::Config("Anthropic API key is not set".into()));
        }
        let identity = DelegateId::new(format!("anthropic:{}", config.model))
            .ok_or_else(|| LlmError::Config("model name is empty".into()))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            identity,
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'))
    }

    /// Sends one prompt and returns the reply text with its cost.
    async fn complete(&self, prompt: Prompt, ceiling: TokenCost) -> Result<Reply, DelegateError> {
        // Rough prompt size: four characters per token.
        let estimated_input = ((prompt.system.len() + prompt.user.len()) / 4) as u64;
        let max_tokens = if ceiling.is_zero() {
            self.config.max_tokens
        } else {
            let affordable = self
                .config
                .pricing
                .output_tokens_within(ceiling, estimated_input);
            if affordable == 0 {
                return Err(DelegateError::Rejected {
                    message: format!("cost ceiling {ceiling} does not cover the prompt"),
                });
            }
            self.config.max_tokens.min(affordable.min(u64::from(u32::MAX)) as u32)
        };

        let body = MessagesRequest {
            model: &self.config.model,
            max_tokens,
            system: &prompt.system,
            messages: vec![Message {
                role: "user",
                content: &prompt.user,
            }],
        };
        let response = self
            .client
            .post(self.messages_url())
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", &self.config.api_version)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(error_response(response).await);
        }
        let parsed: MessagesResponse = response.json().await.map_err(transport_error)?;
        let cost = self
            .config
            .pricing
            .cost(parsed.usage.input_tokens, parsed.usage.output_tokens);
        let text = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        debug!(
            input_tokens = parsed.usage.input_tokens,
            output_tokens = parsed.usage.output_tokens,
            cost = %cost,
            stop_reason = parsed.stop_reason.as_deref().unwrap_or("unknown"),
            "Anthropic call complete"
        );
        Ok(Reply {
            text,
            cost,
            tokens: TokenCount::new(parsed.usage.input_tokens + parsed.usage.output_tokens),
            truncated: parsed.stop_reason.as_deref() == Some("max_tokens"),
        })
    }
}

struct Reply {
    text: String,
    cost: TokenCost,
    tokens: TokenCount,
    truncated: bool,
}

impl Reply {
    fn json(&self) -> Result<Value, DelegateError> {
        extract_json_object(&self.text).ok_or_else(|| DelegateError::InvalidOutput {
            message: if self.truncated {
                "reply was cut off at the token limit before the JSON object was complete".into()
            } else {
                "reply did not contain a JSON object".into()
            },
            cost: self.cost,
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn identity(&self) -> DelegateId {
        self.identity.clone()
    }

    #[instrument(skip_all, fields(node = %request.node, model = %self.config.model))]
    async fn generate(&self, request: GenerateRequest) -> Result<Generated, DelegateError> {
        let reply = self
            .complete(generation_prompt(&request), request.cost_ceiling)
            .await?;
        let output = reply.json()?;
        Ok(Generated {
            output,
            cost: reply.cost,
            tokens: reply.tokens,
        })
    }

    #[instrument(skip_all, fields(node = %request.node, model = %self.config.model))]
    async fn judge(&self, request: JudgeRequest) -> Result<Judgement, DelegateError> {
        let reply = self
            .complete(judge_prompt(&request), request.cost_ceiling)
            .await?;
        let answer = reply.json()?;
        parse_judgement(&answer, reply.cost)
    }
}

/// Reads a judge answer. A missing verdict or score is `None`, which callers
/// treat as "no usable answer"; malformed findings make the answer invalid.
pub fn parse_judgement(answer: &Value, cost: TokenCost) -> Result<Judgement, DelegateError> {
    let findings = match answer.get("findings") {
        None | Some(Value::Null) => Vec::new(),
        Some(findings) => serde_json::from_value::<Vec<AlignmentFinding>>(findings.clone())
            .map_err(|e| DelegateError::InvalidOutput {
                message: format!("judge findings are malformed: {e}"),
                cost,
            })?,
    };
    Ok(Judgement {
        verdict: answer.get("verdict").and_then(Value::as_bool),
        score: answer.get("score").and_then(Value::as_f64),
        findings,
        cost,
    })
}

fn transport_error(error: reqwest::Error) -> DelegateError {
    let retryable = error.is_timeout() || error.is_connect() || error.is_request();
    DelegateError::Transport {
        message: error.to_string(),
        policy: if retryable {
            RetryPolicy::Retryable { after: None }
        } else {
            RetryPolicy::NonRetryable
        },
    }
}

async fn error_response(response: Response) -> DelegateError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_retry_after);
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiError>(&body)
        .map(|error| error.error.message)
        .unwrap_or(body);
    classify_status(status, retry_after, message)
}

/// Maps an HTTP error status onto the delegate error taxonomy.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, message: String) -> DelegateError {
    let message = format!("HTTP {}: {message}", status.as_u16());
    match status.as_u16() {
        408 | 409 | 429 | 500..=599 => {
            warn!(status = status.as_u16(), ?retry_after, "Anthropic call failed transiently");
            DelegateError::Transport {
                message,
                policy: RetryPolicy::Retryable { after: retry_after },
            }
        }
        _ => DelegateError::Rejected { message },
    }
}

/// `Retry-After` in delta-seconds. HTTP dates are not used by this API.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let seconds: f64 = value.trim().parse().ok()?;
    (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds))
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}
