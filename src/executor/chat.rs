//! LLM-backed executor speaking the OpenAI-compatible chat completions API.
//!
//! Each job keeps one conversation: the system instruction followed by every
//! step and the model's reply to it, so later steps can build on earlier
//! results. When a tool server is configured (the Playwright browser server
//! by default) its tools are offered to the model and any tool calls are run
//! until the model gives a final answer for the step. Transient HTTP
//! failures are retried here with exponential backoff; the job core never
//! retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ExecutorConfig;
use crate::error::{ConfigError, ExecutorError, ToolError};
use crate::executor::mcp::{McpClient, McpTool};
use crate::executor::{ExecutorFactory, StepExecutor};
use crate::worker::{JobId, LogSink};

/// Longest error body excerpt carried into a step error.
const MAX_ERROR_BODY: usize = 200;

/// Longest tool result handed back to the model.
const MAX_TOOL_OUTPUT: usize = 20_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    pub fn assistant_with_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".to_string(),
            content,
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, as sent by the model.
    #[serde(default)]
    pub arguments: String,
}

fn function_kind() -> String {
    "function".to_string()
}

/// Tool offered to the model.
#[derive(Debug, Clone, Serialize)]
struct ToolSpec {
    #[serde(rename = "type")]
    kind: &'static str,
    function: FunctionSpec,
}

#[derive(Debug, Clone, Serialize)]
struct FunctionSpec {
    name: String,
    description: String,
    parameters: Value,
}

impl From<McpTool> for ToolSpec {
    fn from(tool: McpTool) -> Self {
        let parameters = if tool.input_schema.is_object() {
            tool.input_schema
        } else {
            serde_json::json!({ "type": "object", "properties": {} })
        };
        Self {
            kind: "function",
            function: FunctionSpec {
                name: tool.name,
                description: tool.description.unwrap_or_default(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolSpec]>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

/// What the model answered.
#[derive(Debug, PartialEq)]
enum Reply {
    Text(String),
    ToolCalls {
        content: Option<String>,
        calls: Vec<ToolCall>,
    },
}

/// Outcome of one HTTP attempt.
enum Attempt {
    Done(Reply),
    Retry { reason: String, after: Option<Duration> },
    Fatal(String),
}

/// Executor that hands each step to a chat model.
pub struct ChatExecutor {
    job_id: JobId,
    config: Arc<ExecutorConfig>,
    client: Option<reqwest::Client>,
    tools: Option<McpClient>,
    tool_specs: Vec<ToolSpec>,
    messages: Vec<ChatMessage>,
}

impl ChatExecutor {
    pub fn new(job_id: JobId, config: Arc<ExecutorConfig>) -> Self {
        Self {
            job_id,
            config,
            client: None,
            tools: None,
            tool_specs: Vec::new(),
            messages: Vec::new(),
        }
    }

    /// Use an already connected tool server instead of spawning one in `setup`.
    pub fn with_tool_client(mut self, tools: McpClient) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Conversation so far (system prompt, steps, tool traffic, replies).
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.api_base)
    }

    async fn start_tools(&mut self, log: &dyn LogSink) -> Result<(), ToolError> {
        let mut tools = match self.tools.take() {
            // Injected connections are not initialized yet.
            Some(mut tools) => {
                tools.initialize().await?;
                tools
            }
            None => match &self.config.tools {
                Some(server) => {
                    log.append(format!("Starting browser tools ({})...", server.display()));
                    McpClient::spawn(server).await?
                }
                None => return Ok(()),
            },
        };

        let available = tools.list_tools().await?;
        tracing::info!(job_id = %self.job_id, count = available.len(), "Tools loaded");
        log.append(format!("Loaded {} tools.", available.len()));
        self.tool_specs = available.into_iter().map(ToolSpec::from).collect();
        self.tools = Some(tools);
        Ok(())
    }

    async fn attempt(&self, client: &reqwest::Client) -> Attempt {
        let body = ChatRequest {
            model: &self.config.model,
            temperature: self.config.temperature,
            messages: &self.messages,
            tools: (!self.tool_specs.is_empty()).then_some(self.tool_specs.as_slice()),
        };

        let mut request = client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() => {
                return Attempt::Retry {
                    reason: e.to_string(),
                    after: None,
                };
            }
            Err(e) => return Attempt::Fatal(e.to_string()),
        };

        let status = response.status();
        if status.is_success() {
            return match response.json::<ChatResponse>().await {
                Ok(parsed) => match parse_reply(parsed) {
                    Some(reply) => Attempt::Done(reply),
                    None => Attempt::Fatal("model returned no content".to_string()),
                },
                Err(e) => Attempt::Fatal(format!("invalid response: {e}")),
            };
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response.text().await.unwrap_or_default();
        let reason = format!("HTTP {}: {}", status.as_u16(), truncate(&text, MAX_ERROR_BODY));

        if self.config.retry.is_retryable_status(status.as_u16()) {
            Attempt::Retry {
                reason,
                after: retry_after,
            }
        } else {
            Attempt::Fatal(reason)
        }
    }

    /// One model round trip, retrying transient failures.
    async fn complete(
        &self,
        index: usize,
        client: &reqwest::Client,
        log: &dyn LogSink,
    ) -> Result<Reply, String> {
        let max_retries = self.config.retry.max_retries;
        let mut attempt = 0;
        loop {
            match self.attempt(client).await {
                Attempt::Done(reply) => return Ok(reply),
                Attempt::Fatal(reason) => return Err(reason),
                Attempt::Retry { reason, after } if attempt < max_retries => {
                    let delay = self.retry_delay(attempt, after);
                    attempt += 1;
                    tracing::warn!(
                        job_id = %self.job_id,
                        step = index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient executor failure: {}",
                        reason
                    );
                    log.append(format!(
                        "Retrying step {index} in {:.1}s ({attempt}/{max_retries}): {reason}",
                        delay.as_secs_f32()
                    ));
                    tokio::time::sleep(delay).await;
                }
                Attempt::Retry { reason, .. } => {
                    return Err(format!("{reason} (after {} attempts)", attempt + 1));
                }
            }
        }
    }

    /// Talk to the model until it answers the current step without tools.
    async fn converse(
        &mut self,
        index: usize,
        client: &reqwest::Client,
        log: &dyn LogSink,
    ) -> Result<String, String> {
        for _ in 0..=self.config.max_tool_rounds {
            match self.complete(index, client, log).await? {
                Reply::Text(text) => return Ok(text),
                Reply::ToolCalls { content, calls } => {
                    self.messages
                        .push(ChatMessage::assistant_with_tool_calls(content, calls.clone()));
                    for call in calls {
                        let output = self.run_tool(index, &call, log).await?;
                        self.messages.push(ChatMessage::tool_result(call.id, output));
                    }
                }
            }
        }
        Err(format!(
            "no final answer after {} tool rounds",
            self.config.max_tool_rounds
        ))
    }

    /// Run one tool call. Problems the model can react to are returned to it
    /// as text; a broken tool server fails the step.
    async fn run_tool(
        &mut self,
        index: usize,
        call: &ToolCall,
        log: &dyn LogSink,
    ) -> Result<String, String> {
        let name = &call.function.name;
        log.append(format!("Tool: {name}"));

        let Some(tools) = self.tools.as_mut() else {
            return Ok(format!("Error: tool {name} is not available"));
        };
        let arguments: Value = if call.function.arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str(&call.function.arguments) {
                Ok(v) => v,
                Err(e) => return Ok(format!("Error: invalid arguments for {name}: {e}")),
            }
        };

        let timeout = self
            .config
            .tools
            .as_ref()
            .map(|t| t.call_timeout)
            .unwrap_or(self.config.request_timeout);
        let result = tokio::time::timeout(timeout, tools.call_tool(name, arguments))
            .await
            .unwrap_or_else(|_| {
                Err(ToolError::Timeout {
                    method: name.clone(),
                    timeout,
                })
            });

        match result {
            Ok(out) if out.is_error => {
                tracing::debug!(job_id = %self.job_id, step = index, tool = %name, "Tool reported error");
                Ok(format!("Error: {}", truncate(&out.text, MAX_TOOL_OUTPUT)))
            }
            Ok(out) => Ok(truncate(&out.text, MAX_TOOL_OUTPUT)),
            Err(ToolError::Rpc { message, .. }) => Ok(format!("Error: {message}")),
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, step = index, tool = %name, "Tool call failed: {}", e);
                Err(format!("tool {name} failed: {e}"))
            }
        }
    }

    /// Delay before retry number `attempt`, with up to 25% random jitter.
    fn retry_delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let base = self.config.retry.backoff(attempt);
        if let Some(hint) = hint {
            return hint.min(self.config.retry.max_delay);
        }
        let jitter_ms = (base.as_millis() / 4) as u64;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }
}

#[async_trait]
impl StepExecutor for ChatExecutor {
    async fn setup(&mut self, log: &dyn LogSink) -> Result<(), ExecutorError> {
        log.append("Initializing agent...".to_string());

        if self.config.api_key.is_none() {
            return Err(ExecutorError::Init(
                ConfigError::MissingEnvVar("OPENAI_API_KEY".to_string()).to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(self.config.request_timeout)
            .build()
            .map_err(|e| ExecutorError::Init(format!("failed to build HTTP client: {e}")))?;

        self.start_tools(log)
            .await
            .map_err(|e| ExecutorError::Init(e.to_string()))?;

        self.client = Some(client);
        self.messages = vec![ChatMessage::system(&self.config.instruction)];

        tracing::info!(job_id = %self.job_id, model = %self.config.model, tools = self.tool_specs.len(), "Chat executor ready");
        log.append(format!("Agent setup complete (model: {}).", self.config.model));
        Ok(())
    }

    async fn execute_step(
        &mut self,
        index: usize,
        step: &str,
        log: &dyn LogSink,
    ) -> Result<String, ExecutorError> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| ExecutorError::step(index, "executor not initialized"))?;

        let checkpoint = self.messages.len();
        self.messages.push(ChatMessage::user(step));

        match self.converse(index, &client, log).await {
            Ok(text) => {
                self.messages.push(ChatMessage::assistant(&text));
                Ok(text)
            }
            Err(cause) => {
                // Keep the conversation consistent for any later step.
                self.messages.truncate(checkpoint);
                Err(ExecutorError::step(index, cause))
            }
        }
    }
}

/// Factory sharing one configuration across all jobs.
pub struct ChatExecutorFactory {
    config: Arc<ExecutorConfig>,
}

impl ChatExecutorFactory {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl ExecutorFactory for ChatExecutorFactory {
    fn create(&self, job_id: JobId) -> Box<dyn StepExecutor> {
        Box::new(ChatExecutor::new(job_id, Arc::clone(&self.config)))
    }
}

fn parse_reply(response: ChatResponse) -> Option<Reply> {
    let message = response.choices.into_iter().next()?.message;
    let content = message
        .content
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    match message.tool_calls {
        Some(calls) if !calls.is_empty() => Some(Reply::ToolCalls { content, calls }),
        _ => content.map(Reply::Text),
    }
}

fn truncate(s: &str, max: usize) -> String {
    let s = s.trim();
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}
