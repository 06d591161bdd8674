//! ReAct 运行器：LLM 输出 JSON 工具调用或直接回复
//!
//! 工具调用格式：`{"tool": "name", "args": {...}, "thought": "..."}`（可包在 ```json 代码块里），
//! 可选的 thought 作为推理摘要事件推送。其余输出即最终回复。
//! 回复以 `{` 或代码块开头时先缓冲再解析，否则按 Token 流式推送文本增量。

use std::sync::Arc;

use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentRunner, RunHandle, RunItem, RunRequest, Transcript};
use crate::core::AgentError;
use crate::llm::{LlmClient, Message};
use crate::stream::RunEvent;
use crate::tools::{Toolbox, TurnContext};

/// 单轮内模型调用次数上限的默认值
pub const DEFAULT_MAX_TURNS: usize = 50;

/// 默认 system prompt；`{tools}` 替换为工具清单 JSON
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a data analysis assistant with access to analytics, search, ads and content tools.\n\
To call a tool, reply with only a JSON object: {\"tool\": \"<name>\", \"args\": {...}, \"thought\": \"<one sentence on why>\"}.\n\
When you have the answer, reply in plain text (Markdown allowed) without JSON.\n\
Ask the user with ask_user only when required information cannot be inferred. \
Call render_chart when a visualization helps.\n\nAvailable tools:\n{tools}";

/// LLM 返回的工具调用
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ToolCall {
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub thought: Option<String>,
}

/// 解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    /// 直接回复用户
    Response(String),
    /// 需要执行工具
    ToolCall(ToolCall),
}

/// 解析 LLM 输出：若含有效 JSON 且 tool 非空则为 ToolCall，否则为 Response
pub fn parse_llm_output(output: &str) -> Result<PlannerOutput, AgentError> {
    let trimmed = output.trim();

    // 提取 JSON 块（```json ... ``` 或纯 JSON）
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            &trimmed[start..=end]
        } else {
            return Ok(PlannerOutput::Response(trimmed.to_string()));
        }
    } else {
        return Ok(PlannerOutput::Response(trimmed.to_string()));
    };

    let parsed: ToolCall = serde_json::from_str(json_str)
        .map_err(|e| AgentError::JsonParseError(format!("{}: {}", e, json_str)))?;

    if parsed.tool.is_empty() {
        Ok(PlannerOutput::Response(trimmed.to_string()))
    } else {
        Ok(PlannerOutput::ToolCall(parsed))
    }
}

/// 回复开头判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyMode {
    Undecided,
    Streaming,
    Buffering,
}

pub struct ReactRunner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    max_turns: usize,
}

impl ReactRunner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_turns: DEFAULT_MAX_TURNS,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }
}

impl AgentRunner for ReactRunner {
    fn run_streamed(&self, request: RunRequest, toolbox: Arc<Toolbox>, ctx: TurnContext) -> RunHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let transcript = Transcript::new(request.initial_transcript());
        let cancel = CancellationToken::new();
        let mut system = self
            .system_prompt
            .replace("{tools}", &toolbox.to_schema_json());
        if let Some(property) = request
            .property_id
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            system.push_str(&property_section(property));
        }

        let run = ReactRun {
            llm: Arc::clone(&self.llm),
            system,
            max_turns: self.max_turns,
            toolbox,
            ctx,
            transcript: transcript.clone(),
            tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(run.drive());
        RunHandle::new(rx, transcript, task, cancel)
    }
}

/// 运行任务持有的状态
struct ReactRun {
    llm: Arc<dyn LlmClient>,
    system: String,
    max_turns: usize,
    toolbox: Arc<Toolbox>,
    ctx: TurnContext,
    transcript: Transcript,
    tx: mpsc::UnboundedSender<RunItem>,
    cancel: CancellationToken,
}

impl ReactRun {
    fn send(&self, event: RunEvent) -> Result<(), AgentError> {
        self.tx.send(Ok(event)).map_err(|_| AgentError::Cancelled)
    }

    async fn drive(self) {
        if let Err(e) = self.react_loop().await {
            if !matches!(e, AgentError::Cancelled) {
                tracing::warn!(turn_id = %self.ctx.turn_id, error = %e, "agent run failed");
            }
            let _ = self.tx.send(Err(e));
        }
    }

    async fn react_loop(&self) -> Result<(), AgentError> {
        self.send(RunEvent::ResponseCreated)?;

        for step in 0..self.max_turns {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            tracing::debug!(turn_id = %self.ctx.turn_id, step, "model call");

            let mut messages = vec![Message::system(self.system.clone())];
            messages.extend(self.transcript.snapshot());
            let (reply, streamed) = self.stream_reply(&messages).await?;

            // 已经按文本增量推送出去的回复就是最终答案，不再当工具调用解析
            if streamed {
                self.transcript.push(Message::assistant(reply.trim().to_string()));
                return Ok(());
            }

            let parsed = match parse_llm_output(&reply) {
                Ok(parsed) => parsed,
                // 代码块开头但不是合法 JSON：当作普通回复
                Err(_) if reply.trim_start().starts_with("```") => {
                    PlannerOutput::Response(reply.trim().to_string())
                }
                Err(e) => {
                    tracing::info!(turn_id = %self.ctx.turn_id, error = %e, "malformed tool call, asking model to retry");
                    self.transcript.push(Message::assistant(reply.clone()));
                    self.transcript.push(Message::user(format!(
                        "Your last reply was not valid JSON ({e}). Reply with a valid tool call object or a plain-text answer."
                    )));
                    continue;
                }
            };

            match parsed {
                PlannerOutput::Response(text) => {
                    if !text.is_empty() {
                        self.send(RunEvent::OutputTextDelta(text.clone()))?;
                    }
                    self.transcript.push(Message::assistant(text));
                    return Ok(());
                }
                PlannerOutput::ToolCall(call) => {
                    self.run_tool(&reply, call).await?;
                }
            }
        }

        Err(AgentError::MaxTurnsExceeded(self.max_turns))
    }

    /// 流式读取一次回复；非 JSON 开头的回复边读边推送文本增量。
    /// 返回完整回复以及是否已经推送过
    async fn stream_reply(&self, messages: &[Message]) -> Result<(String, bool), AgentError> {
        let mut stream = tokio::select! {
            _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
            res = self.llm.complete_stream(messages) => res.map_err(AgentError::LlmError)?,
        };

        let mut buffer = String::new();
        let mut mode = ReplyMode::Undecided;
        loop {
            let token = tokio::select! {
                _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                next = stream.next() => match next {
                    Some(token) => token.map_err(AgentError::LlmError)?,
                    None => break,
                },
            };
            buffer.push_str(&token);

            match mode {
                ReplyMode::Streaming => self.send(RunEvent::OutputTextDelta(token))?,
                ReplyMode::Buffering => {}
                ReplyMode::Undecided => {
                    let head = buffer.trim_start();
                    if head.is_empty() || (head.len() < 3 && "```".starts_with(head)) {
                        continue;
                    }
                    if reply_was_buffered(head) {
                        mode = ReplyMode::Buffering;
                    } else {
                        mode = ReplyMode::Streaming;
                        self.send(RunEvent::OutputTextDelta(head.to_string()))?;
                    }
                }
            }
        }

        // 整个回复都没凑够判定长度（例如只有 "`"）
        if mode == ReplyMode::Undecided && !buffer.trim().is_empty() && !reply_was_buffered(&buffer) {
            self.send(RunEvent::OutputTextDelta(buffer.trim_start().to_string()))?;
            mode = ReplyMode::Streaming;
        }
        Ok((buffer, mode == ReplyMode::Streaming))
    }

    async fn run_tool(&self, reply: &str, call: ToolCall) -> Result<(), AgentError> {
        if let Some(thought) = call.thought.as_ref().filter(|t| !t.trim().is_empty()) {
            self.send(RunEvent::ReasoningItem {
                summary: vec![thought.clone()],
            })?;
        }

        let call_id = format!("call_{}", uuid::Uuid::new_v4().simple());
        let args = match call.args {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        self.send(RunEvent::ToolCallItem {
            call_id: call_id.clone(),
            name: call.tool.clone(),
            arguments: args.to_string(),
        })?;

        let output = self.toolbox.execute(&self.ctx, &call.tool, args).await;

        self.send(RunEvent::ToolCallOutputItem {
            call_id,
            output: output.clone(),
        })?;
        self.transcript.push(Message::assistant(reply.trim().to_string()));
        self.transcript.push(Message::user(format!(
            "Observation from {}:\n{}",
            call.tool, output
        )));
        Ok(())
    }
}

/// 本轮目标属性，追加在 system prompt 末尾
fn property_section(property_id: &str) -> String {
    format!(
        "\n\n## Target property\nAnalytics property_id: {property_id}\n\
Use this property for analytics tools unless the user names a different one."
    )
}

fn reply_was_buffered(text: &str) -> bool {
    let head = text.trim_start();
    head.starts_with('{') || head.starts_with("```")
}
