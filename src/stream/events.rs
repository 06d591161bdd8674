//! 流事件：模型运行的原生事件，以及对外推送的类型化事件（NDJSON 一行一个）
//!
//! `type` 为判别字段；以 `_` 开头的两个变体只在服务端内部流转，永远不会写到线上。

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::ask_user::Question;

/// 无推理摘要时的占位文本
pub const REASONING_PLACEHOLDER: &str = "Analyzing...";

/// 模型运行产生的原生事件（由 AgentRunner 产出，泵任务翻译为 StreamEvent）
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    ResponseCreated,
    OutputTextDelta(String),
    ToolCallItem {
        call_id: String,
        name: String,
        arguments: String,
    },
    ToolCallOutputItem {
        call_id: String,
        output: String,
    },
    ReasoningItem {
        summary: Vec<String>,
    },
    /// 其余原生事件，不对外转发
    Other,
}

/// 对外推送的事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ResponseCreated,
    /// 回复文本增量
    TextDelta { content: String },
    ToolCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    /// 工具结果预览（已截断）
    ToolResult { call_id: String, output: String },
    Reasoning {
        content: String,
        has_summary: bool,
        /// 待翻译标记：消费端翻译完成后清除
        #[serde(skip)]
        needs_translation: bool,
    },
    Chart { spec: Value },
    AskUser {
        group_id: String,
        questions: Vec<Question>,
    },
    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
    },
    Error { message: String },
    /// 本轮结束时的完整上下文快照（内部）
    #[serde(rename = "_context_items")]
    ContextItems { items: Vec<Value> },
    /// 用户对问题组的回答回显（内部）
    #[serde(rename = "_ask_user_responses")]
    AskUserResponses {
        group_id: String,
        responses: HashMap<String, String>,
    },
}

impl StreamEvent {
    pub fn text_delta(content: impl Into<String>) -> Self {
        StreamEvent::TextDelta {
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
        }
    }

    pub fn done() -> Self {
        StreamEvent::Done {
            conversation_id: None,
        }
    }

    /// 线上判别名（日志用）
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::ResponseCreated => "response_created",
            StreamEvent::TextDelta { .. } => "text_delta",
            StreamEvent::ToolCall { .. } => "tool_call",
            StreamEvent::ToolResult { .. } => "tool_result",
            StreamEvent::Reasoning { .. } => "reasoning",
            StreamEvent::Chart { .. } => "chart",
            StreamEvent::AskUser { .. } => "ask_user",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
            StreamEvent::ContextItems { .. } => "_context_items",
            StreamEvent::AskUserResponses { .. } => "_ask_user_responses",
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            StreamEvent::ContextItems { .. } | StreamEvent::AskUserResponses { .. }
        )
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StreamEvent::Done { .. })
    }

    pub fn needs_translation(&self) -> bool {
        matches!(
            self,
            StreamEvent::Reasoning {
                needs_translation: true,
                ..
            }
        )
    }

    /// 序列化为一行 NDJSON（含换行）；内部变体返回 None
    pub fn to_wire_line(&self) -> Option<String> {
        if self.is_internal() {
            return None;
        }
        let mut line = serde_json::to_string(self).ok()?;
        line.push('\n');
        Some(line)
    }
}

/// 原生事件 → 对外事件；空文本增量与无关事件返回 None
///
/// `tool_result.output` 截断到 `preview_chars` 个字符；推理摘要以单个空格拼接，
/// 没有摘要文本时用占位文本且不需要翻译。
pub fn translate_run_event(event: RunEvent, preview_chars: usize) -> Option<StreamEvent> {
    match event {
        RunEvent::ResponseCreated => Some(StreamEvent::ResponseCreated),
        RunEvent::OutputTextDelta(text) if text.is_empty() => None,
        RunEvent::OutputTextDelta(text) => Some(StreamEvent::TextDelta { content: text }),
        RunEvent::ToolCallItem {
            call_id,
            name,
            arguments,
        } => Some(StreamEvent::ToolCall {
            call_id,
            name,
            arguments,
        }),
        RunEvent::ToolCallOutputItem { call_id, output } => Some(StreamEvent::ToolResult {
            call_id,
            output: output.chars().take(preview_chars).collect(),
        }),
        RunEvent::ReasoningItem { summary } => {
            let parts: Vec<&str> = summary
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .collect();
            if parts.is_empty() {
                Some(StreamEvent::Reasoning {
                    content: REASONING_PLACEHOLDER.to_string(),
                    has_summary: false,
                    needs_translation: false,
                })
            } else {
                Some(StreamEvent::Reasoning {
                    content: parts.join(" "),
                    has_summary: true,
                    needs_translation: true,
                })
            }
        }
        RunEvent::Other => None,
    }
}
