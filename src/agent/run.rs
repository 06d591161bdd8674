//! 模型运行抽象：AgentRunner 启动一次流式运行，返回 RunHandle
//!
//! 运行本身在独立任务里执行（工具调用也在该任务内完成）；原生事件经无界通道交给流泵任务。
//! RunHandle 持有事件接收端、累计的对话记录（下一轮的上下文快照）与取消/回收入口。

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::Message;
use crate::stream::RunEvent;
use crate::tools::{Toolbox, TurnContext};

/// 原生事件通道元素：`Err` 表示运行失败，之后不会再有事件
pub type RunItem = Result<RunEvent, AgentError>;

/// 单轮输入
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub message: String,
    /// 纯文本历史（无上下文快照时使用）
    pub history: Vec<Message>,
    /// 上一轮保存的完整上下文快照，优先于 history
    pub context_items: Option<Vec<Value>>,
    /// 本轮针对的分析属性，写入 system prompt
    pub property_id: Option<String>,
}

impl RunRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_property(mut self, property_id: impl Into<String>) -> Self {
        self.property_id = Some(property_id.into());
        self
    }

    /// 组装本轮初始记录：快照优先，否则历史；最后追加本轮用户消息
    pub fn initial_transcript(&self) -> Vec<Message> {
        let mut transcript: Vec<Message> = match &self.context_items {
            Some(items) if !items.is_empty() => items
                .iter()
                .filter_map(|item| match serde_json::from_value::<Message>(item.clone()) {
                    Ok(message) => Some(message),
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping unreadable context item");
                        None
                    }
                })
                .collect(),
            _ => self.history.clone(),
        };
        transcript.push(Message::user(self.message.clone()));
        transcript
    }
}

/// 运行中的对话记录（运行任务写，驱动方读）
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    inner: Arc<Mutex<Vec<Message>>>,
}

impl Transcript {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(messages)),
        }
    }

    pub fn push(&self, message: Message) {
        if let Ok(mut messages) = self.inner.lock() {
            messages.push(message);
        }
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.inner.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// 序列化为上下文快照项
    pub fn to_items(&self) -> Vec<Value> {
        self.snapshot()
            .iter()
            .filter_map(|m| serde_json::to_value(m).ok())
            .collect()
    }
}

/// 一次流式运行的句柄
pub struct RunHandle {
    events: Option<mpsc::UnboundedReceiver<RunItem>>,
    transcript: Transcript,
    task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl RunHandle {
    pub fn new(
        events: mpsc::UnboundedReceiver<RunItem>,
        transcript: Transcript,
        task: JoinHandle<()>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            events: Some(events),
            transcript,
            task: Some(task),
            cancel,
        }
    }

    /// 取走原生事件接收端（交给流泵任务）；只能取一次
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<RunItem>> {
        self.events.take()
    }

    /// 当前累计的对话记录（快照项形式）
    pub fn input_list(&self) -> Vec<Value> {
        self.transcript.to_items()
    }

    /// 取消运行任务并等待其退出；可重复调用
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if !task.is_finished() {
                task.abort();
            }
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "agent run task panicked");
                }
            }
        }
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// 模型运行器
pub trait AgentRunner: Send + Sync {
    /// 启动一次流式运行；工具调用通过 toolbox 执行，带外事件通过 ctx 推送
    fn run_streamed(&self, request: RunRequest, toolbox: Arc<Toolbox>, ctx: TurnContext) -> RunHandle;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;

    #[test]
    fn test_context_items_take_precedence_over_history() {
        let request = RunRequest {
            message: "and last week?".into(),
            history: vec![Message::user("ignored")],
            context_items: Some(vec![
                serde_json::json!({"role": "user", "content": "sessions yesterday?"}),
                serde_json::json!({"role": "assistant", "content": "120"}),
                serde_json::json!({"bogus": true}),
            ]),
            ..Default::default()
        };
        let transcript = request.initial_transcript();
        assert_eq!(transcript.len(), 3);
        assert_eq!(transcript[1], Message::assistant("120"));
        assert_eq!(transcript[2], Message::user("and last week?"));
    }

    #[test]
    fn test_history_used_without_context_items() {
        let request = RunRequest {
            message: "hi".into(),
            history: vec![Message::assistant("earlier")],
            context_items: Some(vec![]),
            ..Default::default()
        };
        let transcript = request.initial_transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].role, Role::Assistant);
    }

    #[test]
    fn test_transcript_items_roundtrip_into_next_turn() {
        let transcript = Transcript::new(vec![Message::user("q")]);
        transcript.push(Message::assistant("a"));
        let next = RunRequest {
            message: "q2".into(),
            history: vec![],
            context_items: Some(transcript.to_items()),
            ..Default::default()
        };
        assert_eq!(next.initial_transcript().len(), 3);
    }
}
