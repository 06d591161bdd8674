//! 脚本化 LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预先登记的回复；流式时按空格切成若干 Token。脚本用尽后回复固定文本。
//! 每次调用收到的消息都会被记录，便于断言上下文组装。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{LlmClient, Message, TokenStream};

/// 脚本用尽后的回复
pub const SCRIPT_EXHAUSTED_REPLY: &str = "(script exhausted)";

enum Step {
    Reply(String),
    Fail(String),
}

#[derive(Default)]
pub struct ScriptedLlmClient {
    steps: Mutex<VecDeque<Step>>,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::default();
        for reply in replies {
            client.push_reply(reply);
        }
        client
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push_back(Step::Reply(reply.into()));
        }
    }

    /// 下一次调用返回错误
    pub fn push_failure(&self, message: impl Into<String>) {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push_back(Step::Fail(message.into()));
        }
    }

    /// 每次调用收到的完整消息列表
    pub fn seen_messages(&self) -> Vec<Vec<Message>> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn next(&self, messages: &[Message]) -> Result<String, String> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(messages.to_vec());
        }
        let step = self.steps.lock().ok().and_then(|mut s| s.pop_front());
        match step {
            Some(Step::Reply(text)) => Ok(text),
            Some(Step::Fail(message)) => Err(message),
            None => Ok(SCRIPT_EXHAUSTED_REPLY.to_string()),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        self.next(messages)
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, String> {
        let content = self.next(messages)?;
        let tokens: Vec<Result<String, String>> = content
            .split_inclusive(' ')
            .map(|t| Ok(t.to_string()))
            .collect();
        Ok(Box::pin(stream::iter(tokens)))
    }
}
