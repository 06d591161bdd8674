//! 对话存储接口（不透明的键值读写）
//!
//! 每条对话记录保存消息列表与最近一轮的上下文快照；下一轮优先用快照恢复完整上下文。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::agent::RunRequest;
use crate::llm::{Message, Role};

/// 助手发起的一次工具调用（仅用于展示与审计）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

/// 用户对一个问题组的回答
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AskUserAnswer {
    pub group_id: String,
    pub responses: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub answers: Vec<AskUserAnswer>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            answers: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationRecord {
    pub id: String,
    pub owner: String,
    pub messages: Vec<StoredMessage>,
    /// 最近一轮结束时的上下文快照
    #[serde(default)]
    pub context_items: Option<Vec<Value>>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationRecord {
    pub fn new(id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            messages: Vec::new(),
            context_items: None,
            updated_at: Utc::now(),
        }
    }

    /// 纯文本历史（无快照时的回退）
    pub fn history(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| !m.content.is_empty())
            .map(|m| Message {
                role: m.role,
                content: m.content.clone(),
            })
            .collect()
    }

    /// 组装下一轮输入：快照 + 历史都带上，由 RunRequest 决定优先级
    pub fn to_run_request(&self, message: impl Into<String>) -> RunRequest {
        RunRequest {
            message: message.into(),
            history: self.history(),
            context_items: self.context_items.clone(),
            property_id: None,
        }
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(&self, conversation_id: &str) -> anyhow::Result<Option<ConversationRecord>>;

    async fn save(&self, record: ConversationRecord) -> anyhow::Result<()>;
}

/// 进程内存储（测试 / 命令行使用）
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    records: RwLock<HashMap<String, ConversationRecord>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self, conversation_id: &str) -> anyhow::Result<Option<ConversationRecord>> {
        Ok(self.records.read().await.get(conversation_id).cloned())
    }

    async fn save(&self, mut record: ConversationRecord) -> anyhow::Result<()> {
        record.updated_at = Utc::now();
        self.records.write().await.insert(record.id.clone(), record);
        Ok(())
    }
}
