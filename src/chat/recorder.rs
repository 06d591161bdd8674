//! 调用方一侧的事件记录器
//!
//! 拦截内部变体（上下文快照、问题组回答），累计文本增量与工具调用；
//! 收到 `done` 时写入对话记录并把 conversation_id 写到 done 事件上。只返回可对外转发的事件。

use std::sync::Arc;

use serde_json::Value;

use crate::chat::{AskUserAnswer, ConversationRecord, ConversationStore, StoredMessage, ToolCallRecord};
use crate::llm::Role;
use crate::stream::StreamEvent;

pub struct TurnRecorder {
    store: Arc<dyn ConversationStore>,
    owner: String,
    conversation_id: String,
    user_message: String,
    reply: String,
    tool_calls: Vec<ToolCallRecord>,
    answers: Vec<AskUserAnswer>,
    context_items: Option<Vec<Value>>,
    persisted: bool,
}

impl TurnRecorder {
    /// 未给出 conversation_id 时新建一个
    pub fn new(
        store: Arc<dyn ConversationStore>,
        owner: impl Into<String>,
        conversation_id: Option<String>,
        user_message: impl Into<String>,
    ) -> Self {
        Self {
            store,
            owner: owner.into(),
            conversation_id: conversation_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            user_message: user_message.into(),
            reply: String::new(),
            tool_calls: Vec::new(),
            answers: Vec::new(),
            context_items: None,
            persisted: false,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// 目前累计的回复文本
    pub fn reply(&self) -> &str {
        &self.reply
    }

    /// 处理一个事件；内部变体返回 None
    pub async fn observe(&mut self, event: StreamEvent) -> Option<StreamEvent> {
        match event {
            StreamEvent::ContextItems { items } => {
                self.context_items = Some(items);
                None
            }
            StreamEvent::AskUserResponses {
                group_id,
                responses,
            } => {
                self.answers.push(AskUserAnswer {
                    group_id,
                    responses,
                });
                None
            }
            StreamEvent::TextDelta { content } => {
                self.reply.push_str(&content);
                Some(StreamEvent::TextDelta { content })
            }
            StreamEvent::ToolCall {
                call_id,
                name,
                arguments,
            } => {
                self.tool_calls.push(ToolCallRecord {
                    call_id: call_id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                });
                Some(StreamEvent::ToolCall {
                    call_id,
                    name,
                    arguments,
                })
            }
            StreamEvent::Done { .. } => {
                self.persist().await;
                Some(StreamEvent::Done {
                    conversation_id: Some(self.conversation_id.clone()),
                })
            }
            other => Some(other),
        }
    }

    async fn persist(&mut self) {
        if self.persisted {
            return;
        }
        self.persisted = true;

        let mut record = match self.store.load(&self.conversation_id).await {
            Ok(Some(record)) => record,
            Ok(None) => ConversationRecord::new(self.conversation_id.clone(), self.owner.clone()),
            Err(e) => {
                tracing::warn!(conversation_id = %self.conversation_id, error = %e, "failed to load conversation, starting fresh");
                ConversationRecord::new(self.conversation_id.clone(), self.owner.clone())
            }
        };

        record
            .messages
            .push(StoredMessage::new(Role::User, self.user_message.clone()));
        // 没有回复文本（如启动失败）时不记 assistant 消息
        if !self.reply.is_empty() {
            let mut assistant = StoredMessage::new(Role::Assistant, self.reply.clone());
            assistant.tool_calls = std::mem::take(&mut self.tool_calls);
            assistant.answers = std::mem::take(&mut self.answers);
            record.messages.push(assistant);
        }
        // 本轮没有快照（如启动失败）时保留上一轮的
        if let Some(items) = self.context_items.take() {
            record.context_items = Some(items);
        }

        if let Err(e) = self.store.save(record).await {
            tracing::warn!(conversation_id = %self.conversation_id, error = %e, "failed to save conversation");
        } else {
            tracing::debug!(conversation_id = %self.conversation_id, "conversation saved");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::chat::InMemoryConversationStore;

    #[tokio::test]
    async fn test_internal_events_are_swallowed_and_persisted() {
        let store = Arc::new(InMemoryConversationStore::new());
        let mut recorder = TurnRecorder::new(store.clone(), "user-1", None, "sessions?");

        let forwarded = vec![
            StreamEvent::ResponseCreated,
            StreamEvent::ToolCall {
                call_id: "call_1".into(),
                name: "run_report".into(),
                arguments: "{}".into(),
            },
            StreamEvent::AskUserResponses {
                group_id: "g1".into(),
                responses: HashMap::from([("a".to_string(), "yes".to_string())]),
            },
            StreamEvent::text_delta("Sessions "),
            StreamEvent::text_delta("were 10."),
            StreamEvent::ContextItems {
                items: vec![serde_json::json!({"role": "user", "content": "sessions?"})],
            },
            StreamEvent::done(),
        ];
        let mut out = Vec::new();
        for event in forwarded {
            if let Some(event) = recorder.observe(event).await {
                out.push(event);
            }
        }

        assert_eq!(out.len(), 5);
        assert!(out.iter().all(|e| !e.is_internal()));
        let id = recorder.conversation_id().to_string();
        assert_eq!(
            out.last(),
            Some(&StreamEvent::Done {
                conversation_id: Some(id.clone())
            })
        );

        let record = store.load(&id).await.unwrap().unwrap();
        assert_eq!(record.messages.len(), 2);
        assert_eq!(record.messages[1].content, "Sessions were 10.");
        assert_eq!(record.messages[1].tool_calls.len(), 1);
        assert_eq!(record.messages[1].answers[0].group_id, "g1");
        assert_eq!(record.context_items.as_ref().map(|i| i.len()), Some(1));
    }

    #[tokio::test]
    async fn test_existing_conversation_is_extended() {
        let store = Arc::new(InMemoryConversationStore::new());
        let mut first = TurnRecorder::new(store.clone(), "user-1", Some("c1".into()), "one");
        first.observe(StreamEvent::text_delta("1")).await;
        first.observe(StreamEvent::done()).await;

        let mut second = TurnRecorder::new(store.clone(), "user-1", Some("c1".into()), "two");
        second.observe(StreamEvent::done()).await;

        let record = store.load("c1").await.unwrap().unwrap();
        assert_eq!(record.messages.len(), 3);
        assert_eq!(record.history().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_turn_stores_only_user_message() {
        let store = Arc::new(InMemoryConversationStore::new());
        let mut recorder = TurnRecorder::new(store.clone(), "user-1", None, "hi");
        recorder
            .observe(StreamEvent::Error {
                message: "credential write failed".into(),
            })
            .await;
        recorder.observe(StreamEvent::done()).await;

        let record = store.load(recorder.conversation_id()).await.unwrap().unwrap();
        assert_eq!(record.messages.len(), 1);
        assert_eq!(record.messages[0].role, Role::User);
        assert_eq!(record.messages[0].content, "hi");
    }
}
