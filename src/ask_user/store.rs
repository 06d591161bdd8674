//! 问题组注册表
//!
//! 进程级共享状态（由调用方显式注入 `Arc<AskUserStore>`，测试可各自构造独立实例）。
//! 每个问题组持有一次性完成信号（oneshot）：提交时在同一把锁内完成「检查 + 记录 + 触发」，
//! 先到者生效；重复提交、未知 id、已清理的 id 都返回 false，不会让任何一方出错。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// 等待回答的默认超时（秒级 300）
pub const DEFAULT_ASK_USER_TIMEOUT: Duration = Duration::from_secs(300);

/// 问题类型：单选 / 自由文本 / 是否确认
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum QuestionType {
    Choice,
    #[default]
    #[serde(alias = "free_text", alias = "free-text")]
    Text,
    Confirm,
}

/// 单个问题
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Question {
    /// 组内唯一 id（回答按此 id 对应）
    pub id: String,
    /// 问题文本（短句）
    #[serde(default)]
    pub question: String,
    #[serde(rename = "type", default)]
    pub question_type: QuestionType,
    /// choice 类型的候选项
    #[serde(default)]
    pub options: Vec<String>,
}

/// 调用方持有的问题组句柄（含接收端，等待完成用）
#[derive(Debug)]
pub struct QuestionGroup {
    pub group_id: String,
    pub questions: Vec<Question>,
    receiver: oneshot::Receiver<HashMap<String, String>>,
}

/// 等待结果
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// 收到回答（可能为空：所有问题均可跳过）
    Answered(HashMap<String, String>),
    /// 超时未答
    TimedOut,
    /// 组在完成前被清理
    Discarded,
}

struct PendingGroup {
    sender: Option<oneshot::Sender<HashMap<String, String>>>,
    responses: Option<HashMap<String, String>>,
}

/// 问题组注册表
#[derive(Default)]
pub struct AskUserStore {
    groups: Mutex<HashMap<String, PendingGroup>>,
}

impl AskUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingGroup>> {
        self.groups.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 分配新的 group id 与完成信号，登记到注册表
    pub fn create_group(&self, questions: Vec<Question>) -> QuestionGroup {
        let group_id = uuid::Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        self.lock().insert(
            group_id.clone(),
            PendingGroup {
                sender: Some(sender),
                responses: None,
            },
        );
        tracing::debug!(group_id = %group_id, questions = questions.len(), "question group created");
        QuestionGroup {
            group_id,
            questions,
            receiver,
        }
    }

    /// 提交回答；组存在且尚未完成时记录并触发信号，返回 true
    pub fn submit_responses(&self, group_id: &str, responses: HashMap<String, String>) -> bool {
        let mut groups = self.lock();
        let Some(group) = groups.get_mut(group_id) else {
            return false;
        };
        let Some(sender) = group.sender.take() else {
            return false;
        };
        group.responses = Some(responses.clone());
        if sender.send(responses).is_err() {
            // 等待方已离开（本轮被取消），没人会再消费这个组
            groups.remove(group_id);
            return false;
        }
        tracing::info!(group_id = group_id, "question group answered");
        true
    }

    /// 挂起直到完成信号触发或超时；超时后由调用方负责 cleanup
    pub async fn await_or_timeout(&self, group: QuestionGroup, timeout: Duration) -> WaitOutcome {
        match tokio::time::timeout(timeout, group.receiver).await {
            Ok(Ok(responses)) => WaitOutcome::Answered(responses),
            Ok(Err(_)) => WaitOutcome::Discarded,
            Err(_) => {
                tracing::info!(group_id = %group.group_id, "question group timed out");
                WaitOutcome::TimedOut
            }
        }
    }

    /// 无条件移除；可重复调用
    pub fn cleanup(&self, group_id: &str) {
        self.lock().remove(group_id);
    }

    pub fn contains(&self, group_id: &str) -> bool {
        self.lock().contains_key(group_id)
    }

    /// 已记录的回答（完成后、清理前可见）
    pub fn responses(&self, group_id: &str) -> Option<HashMap<String, String>> {
        self.lock().get(group_id).and_then(|g| g.responses.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.lock().values().filter(|g| g.sender.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn confirm_question() -> Vec<Question> {
        serde_json::from_str(r#"[{"id":"a","type":"confirm"}]"#).unwrap()
    }

    #[test]
    fn test_question_deserialize_defaults() {
        let qs: Vec<Question> = serde_json::from_str(
            r#"[{"id":"kpi","question":"Main KPI?","type":"choice","options":["Leads","Sales"]},{"id":"c"}]"#,
        )
        .unwrap();
        assert_eq!(qs[0].question_type, QuestionType::Choice);
        assert_eq!(qs[0].options, vec!["Leads", "Sales"]);
        assert_eq!(qs[1].question_type, QuestionType::Text);
        assert!(qs[1].question.is_empty());
    }

    #[tokio::test]
    async fn test_empty_answers_still_complete_group() {
        let store = AskUserStore::new();
        let group = store.create_group(confirm_question());
        let id = group.group_id.clone();

        assert!(store.submit_responses(&id, HashMap::new()));
        let outcome = store.await_or_timeout(group, Duration::from_secs(1)).await;
        assert_eq!(outcome, WaitOutcome::Answered(HashMap::new()));
        assert_eq!(store.responses(&id), Some(HashMap::new()));
    }

    #[tokio::test]
    async fn test_second_submission_returns_false() {
        let store = AskUserStore::new();
        let group = store.create_group(confirm_question());
        let id = group.group_id.clone();

        let answers = HashMap::from([("a".to_string(), "yes".to_string())]);
        assert!(store.submit_responses(&id, answers.clone()));
        assert!(!store.submit_responses(&id, answers));
        assert!(!store.submit_responses("unknown-group", HashMap::new()));
        drop(group);
    }

    #[tokio::test]
    async fn test_submit_after_cleanup_is_noop() {
        let store = AskUserStore::new();
        let group = store.create_group(confirm_question());
        let id = group.group_id.clone();
        store.cleanup(&id);
        store.cleanup(&id);
        assert!(!store.submit_responses(&id, HashMap::new()));
        let outcome = store.await_or_timeout(group, Duration::from_secs(1)).await;
        assert_eq!(outcome, WaitOutcome::Discarded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_cleanup_leaves_registry_empty() {
        let store = AskUserStore::new();
        let group = store.create_group(confirm_question());
        let id = group.group_id.clone();

        let outcome = store.await_or_timeout(group, DEFAULT_ASK_USER_TIMEOUT).await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        store.cleanup(&id);
        assert!(!store.contains(&id));
        assert!(!store.submit_responses(&id, HashMap::new()));
    }

    #[tokio::test]
    async fn test_concurrent_submissions_single_winner() {
        let store = Arc::new(AskUserStore::new());
        let group = store.create_group(confirm_question());
        let id = group.group_id.clone();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store.submit_responses(&id, HashMap::from([("a".to_string(), i.to_string())]))
            }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert!(matches!(
            store.await_or_timeout(group, Duration::from_secs(1)).await,
            WaitOutcome::Answered(_)
        ));
    }

    #[tokio::test]
    async fn test_waiter_gone_makes_submission_fail() {
        let store = AskUserStore::new();
        let group = store.create_group(confirm_question());
        let id = group.group_id.clone();
        drop(group);
        assert!(!store.submit_responses(&id, HashMap::new()));
        assert!(!store.contains(&id));
    }
}
