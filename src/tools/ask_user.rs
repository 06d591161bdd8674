//! ask_user 工具：向用户展示结构化问题组，挂起等待一次性提交的全部回答
//!
//! 参数 `questions` 可以是 JSON 数组字符串，也可以直接是数组。流程：
//! 建组 → 推送 `ask_user` 事件 → 有界等待 → 清理 → 推送内部 `_ask_user_responses` → 返回逐行文本。
//! 超时不是错误：返回固定说明，由模型自行决定如何继续。

use std::collections::HashMap;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::ask_user::{AskUserStore, Question, WaitOutcome};
use crate::stream::StreamEvent;
use crate::tools::{Tool, TurnContext};

/// 超时返回给模型的文本
pub const ASK_USER_TIMEOUT_REPLY: &str = "(no response from the user: timed out)";

const SKIPPED_ANSWER: &str = "(skipped, use your best judgment)";

#[allow(dead_code)]
#[derive(Deserialize, JsonSchema)]
struct AskUserArgs {
    /// JSON array of questions. Each item: {"id": "unique id", "question": "short prompt",
    /// "type": "choice|text|confirm", "options": ["..."]}. "choice" requires options.
    questions: Value,
}

pub struct AskUserTool;

#[async_trait]
impl Tool for AskUserTool {
    fn name(&self) -> &str {
        "ask_user"
    }

    fn description(&self) -> &str {
        "Ask the user 2-5 structured questions at once and wait for their answers. \
         Use only when required information is missing and cannot be inferred."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::to_value(schemars::schema_for!(AskUserArgs))
            .unwrap_or_else(|_| serde_json::json!({"type": "object"}))
    }

    async fn execute(&self, ctx: &TurnContext, args: Value) -> Result<String, String> {
        let questions = match parse_questions(&args) {
            Ok(questions) => questions,
            Err(reason) => return Ok(reason),
        };

        let group = ctx.ask_user.create_group(questions);
        let group_id = group.group_id.clone();
        let questions = group.questions.clone();
        // 运行任务被中止时也要把组移出注册表
        let _cleanup = CleanupOnDrop {
            store: &ctx.ask_user,
            group_id: group_id.clone(),
        };

        ctx.emit(StreamEvent::AskUser {
            group_id: group_id.clone(),
            questions: questions.clone(),
        });

        let outcome = ctx
            .ask_user
            .await_or_timeout(group, ctx.ask_user_timeout)
            .await;
        ctx.ask_user.cleanup(&group_id);

        let responses = match outcome {
            WaitOutcome::Answered(responses) => responses,
            WaitOutcome::TimedOut | WaitOutcome::Discarded => {
                tracing::info!(turn_id = %ctx.turn_id, group_id = %group_id, "no answer for question group");
                return Ok(ASK_USER_TIMEOUT_REPLY.to_string());
            }
        };

        ctx.emit(StreamEvent::AskUserResponses {
            group_id,
            responses: responses.clone(),
        });

        Ok(format_answers(&questions, &responses))
    }
}

struct CleanupOnDrop<'a> {
    store: &'a AskUserStore,
    group_id: String,
}

impl Drop for CleanupOnDrop<'_> {
    fn drop(&mut self) {
        self.store.cleanup(&self.group_id);
    }
}

fn parse_questions(args: &Value) -> Result<Vec<Question>, String> {
    let raw = match args.get("questions") {
        Some(Value::String(text)) => serde_json::from_str::<Value>(text)
            .map_err(|_| "(could not parse the questions JSON)".to_string())?,
        Some(value) => value.clone(),
        None => return Err("(invalid questions: missing 'questions')".to_string()),
    };
    let questions: Vec<Question> = serde_json::from_value(raw)
        .map_err(|_| "(invalid questions: expected a non-empty JSON array)".to_string())?;
    if questions.is_empty() {
        return Err("(invalid questions: expected a non-empty JSON array)".to_string());
    }
    Ok(questions)
}

fn format_answers(questions: &[Question], responses: &HashMap<String, String>) -> String {
    questions
        .iter()
        .map(|q| {
            let answer = responses.get(&q.id).map(|a| a.trim()).unwrap_or_default();
            if answer.is_empty() {
                format!("- {}: {}", q.question, SKIPPED_ANSWER)
            } else {
                format!("- {}: {}", q.question, answer)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::stream::{event_queue, QueueItem};

    fn context(timeout: Duration) -> (TurnContext, tokio::sync::mpsc::UnboundedReceiver<QueueItem>) {
        let (emitter, rx) = event_queue();
        let ctx = TurnContext {
            turn_id: "turn-1".into(),
            conversation_id: None,
            emitter,
            ask_user: Arc::new(AskUserStore::new()),
            ask_user_timeout: timeout,
        };
        (ctx, rx)
    }

    #[tokio::test]
    async fn test_malformed_input_is_textual_result() {
        let (ctx, mut rx) = context(Duration::from_secs(1));
        let tool = AskUserTool;
        let out = tool
            .execute(&ctx, serde_json::json!({"questions": "not json"}))
            .await
            .unwrap();
        assert_eq!(out, "(could not parse the questions JSON)");
        let out = tool
            .execute(&ctx, serde_json::json!({"questions": "[]"}))
            .await
            .unwrap();
        assert!(out.starts_with("(invalid questions"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_answers_flow_back_as_lines() {
        let (ctx, mut rx) = context(Duration::from_secs(5));
        let store = Arc::clone(&ctx.ask_user);
        let args = serde_json::json!({
            "questions": r#"[{"id":"kpi","question":"Main KPI?","type":"choice","options":["Leads","Sales"]},{"id":"pain","question":"Biggest issue?","type":"text"}]"#
        });

        let task = tokio::spawn(async move { AskUserTool.execute(&ctx, args).await });

        let group_id = match rx.recv().await {
            Some(QueueItem::Event(StreamEvent::AskUser { group_id, questions })) => {
                assert_eq!(questions.len(), 2);
                group_id
            }
            other => panic!("expected ask_user event, got {other:?}"),
        };
        assert!(store.submit_responses(
            &group_id,
            HashMap::from([("kpi".to_string(), " Leads ".to_string())])
        ));

        let out = task.await.unwrap().unwrap();
        assert_eq!(
            out,
            "- Main KPI?: Leads\n- Biggest issue?: (skipped, use your best judgment)"
        );
        assert!(matches!(
            rx.recv().await,
            Some(QueueItem::Event(StreamEvent::AskUserResponses { .. }))
        ));
        assert!(!store.contains(&group_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_degrades_and_cleans_up() {
        let (ctx, mut rx) = context(Duration::from_secs(300));
        let store = Arc::clone(&ctx.ask_user);
        let out = AskUserTool
            .execute(
                &ctx,
                serde_json::json!({"questions": [{"id": "a", "type": "confirm"}]}),
            )
            .await
            .unwrap();
        assert_eq!(out, ASK_USER_TIMEOUT_REPLY);
        assert_eq!(store.pending_count(), 0);

        let group_id = match rx.recv().await {
            Some(QueueItem::Event(StreamEvent::AskUser { group_id, .. })) => group_id,
            other => panic!("expected ask_user event, got {other:?}"),
        };
        assert!(!store.contains(&group_id));
        assert!(rx.try_recv().is_err());
    }
}
