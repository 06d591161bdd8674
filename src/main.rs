//! tapline 命令行：跑一轮对话
//!
//! 用法：`tapline <message>`。事件以 NDJSON 写到 stdout；遇到 ask_user 时在 stderr 提示并从 stdin 逐题读回答。
//! 环境变量：TAPLINE_CONFIG（额外配置文件）、TAPLINE_OWNER（默认 cli）、TAPLINE_REFRESH_TOKEN、
//! TAPLINE_PROPERTY_ID（本轮针对的分析属性）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};

use tapline::agent::RunRequest;
use tapline::ask_user::{Question, QuestionType};
use tapline::chat::{InMemoryConversationStore, TurnRecorder};
use tapline::config::load_config;
use tapline::core::{
    engine_materializer, secret_from_config, CredentialCleanup, EngineBuilder, ShutdownCoordinator,
    ShutdownManager, SweeperCleanup,
};
use tapline::observability;
use tapline::stream::{StreamEvent, TurnRequest};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let message = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if message.trim().is_empty() {
        anyhow::bail!("usage: tapline <message>");
    }

    let config_path = std::env::var("TAPLINE_CONFIG").ok().map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;
    let engine = EngineBuilder::new(config.clone()).build();

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let sweeper_token = shutdown.token().child_token();
    let sweeper = engine
        .sessions()
        .spawn_sweeper(config.sweep_interval(), sweeper_token.clone());
    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown));
    coordinator.register(SweeperCleanup::new(sweeper_token, sweeper));
    coordinator.register(CredentialCleanup::new(engine_materializer(&engine)));

    let owner = std::env::var("TAPLINE_OWNER").unwrap_or_else(|_| "cli".to_string());
    let refresh_token = std::env::var("TAPLINE_REFRESH_TOKEN").unwrap_or_default();
    let mut run = RunRequest::new(message.clone());
    run.property_id = std::env::var("TAPLINE_PROPERTY_ID")
        .ok()
        .filter(|p| !p.trim().is_empty());

    let store = Arc::new(InMemoryConversationStore::new());
    let mut recorder = TurnRecorder::new(store, owner.clone(), None, message.clone());
    let mut stream = engine.start_turn(TurnRequest {
        owner,
        secret: secret_from_config(&config, refresh_token),
        run,
        conversation_id: Some(recorder.conversation_id().to_string()),
    });

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        let event = tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            event = stream.next() => event,
        };
        let Some(event) = event else { break };
        let Some(event) = recorder.observe(event).await else {
            continue;
        };

        if let Some(line) = event.to_wire_line() {
            stdout.write_all(line.as_bytes()).await?;
            stdout.flush().await?;
        }

        if let StreamEvent::AskUser {
            group_id,
            questions,
        } = &event
        {
            let answers = read_answers(questions, &mut stdin).await?;
            if !engine.ask_user().submit_responses(group_id, answers) {
                tracing::warn!(group_id = %group_id, "Question group not found or already answered");
            }
        }
    }

    stream.cancel_and_wait().await;
    coordinator.run_cleanup().await;
    Ok(())
}

/// 逐题提示并读取一行回答；空行表示跳过
async fn read_answers(
    questions: &[Question],
    stdin: &mut Lines<BufReader<Stdin>>,
) -> anyhow::Result<HashMap<String, String>> {
    let mut answers = HashMap::new();
    for question in questions {
        let hint = match question.question_type {
            QuestionType::Choice => format!(" [{}]", question.options.join(" / ")),
            QuestionType::Confirm => " [yes / no]".to_string(),
            QuestionType::Text => String::new(),
        };
        eprint!("? {}{}: ", question.question, hint);

        let Some(line) = stdin.next_line().await.context("Failed to read answer")? else {
            break;
        };
        let line = line.trim();
        if !line.is_empty() {
            answers.insert(question.id.clone(), line.to_string());
        }
    }
    Ok(answers)
}
