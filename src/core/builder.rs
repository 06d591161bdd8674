//! 引擎构建器：命令行与 Web 共用的组装逻辑
//!
//! 从 AppConfig 构造 LLM 客户端、ReAct 运行器、翻译器、会话管理器与 TurnEngine。
//! 测试可以注入 LLM 与工具服务构造器，跳过网络与子进程。

use std::sync::Arc;
use std::time::Duration;

use crate::agent::ReactRunner;
use crate::ask_user::AskUserStore;
use crate::config::AppConfig;
use crate::credentials::{CredentialMaterializer, SecretMaterial};
use crate::llm::{LlmClient, OpenAiClient};
use crate::session::{McpProviderFactory, ProviderFactory, SessionManager};
use crate::stream::TurnEngine;
use crate::translate::{LlmTranslator, NoopTranslator, Translator};

pub struct EngineBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    factory: Option<Arc<dyn ProviderFactory>>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            factory: None,
        }
    }

    /// 替换 LLM（默认按 [llm] 段创建 OpenAiClient）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 替换工具服务构造器（默认 MCP stdio 子进程）
    pub fn with_provider_factory(mut self, factory: Arc<dyn ProviderFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    fn openai(&self, model: &str) -> Arc<dyn LlmClient> {
        let llm = &self.config.llm;
        let api_key = std::env::var(&llm.api_key_env).ok();
        let mut client = OpenAiClient::new(llm.base_url.as_deref(), model, api_key.as_deref());
        if llm.timeouts.request > 0 {
            client = client.with_request_timeout(Duration::from_secs(llm.timeouts.request));
        }
        Arc::new(client)
    }

    pub fn build(self) -> Arc<TurnEngine> {
        let cfg = &self.config;
        tracing::info!(
            provider = %cfg.llm.provider,
            model = %cfg.llm.model,
            providers = cfg.providers.len(),
            "building turn engine"
        );

        let llm = self
            .llm
            .clone()
            .unwrap_or_else(|| self.openai(&cfg.llm.model));

        let mut runner = ReactRunner::new(Arc::clone(&llm)).with_max_turns(cfg.agent.max_turns);
        if let Some(prompt) = cfg.agent.system_prompt.as_ref().filter(|p| !p.trim().is_empty()) {
            runner = runner.with_system_prompt(prompt.clone());
        }

        let translator: Arc<dyn Translator> = match cfg.agent.reasoning_language.as_deref() {
            Some(language) if !language.trim().is_empty() => {
                let translate_llm = match (&self.llm, &cfg.llm.translate_model) {
                    (None, Some(model)) => self.openai(model),
                    _ => Arc::clone(&llm),
                };
                Arc::new(LlmTranslator::new(translate_llm, language))
            }
            _ => Arc::new(NoopTranslator),
        };

        let factory = self.factory.clone().unwrap_or_else(|| {
            Arc::new(McpProviderFactory {
                connect_timeout: Duration::from_secs(cfg.tools.provider_connect_timeout_secs),
                call_timeout: Duration::from_secs(cfg.tools.provider_call_timeout_secs),
            })
        });

        let sessions = SessionManager::new(
            Arc::new(cfg.materializer()),
            factory,
            cfg.providers.clone(),
            cfg.session_settings(),
        );

        Arc::new(
            TurnEngine::new(
                Arc::new(sessions),
                Arc::new(runner),
                Arc::new(AskUserStore::new()),
                translator,
            )
            .with_settings(cfg.turn_settings()),
        )
    }
}

/// 用配置中的 OAuth 客户端信息 + 调用方提供的 refresh token 组装秘密材料
pub fn secret_from_config(config: &AppConfig, refresh_token: impl Into<String>) -> SecretMaterial {
    SecretMaterial {
        client_id: config.credentials.client_id.clone().unwrap_or_default(),
        client_secret: config.credentials.client_secret.clone().unwrap_or_default(),
        refresh_token: refresh_token.into(),
        quota_project_id: None,
    }
}

/// 当前引擎使用的凭据落盘器（关闭时清理）
pub fn engine_materializer(engine: &TurnEngine) -> Arc<CredentialMaterializer> {
    Arc::clone(engine.sessions().materializer())
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::agent::RunRequest;
    use crate::llm::ScriptedLlmClient;
    use crate::stream::{StreamEvent, TurnRequest};

    #[tokio::test]
    async fn test_built_engine_runs_without_providers() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.credentials.base_dir = Some(tmp.path().to_path_buf());
        config.credentials.client_id = Some("cid".into());

        let engine = EngineBuilder::new(config.clone())
            .with_llm(Arc::new(ScriptedLlmClient::new(["Hello there."])))
            .build();
        assert_eq!(engine_materializer(&engine).base_dir(), tmp.path());

        let events: Vec<StreamEvent> = engine
            .start_turn(TurnRequest {
                owner: "u".into(),
                secret: secret_from_config(&config, "rt"),
                run: RunRequest::new("hi"),
                conversation_id: None,
            })
            .collect()
            .await;
        assert!(events.iter().any(|e| matches!(e, StreamEvent::TextDelta { .. })));
        assert!(events.last().map(|e| e.is_done()).unwrap_or(false));
    }
}
