//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TAPLINE__*` 覆盖（双下划线表示嵌套，如 `TAPLINE__LLM__MODEL=gpt-4o`）。
//! 每个键都有默认值，空配置也能启动。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::credentials::CredentialMaterializer;
use crate::session::{ProviderSpec, SessionSettings};
use crate::stream::TurnSettings;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub tools: ToolsSection,
    pub credentials: CredentialsSection,
    pub sessions: SessionsSection,
    pub providers: Vec<ProviderSpec>,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// Web 服务监听地址
    pub listen_addr: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            listen_addr: "0.0.0.0:8000".to_string(),
        }
    }
}

/// [llm] 段：OpenAI 兼容后端
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    pub api_key_env: String,
    /// 推理摘要翻译用的模型，缺省同 model
    pub translate_model: Option<String>,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            translate_model: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [agent] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_turns: usize,
    pub system_prompt: Option<String>,
    /// 设置后推理摘要翻译为该语言；未设置则不翻译
    pub reasoning_language: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_turns: crate::agent::DEFAULT_MAX_TURNS,
            system_prompt: None,
            reasoning_language: None,
        }
    }
}

/// [tools] 段：输出上限与各类超时（秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub max_output_chars: usize,
    /// tool_result 事件中 output 的字符上限
    pub tool_result_preview_chars: usize,
    pub ask_user_timeout_secs: u64,
    pub provider_call_timeout_secs: u64,
    pub provider_connect_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            max_output_chars: crate::providers::DEFAULT_MAX_OUTPUT_CHARS,
            tool_result_preview_chars: crate::stream::DEFAULT_TOOL_RESULT_PREVIEW_CHARS,
            ask_user_timeout_secs: 300,
            provider_call_timeout_secs: 120,
            provider_connect_timeout_secs: 120,
        }
    }
}

/// [credentials] 段：OAuth 客户端信息与落盘根目录
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CredentialsSection {
    pub base_dir: Option<PathBuf>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// 配额项目
    pub project_id: Option<String>,
}

/// [sessions] 段：空闲清扫
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionsSection {
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

impl AppConfig {
    pub fn materializer(&self) -> CredentialMaterializer {
        CredentialMaterializer::new(
            self.credentials
                .base_dir
                .clone()
                .unwrap_or_else(CredentialMaterializer::default_base_dir),
        )
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            idle_timeout: Duration::from_secs(self.sessions.idle_timeout_secs),
            max_output_chars: self.tools.max_output_chars,
            project_id: self.credentials.project_id.clone().filter(|p| !p.is_empty()),
        }
    }

    pub fn turn_settings(&self) -> TurnSettings {
        TurnSettings {
            tool_result_preview_chars: self.tools.tool_result_preview_chars,
            ask_user_timeout: Duration::from_secs(self.tools.ask_user_timeout_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sessions.sweep_interval_secs.max(1))
    }
}

/// 从 config 目录加载配置，环境变量 TAPLINE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TAPLINE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TAPLINE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
