//! 工具服务声明与构造
//!
//! `[[providers]]` 中每一项声明一个工具服务：能力类别、启动命令、环境变量，
//! 以及凭据文件路径写入哪个环境变量。ProviderFactory 把声明变成原始 ToolProvider，
//! 测试中可替换为进程内实现。

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::ProviderError;
use crate::providers::{McpServerParams, McpStdioProvider, ToolProvider};

/// 工具服务能力类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Analytics,
    SearchConsole,
    Ads,
    ContentManagement,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Analytics => "analytics",
            Capability::SearchConsole => "search_console",
            Capability::Ads => "ads",
            Capability::ContentManagement => "content_management",
        }
    }
}

/// 单个工具服务声明
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSpec {
    /// 人类可读标签，如 `wordpress_achieve`
    pub label: String,
    pub capability: Capability,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// 接收凭据文件路径的环境变量名；为空则不落盘凭据
    #[serde(default)]
    pub credential_env: Option<String>,
    /// 是否套用报表压缩
    #[serde(default)]
    pub compact: bool,
    /// 显式前缀（同能力多实例时使用）
    #[serde(default)]
    pub prefix: Option<String>,
    /// 接收 project id 的环境变量名
    #[serde(default)]
    pub project_env: Vec<String>,
}

impl ProviderSpec {
    pub fn new(label: impl Into<String>, capability: Capability, command: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            capability,
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            credential_env: None,
            compact: false,
            prefix: None,
            project_env: Vec::new(),
        }
    }

    pub fn with_credential_env(mut self, name: impl Into<String>) -> Self {
        self.credential_env = Some(name.into());
        self
    }

    pub fn compacted(mut self) -> Self {
        self.compact = true;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
}

/// 前缀推导：显式前缀优先；否则取标签最后一个 `_` / `-` 之后的部分（小写、只留字母数字）；
/// 仍为空时退回 `p{index}`
pub fn derive_prefix(spec: &ProviderSpec, index: usize) -> String {
    if let Some(prefix) = spec.prefix.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        return prefix.to_string();
    }
    let suffix = spec
        .label
        .rsplit_once(|c: char| c == '_' || c == '-')
        .map(|(_, tail)| tail)
        .unwrap_or_default();
    let cleaned: String = suffix
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if cleaned.is_empty() {
        format!("p{index}")
    } else {
        cleaned
    }
}

/// 原始工具服务构造器
pub trait ProviderFactory: Send + Sync {
    /// `env` 已合并声明中的变量、凭据路径与 project id
    fn create(
        &self,
        spec: &ProviderSpec,
        env: HashMap<String, String>,
    ) -> Result<Box<dyn ToolProvider>, ProviderError>;
}

/// 以 stdio 子进程启动 MCP 工具服务
#[derive(Debug, Clone)]
pub struct McpProviderFactory {
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
}

impl ProviderFactory for McpProviderFactory {
    fn create(
        &self,
        spec: &ProviderSpec,
        env: HashMap<String, String>,
    ) -> Result<Box<dyn ToolProvider>, ProviderError> {
        Ok(Box::new(McpStdioProvider::new(
            spec.label.clone(),
            McpServerParams {
                command: spec.command.clone(),
                args: spec.args.clone(),
                env,
                connect_timeout: self.connect_timeout,
                call_timeout: self.call_timeout,
            },
        )))
    }
}
