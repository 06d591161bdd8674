//! 错误类型：凭据、工具服务、会话资源、Agent 运行
//!
//! 每个子系统一个 thiserror 枚举；工具调用级别的错误不会越过单次调用（转为文本结果回灌给模型），
//! 只有流泵与工具服务启动阶段的错误才会升级为 `error` 事件并结束本轮。

use std::path::PathBuf;

use thiserror::Error;

/// 凭据落盘 / 删除失败
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("failed to prepare credential directory {path}: {source}")]
    Prepare {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write credential file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize credential record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// 工具服务（子进程 / 网络连接）错误
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("failed to spawn provider '{name}': {source}")]
    SpawnFailed {
        name: String,
        source: std::io::Error,
    },

    #[error("provider protocol error for '{provider}': {message}")]
    Protocol { provider: String, message: String },

    #[error("provider '{provider}' timed out during {operation}")]
    Timeout { provider: String, operation: String },

    #[error("provider not connected: {name}")]
    NotConnected { name: String },

    #[error("tool not found on provider '{provider}': {tool}")]
    ToolNotFound { provider: String, tool: String },

    #[error("tool arguments must be a JSON object, got: {0}")]
    InvalidArguments(String),
}

/// 每轮会话资源（凭据 + 工具服务）建立失败
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("credential materialization failed: {0}")]
    Credential(#[from] CredentialError),

    #[error("provider bootstrap failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("turn provider set already closed: {0}")]
    AlreadyClosed(String),

    #[error("no provider declared for capability: {0}")]
    NoProvider(String),
}

/// Agent 运行过程中可能出现的错误（LLM、工具、解析、配置、取消）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Max turns ({0}) exceeded")]
    MaxTurnsExceeded(usize),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Run cancelled")]
    Cancelled,
}
