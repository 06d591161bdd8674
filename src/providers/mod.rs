//! 工具服务层：窄接口 ToolProvider 与组合式适配器
//!
//! - **mcp**: 通过 rmcp 子进程（stdio）连接 MCP 工具服务
//! - **prefixed**: 工具名加前缀（多个同类服务共存时避免重名）
//! - **compact**: 输出压缩 + 字符上限截断
//! - **compaction**: 报表形 JSON → TSV 的压缩函数与注册表
//! - **fixture**: 进程内静态工具服务（测试 / 演示用）
//!
//! 适配器之间只通过 ToolProvider 组合，每个适配器独占其内层实现。

pub mod compact;
pub mod compaction;
pub mod fixture;
pub mod mcp;
pub mod prefixed;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::core::ProviderError;

pub use compact::{truncate_lines, CompactingProvider, DEFAULT_MAX_OUTPUT_CHARS};
pub use compaction::{Compactor, CompactorRegistry};
pub use fixture::StaticProvider;
pub use mcp::{McpServerParams, McpStdioProvider};
pub use prefixed::PrefixedProvider;

/// 工具描述（名称、说明、输入 JSON Schema）
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// 工具返回内容片段
#[derive(Debug, Clone, PartialEq)]
pub enum ToolContent {
    Text(String),
    /// 非文本内容（图片、资源等）原样保留为 JSON
    Other(Value),
}

/// 一次工具调用的结果
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolOutput {
    pub content: Vec<ToolContent>,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text(text.into())],
            is_error: false,
        }
    }

    /// 合并为给模型看的单段文本
    pub fn to_text(&self) -> String {
        self.content
            .iter()
            .map(|c| match c {
                ToolContent::Text(t) => t.clone(),
                ToolContent::Other(v) => v.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// 工具服务窄接口：connect / list_tools / call_tool / teardown
///
/// 方法取 `&self`，连接状态由实现自行用内部可变性管理，以便一轮内共享 `Arc<dyn ToolProvider>`。
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// 展示名（可能带前缀）
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), ProviderError>;

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ProviderError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, ProviderError>;

    async fn teardown(&self) -> Result<(), ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_output_to_text_joins_parts() {
        let out = ToolOutput {
            content: vec![
                ToolContent::Text("a".to_string()),
                ToolContent::Other(serde_json::json!({"k": 1})),
            ],
            is_error: false,
        };
        assert_eq!(out.to_text(), "a\n{\"k\":1}");
    }
}
