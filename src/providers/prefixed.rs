//! 工具名前缀适配器
//!
//! 同一能力的多个工具服务（例如多个 CMS 站点）挂在同一个 Agent 下时工具名会冲突；
//! 对外暴露 `prefix__tool`，调用时去掉已知前缀再转发。前缀缺失或不同的名字原样透传给内层服务。

use async_trait::async_trait;
use serde_json::Value;

use crate::core::ProviderError;
use crate::providers::{ToolOutput, ToolProvider, ToolSpec};

/// 前缀与原工具名之间的分隔符
pub const PREFIX_SEPARATOR: &str = "__";

pub struct PrefixedProvider {
    inner: Box<dyn ToolProvider>,
    prefix: String,
    display_name: String,
}

impl PrefixedProvider {
    pub fn new(inner: Box<dyn ToolProvider>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let display_name = format!("{}_{}", prefix, inner.name());
        Self {
            inner,
            prefix,
            display_name,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn prefixed(&self, tool: &str) -> String {
        format!("{}{}{}", self.prefix, PREFIX_SEPARATOR, tool)
    }

    /// `prefix__tool` → `tool`；其余名字原样返回
    fn strip<'a>(&self, tool: &'a str) -> &'a str {
        tool.strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix(PREFIX_SEPARATOR))
            .unwrap_or(tool)
    }
}

#[async_trait]
impl ToolProvider for PrefixedProvider {
    fn name(&self) -> &str {
        &self.display_name
    }

    async fn connect(&self) -> Result<(), ProviderError> {
        self.inner.connect().await
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ProviderError> {
        let tools = self.inner.list_tools().await?;
        Ok(tools
            .into_iter()
            .map(|tool| ToolSpec {
                name: self.prefixed(&tool.name),
                ..tool
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, ProviderError> {
        self.inner.call_tool(self.strip(name), arguments).await
    }

    async fn teardown(&self) -> Result<(), ProviderError> {
        self.inner.teardown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::StaticProvider;

    fn wrapped() -> PrefixedProvider {
        let inner = StaticProvider::new("wordpress")
            .with_text_tool("get-posts", "posts")
            .with_text_tool("get-pages", "pages");
        PrefixedProvider::new(Box::new(inner), "achieve")
    }

    #[tokio::test]
    async fn test_list_tools_prefixes_every_inner_tool() {
        let provider = wrapped();
        let names: Vec<String> = provider
            .list_tools()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["achieve__get-posts", "achieve__get-pages"]);
        assert_eq!(provider.name(), "achieve_wordpress");
    }

    #[tokio::test]
    async fn test_call_strips_known_prefix() {
        let provider = wrapped();
        let out = provider
            .call_tool("achieve__get-posts", serde_json::json!({"n": 1}))
            .await
            .unwrap();
        assert_eq!(out.to_text(), "posts");
    }

    #[tokio::test]
    async fn test_unknown_prefix_passes_through_unmodified() {
        let provider = wrapped();
        // 内层服务直接收到原名
        assert_eq!(provider.strip("other__get-posts"), "other__get-posts");
        assert_eq!(provider.strip("get-pages"), "get-pages");
        assert_eq!(provider.strip("achieveget-pages"), "achieveget-pages");

        let out = provider.call_tool("get-pages", Value::Null).await.unwrap();
        assert_eq!(out.to_text(), "pages");
        let err = provider.call_tool("other__get-posts", Value::Null).await;
        assert!(matches!(err, Err(ProviderError::ToolNotFound { .. })));
    }
}
