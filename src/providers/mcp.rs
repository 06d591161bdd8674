//! MCP 工具服务（stdio 子进程）
//!
//! 生命周期：connect 时按 command + args + env 启动子进程并完成初始化握手（受连接超时约束）；
//! 工具列表首次查询后缓存，整轮复用；每次调用受单次超时约束；teardown 取消服务并回收子进程。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::{CallToolRequestParam, CallToolResult, RawContent};
use rmcp::service::{Peer, RunningService};
use rmcp::transport::TokioChildProcess;
use rmcp::{RoleClient, ServiceExt};
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::core::ProviderError;
use crate::providers::{ToolContent, ToolOutput, ToolProvider, ToolSpec};

/// 子进程启动参数
#[derive(Debug, Clone)]
pub struct McpServerParams {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// 初始化握手超时
    pub connect_timeout: Duration,
    /// 单次 tools/list、tools/call 超时
    pub call_timeout: Duration,
}

/// 通过 rmcp 连接的 MCP 工具服务
pub struct McpStdioProvider {
    name: String,
    params: McpServerParams,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
    peer: Mutex<Option<Peer<RoleClient>>>,
    tools_cache: Mutex<Option<Vec<ToolSpec>>>,
}

impl McpStdioProvider {
    pub fn new(name: impl Into<String>, params: McpServerParams) -> Self {
        Self {
            name: name.into(),
            params,
            service: Mutex::new(None),
            peer: Mutex::new(None),
            tools_cache: Mutex::new(None),
        }
    }

    async fn peer(&self) -> Result<Peer<RoleClient>, ProviderError> {
        self.peer
            .lock()
            .await
            .clone()
            .ok_or_else(|| ProviderError::NotConnected {
                name: self.name.clone(),
            })
    }

    fn timeout_error(&self, operation: &str) -> ProviderError {
        ProviderError::Timeout {
            provider: self.name.clone(),
            operation: operation.to_string(),
        }
    }

    fn protocol_error(&self, message: String) -> ProviderError {
        ProviderError::Protocol {
            provider: self.name.clone(),
            message,
        }
    }
}

#[async_trait]
impl ToolProvider for McpStdioProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), ProviderError> {
        let mut service_slot = self.service.lock().await;
        if service_slot.is_some() {
            return Ok(());
        }

        tracing::info!(provider = %self.name, command = %self.params.command, "connecting to MCP server");

        let mut cmd = Command::new(&self.params.command);
        cmd.args(&self.params.args);
        for (key, value) in &self.params.env {
            cmd.env(key, value);
        }

        let transport = TokioChildProcess::new(cmd).map_err(|e| ProviderError::SpawnFailed {
            name: self.name.clone(),
            source: e,
        })?;

        let service = tokio::time::timeout(self.params.connect_timeout, ().serve(transport))
            .await
            .map_err(|_| self.timeout_error("initialize"))?
            .map_err(|e| self.protocol_error(format!("initialization failed: {e}")))?;

        *self.peer.lock().await = Some(service.peer().clone());
        *service_slot = Some(service);
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ProviderError> {
        let mut cache = self.tools_cache.lock().await;
        if let Some(tools) = cache.as_ref() {
            return Ok(tools.clone());
        }

        let peer = self.peer().await?;
        let tools = tokio::time::timeout(self.params.call_timeout, peer.list_all_tools())
            .await
            .map_err(|_| self.timeout_error("tools/list"))?
            .map_err(|e| self.protocol_error(format!("tools/list failed: {e}")))?;

        let specs: Vec<ToolSpec> = tools
            .into_iter()
            .map(|tool| ToolSpec {
                name: tool.name.to_string(),
                description: tool.description.as_deref().unwrap_or_default().to_string(),
                input_schema: Value::Object((*tool.input_schema).clone()),
            })
            .collect();

        tracing::info!(provider = %self.name, tool_count = specs.len(), "discovered MCP tools");
        *cache = Some(specs.clone());
        Ok(specs)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, ProviderError> {
        let arguments = match arguments {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => return Err(ProviderError::InvalidArguments(other.to_string())),
        };

        let peer = self.peer().await?;
        let result = tokio::time::timeout(
            self.params.call_timeout,
            peer.call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments,
            }),
        )
        .await
        .map_err(|_| self.timeout_error("tools/call"))?
        .map_err(|e| self.protocol_error(format!("tools/call failed: {e}")))?;

        Ok(map_tool_result(result))
    }

    async fn teardown(&self) -> Result<(), ProviderError> {
        self.peer.lock().await.take();
        let service = self.service.lock().await.take();
        if let Some(service) = service {
            service
                .cancel()
                .await
                .map_err(|e| self.protocol_error(format!("shutdown failed: {e}")))?;
            tracing::info!(provider = %self.name, "disconnected MCP server");
        }
        Ok(())
    }
}

fn map_tool_result(result: CallToolResult) -> ToolOutput {
    let mut content: Vec<ToolContent> = result
        .content
        .into_iter()
        .map(|item| match item.raw {
            RawContent::Text(text) => ToolContent::Text(text.text),
            other => ToolContent::Other(serde_json::to_value(&other).unwrap_or(Value::Null)),
        })
        .collect();

    if content.is_empty() {
        if let Some(value) = result.structured_content {
            content.push(ToolContent::Text(value.to_string()));
        }
    }

    ToolOutput {
        content,
        is_error: result.is_error.unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(command: &str) -> McpServerParams {
        McpServerParams {
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            connect_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_call_before_connect_is_not_connected() {
        let provider = McpStdioProvider::new("ga4", params("analytics-mcp"));
        let err = provider.call_tool("run_report", serde_json::json!({})).await;
        assert!(matches!(err, Err(ProviderError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_non_object_arguments_rejected() {
        let provider = McpStdioProvider::new("ga4", params("analytics-mcp"));
        let err = provider.call_tool("run_report", serde_json::json!([1])).await;
        assert!(matches!(err, Err(ProviderError::InvalidArguments(_))));
    }

    #[tokio::test]
    async fn test_spawn_failure_reported() {
        let provider = McpStdioProvider::new("ghost", params("/nonexistent/tapline-mcp-binary"));
        assert!(provider.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_teardown_without_connect_is_noop() {
        let provider = McpStdioProvider::new("ga4", params("analytics-mcp"));
        assert!(provider.teardown().await.is_ok());
    }
}
