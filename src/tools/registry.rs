//! 函数工具注册表
//!
//! 所有函数工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找。
//! 执行时显式传入每轮的 TurnContext（事件发射、问题组注册表、turn id），不依赖任何全局状态。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::ask_user::AskUserStore;
use crate::stream::{EventEmitter, StreamEvent};

/// 每轮工具调用上下文
#[derive(Clone)]
pub struct TurnContext {
    pub turn_id: String,
    pub conversation_id: Option<String>,
    pub emitter: EventEmitter,
    pub ask_user: Arc<AskUserStore>,
    /// ask_user 等待回答的上限
    pub ask_user_timeout: Duration,
}

impl TurnContext {
    /// 推送带外事件到本轮队列
    pub fn emit(&self, event: StreamEvent) {
        if !self.emitter.emit(event) {
            tracing::debug!(turn_id = %self.turn_id, "turn queue closed, event dropped");
        }
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
///
/// `Err` 仅表示工具内部故障；参数不合法应返回 `Ok` 的简短说明，让模型自行修正后重试。
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（用于 JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认不限
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, ctx: &TurnContext, args: Value) -> Result<String, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置函数工具：ask_user、render_chart
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::tools::AskUserTool);
        registry.register(crate::tools::RenderChartTool);
        registry
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// 按名称排序，保证 prompt 稳定
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tool_names()
            .iter()
            .filter_map(|name| self.get(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = ToolRegistry::with_builtins();
        assert_eq!(registry.tool_names(), vec!["ask_user", "render_chart"]);
        assert!(registry.contains("ask_user"));
        assert!(registry.get("missing").is_none());
    }
}
