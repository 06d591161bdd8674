//! 每轮工具箱：函数工具 + 本轮所有工具服务的工具，按名路由
//!
//! 构建时每个工具服务只查询一次工具列表，整轮复用。执行永远返回文本：
//! 未知工具、参数错误、工具服务故障都转为简短的错误说明回灌给模型，不会越过单次调用。
//! 每次调用输出一条结构化审计日志（JSON）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::core::ProviderError;
use crate::providers::{ToolProvider, ToolSpec};
use crate::tools::{ToolRegistry, TurnContext};

enum Route {
    Function,
    Provider(usize),
}

pub struct Toolbox {
    functions: ToolRegistry,
    providers: Vec<Arc<dyn ToolProvider>>,
    routes: HashMap<String, Route>,
    specs: Vec<ToolSpec>,
}

impl Toolbox {
    /// 汇总函数工具与工具服务的工具列表；列表查询失败视为启动失败
    pub async fn build(
        functions: ToolRegistry,
        providers: Vec<Arc<dyn ToolProvider>>,
    ) -> Result<Self, ProviderError> {
        let mut routes = HashMap::new();
        let mut specs = Vec::new();

        for tool in functions.tools() {
            routes.insert(tool.name().to_string(), Route::Function);
            specs.push(ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.parameters_schema(),
            });
        }

        for (idx, provider) in providers.iter().enumerate() {
            for spec in provider.list_tools().await? {
                if routes.contains_key(&spec.name) {
                    tracing::warn!(provider = provider.name(), tool = %spec.name, "duplicate tool name, keeping first");
                    continue;
                }
                routes.insert(spec.name.clone(), Route::Provider(idx));
                specs.push(spec);
            }
        }

        tracing::debug!(tool_count = specs.len(), providers = providers.len(), "toolbox ready");
        Ok(Self {
            functions,
            providers,
            routes,
            specs,
        })
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    /// 工具清单 JSON（写入 system prompt）
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .specs
            .iter()
            .map(|spec| {
                serde_json::json!({
                    "name": spec.name,
                    "description": spec.description,
                    "parameters": spec.input_schema,
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }

    /// 执行指定工具并返回给模型的文本
    pub async fn execute(&self, ctx: &TurnContext, name: &str, args: Value) -> String {
        let start = Instant::now();
        let preview = args_preview(&args);

        let (result, outcome): (String, &str) = match self.routes.get(name) {
            None => (format!("Error: unknown tool '{name}'"), "unknown"),
            Some(Route::Function) => match self.functions.get(name) {
                Some(tool) => match tool.execute(ctx, args).await {
                    Ok(text) => (text, "ok"),
                    Err(e) => (format!("Error: {e}"), "error"),
                },
                None => (format!("Error: unknown tool '{name}'"), "unknown"),
            },
            Some(Route::Provider(idx)) => match self.providers[*idx].call_tool(name, args).await {
                Ok(output) if output.is_error => (output.to_text(), "error"),
                Ok(output) => (output.to_text(), "ok"),
                Err(e @ ProviderError::Timeout { .. }) => (format!("Error: {e}"), "timeout"),
                Err(e) => (format!("Error: {e}"), "error"),
            },
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "turn_id": ctx.turn_id,
            "tool": name,
            "ok": outcome == "ok",
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit, "tool");

        result
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ask_user::AskUserStore;
    use crate::providers::{PrefixedProvider, StaticProvider, ToolOutput};
    use crate::stream::event_queue;

    fn ctx() -> TurnContext {
        let (emitter, _rx) = event_queue();
        TurnContext {
            turn_id: "turn-1".into(),
            conversation_id: None,
            emitter,
            ask_user: Arc::new(AskUserStore::new()),
            ask_user_timeout: Duration::from_secs(1),
        }
    }

    async fn toolbox() -> Toolbox {
        let ga4: Arc<dyn ToolProvider> = Arc::new(
            StaticProvider::new("ga4")
                .with_text_tool("run_report", "date\tsessions")
                .with_tool("broken", |_| ToolOutput {
                    content: vec![crate::providers::ToolContent::Text("quota exceeded".into())],
                    is_error: true,
                }),
        );
        let cms: Arc<dyn ToolProvider> = Arc::new(PrefixedProvider::new(
            Box::new(StaticProvider::new("wordpress").with_text_tool("get-posts", "3 posts")),
            "blog",
        ));
        Toolbox::build(ToolRegistry::with_builtins(), vec![ga4, cms])
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_routes_function_and_provider_tools() {
        let toolbox = toolbox().await;
        let names: Vec<&str> = toolbox.specs().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["ask_user", "render_chart", "run_report", "broken", "blog__get-posts"]
        );

        let ctx = ctx();
        assert_eq!(toolbox.execute(&ctx, "run_report", Value::Null).await, "date\tsessions");
        assert_eq!(toolbox.execute(&ctx, "blog__get-posts", Value::Null).await, "3 posts");
        assert_eq!(toolbox.execute(&ctx, "broken", Value::Null).await, "quota exceeded");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_textual() {
        let toolbox = toolbox().await;
        let out = toolbox.execute(&ctx(), "nope", Value::Null).await;
        assert_eq!(out, "Error: unknown tool 'nope'");
    }

    #[tokio::test]
    async fn test_schema_json_lists_every_tool() {
        let toolbox = toolbox().await;
        let parsed: Vec<Value> = serde_json::from_str(&toolbox.to_schema_json()).unwrap();
        assert_eq!(parsed.len(), 5);
        assert_eq!(parsed[0]["name"], "ask_user");
    }
}
