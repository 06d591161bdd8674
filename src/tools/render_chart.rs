//! render_chart 工具：把图表规格推送给前端渲染

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::stream::StreamEvent;
use crate::tools::{Tool, TurnContext};

/// 前端支持的图表类型
pub const CHART_TYPES: &[&str] = &[
    "line", "bar", "area", "pie", "donut", "scatter", "radar", "funnel", "table",
];

#[allow(dead_code)]
#[derive(Deserialize, JsonSchema)]
struct RenderChartArgs {
    /// Chart spec as a JSON object (or JSON string): {"type": "line|bar|area|pie|donut|scatter|radar|funnel|table",
    /// "title": "...", "data": [{...}], "xKey": "...", "yKeys": [{"key": "...", "label": "..."}],
    /// "nameKey"/"valueKey" for pie and donut, "columns" for table, "nameField"/"valueField" for funnel}.
    /// Numbers in data must be numeric, not strings.
    chart_spec: Value,
}

pub struct RenderChartTool;

#[async_trait]
impl Tool for RenderChartTool {
    fn name(&self) -> &str {
        "render_chart"
    }

    fn description(&self) -> &str {
        "Render an interactive chart in the chat UI after fetching data worth visualizing."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::to_value(schemars::schema_for!(RenderChartArgs))
            .unwrap_or_else(|_| serde_json::json!({"type": "object"}))
    }

    async fn execute(&self, ctx: &TurnContext, args: Value) -> Result<String, String> {
        let spec = match args.get("chart_spec") {
            Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
                Ok(spec) => spec,
                Err(_) => return Ok("(could not parse the chart spec JSON)".to_string()),
            },
            Some(value) => value.clone(),
            None => return Ok("(chart spec requires 'type' and 'data')".to_string()),
        };

        let Some(obj) = spec.as_object() else {
            return Ok("(chart spec requires 'type' and 'data')".to_string());
        };
        if !obj.contains_key("type") || !obj.contains_key("data") {
            return Ok("(chart spec requires 'type' and 'data')".to_string());
        }
        if let Some(kind) = obj.get("type").and_then(Value::as_str) {
            if !CHART_TYPES.contains(&kind) {
                tracing::warn!(turn_id = %ctx.turn_id, chart_type = kind, "unknown chart type, forwarding anyway");
            }
        }

        let title = obj
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        ctx.emit(StreamEvent::Chart { spec });
        Ok(format!("Rendered chart \"{title}\"."))
    }
}
