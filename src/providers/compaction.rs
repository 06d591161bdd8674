//! 报表输出压缩：把冗长的报表 JSON（proto_to_dict 形式）转为紧凑 TSV
//!
//! 输入形状（单份报表）：
//!
//! ```json
//! {
//!   "dimension_headers": [{"name": "date"}],
//!   "metric_headers": [{"name": "sessions", "type_": "TYPE_INTEGER"}],
//!   "rows": [{"dimension_values": [{"value": "20250101"}], "metric_values": [{"value": "10"}]}],
//!   "row_count": 1
//! }
//! ```
//!
//! 输出：表头行（Tab 分隔）、每行数据、`---`、`rows: N`。
//! 形状不匹配（不是 JSON、缺表头或缺行）时原样返回输入，压缩永远不会破坏数据或报错。
//! snake_case 与 camelCase 两种键名都接受。

use std::collections::HashMap;

use serde_json::Value;

/// 压缩函数：文本进，文本出；不认识的输入原样返回
pub type Compactor = fn(&str) -> String;

/// 工具名 → 压缩函数
#[derive(Clone, Default)]
pub struct CompactorRegistry {
    compactors: HashMap<String, Compactor>,
}

impl CompactorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 分析类工具服务的默认注册：普通 / 实时 / 批量 / 透视 / 漏斗报表
    pub fn analytics_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("run_report", compact_report);
        registry.register("run_realtime_report", compact_report);
        registry.register("batch_run_reports", compact_batch_reports);
        registry.register("run_pivot_report", compact_pivot_report);
        registry.register("run_funnel_report", compact_funnel_report);
        registry
    }

    pub fn register(&mut self, tool_name: impl Into<String>, compactor: Compactor) {
        self.compactors.insert(tool_name.into(), compactor);
    }

    pub fn get(&self, tool_name: &str) -> Option<Compactor> {
        self.compactors.get(tool_name).copied()
    }

    /// 有注册则压缩，否则恒等
    pub fn apply(&self, tool_name: &str, text: &str) -> String {
        match self.get(tool_name) {
            Some(compactor) => compactor(text),
            None => text.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.compactors.is_empty()
    }
}

/// 单份报表 → TSV
pub fn compact_report(raw: &str) -> String {
    let Ok(data) = serde_json::from_str::<Value>(raw) else {
        return raw.to_string();
    };
    match report_tsv(&data) {
        Some(tsv) => {
            log_reduction("report", raw, &tsv);
            tsv
        }
        None => raw.to_string(),
    }
}

/// 批量报表：逐份压缩，以 `=== Report N ===` 分隔
pub fn compact_batch_reports(raw: &str) -> String {
    let Ok(data) = serde_json::from_str::<Value>(raw) else {
        return raw.to_string();
    };
    let Some(reports) = non_empty_array(&data, "reports", "reports") else {
        return raw.to_string();
    };

    let parts: Vec<String> = reports
        .iter()
        .enumerate()
        .map(|(i, report)| {
            let body = report_tsv(report).unwrap_or_else(|| report.to_string());
            format!("=== Report {} ===\n{}", i + 1, body)
        })
        .collect();

    let result = parts.join("\n");
    log_reduction("batch reports", raw, &result);
    result
}

/// 透视报表：把透视分组标签展开进指标列名（`metric_pivotlabel`）
pub fn compact_pivot_report(raw: &str) -> String {
    let Ok(data) = serde_json::from_str::<Value>(raw) else {
        return raw.to_string();
    };
    if !data.is_object() {
        return raw.to_string();
    }
    let Some(rows) = non_empty_array(&data, "rows", "rows") else {
        return raw.to_string();
    };

    let dim_names = header_names(array_field(&data, "dimension_headers", "dimensionHeaders"));
    let metric_names = header_names(array_field(&data, "metric_headers", "metricHeaders"));

    let mut pivot_labels = Vec::new();
    for group in array_field(&data, "pivot_headers", "pivotHeaders") {
        for header in array_field(group, "pivot_dimension_headers", "pivotDimensionHeaders") {
            let parts = cell_values(
                array_field(header, "dimension_values", "dimensionValues"),
                "?",
            );
            if parts.is_empty() {
                pivot_labels.push("?".to_string());
            } else {
                pivot_labels.push(parts.join("_"));
            }
        }
    }

    let mut columns = dim_names;
    if !pivot_labels.is_empty() && !metric_names.is_empty() {
        for label in &pivot_labels {
            for metric in &metric_names {
                columns.push(format!("{metric}_{label}"));
            }
        }
    } else {
        columns.extend(metric_names);
    }

    let result = render_table(&columns, rows, row_count(&data, rows.len()));
    log_reduction("pivot report", raw, &result);
    result
}

/// 漏斗报表：按小节（表格 / 可视化）分别压缩；没有可识别的小节时按单份报表处理
pub fn compact_funnel_report(raw: &str) -> String {
    let Ok(data) = serde_json::from_str::<Value>(raw) else {
        return raw.to_string();
    };
    if !data.is_object() {
        return raw.to_string();
    }

    let sections = [
        ("funnel_table", "funnelTable", "Funnel Table"),
        ("funnel_visualization", "funnelVisualization", "Funnel Visualization"),
    ];

    let mut parts = Vec::new();
    for (snake, camel, label) in sections {
        let section = [snake, camel]
            .iter()
            .filter_map(|key| data.get(*key))
            .find(|v| v.as_object().is_some_and(|o| !o.is_empty()));
        if let Some(tsv) = section.and_then(report_tsv) {
            parts.push(format!("=== {label} ===\n{tsv}"));
        }
    }

    if parts.is_empty() {
        return compact_report(raw);
    }

    let result = parts.join("\n");
    log_reduction("funnel report", raw, &result);
    result
}

/// 报表形状 → TSV；不匹配返回 None
fn report_tsv(data: &Value) -> Option<String> {
    data.as_object()?;
    let dims = non_empty_array(data, "dimension_headers", "dimensionHeaders")?;
    let metrics = non_empty_array(data, "metric_headers", "metricHeaders")?;
    let rows = non_empty_array(data, "rows", "rows")?;

    let mut columns = header_names(dims);
    columns.extend(header_names(metrics));
    Some(render_table(&columns, rows, row_count(data, rows.len())))
}

fn render_table(columns: &[String], rows: &[Value], row_count: u64) -> String {
    let mut lines = Vec::with_capacity(rows.len() + 3);
    lines.push(columns.join("\t"));
    for row in rows {
        let mut cells = cell_values(array_field(row, "dimension_values", "dimensionValues"), "");
        cells.extend(cell_values(array_field(row, "metric_values", "metricValues"), ""));
        lines.push(cells.join("\t"));
    }
    lines.push("---".to_string());
    lines.push(format!("rows: {row_count}"));
    lines.join("\n")
}

/// 取第一个非空数组字段（snake 优先，其次 camel）
fn non_empty_array<'a>(data: &'a Value, snake: &str, camel: &str) -> Option<&'a [Value]> {
    [snake, camel]
        .iter()
        .filter_map(|key| data.get(*key).and_then(Value::as_array))
        .find(|arr| !arr.is_empty())
        .map(Vec::as_slice)
}

fn array_field<'a>(data: &'a Value, snake: &str, camel: &str) -> &'a [Value] {
    non_empty_array(data, snake, camel).unwrap_or(&[])
}

fn header_names(headers: &[Value]) -> Vec<String> {
    headers
        .iter()
        .map(|h| h.get("name").map(scalar_to_string).unwrap_or_default())
        .collect()
}

fn cell_values(cells: &[Value], missing: &str) -> Vec<String> {
    cells
        .iter()
        .map(|c| match c.get("value") {
            Some(v) => scalar_to_string(v),
            None => missing.to_string(),
        })
        .collect()
}

fn scalar_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// row_count / rowCount 为正数时使用，否则用实际行数
fn row_count(data: &Value, fallback: usize) -> u64 {
    ["row_count", "rowCount"]
        .iter()
        .filter_map(|key| data.get(*key))
        .filter_map(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .find(|n| *n > 0)
        .unwrap_or(fallback as u64)
}

fn log_reduction(kind: &str, raw: &str, result: &str) {
    let before = raw.chars().count();
    let after = result.chars().count();
    let reduction = 100usize.saturating_sub(after * 100 / before.max(1));
    tracing::info!(
        kind = kind,
        before = before,
        after = after,
        "compacted {}: {} -> {} chars ({}% reduction)",
        kind,
        before,
        after,
        reduction
    );
}
