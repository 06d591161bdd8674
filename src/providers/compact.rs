//! 输出压缩适配器
//!
//! 对指定工具的文本输出先套用注册的压缩函数，再对所有工具统一执行字符上限：
//! 超限时按整行截断（保留前缀行，从不拆行），并追加 `kept/total` 行数与上限的脚注。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::ProviderError;
use crate::providers::{CompactorRegistry, ToolContent, ToolOutput, ToolProvider, ToolSpec};

/// 单次工具输出的默认字符上限
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 16_000;

pub struct CompactingProvider {
    inner: Box<dyn ToolProvider>,
    compactors: Arc<CompactorRegistry>,
    max_output_chars: usize,
}

impl CompactingProvider {
    pub fn new(
        inner: Box<dyn ToolProvider>,
        compactors: Arc<CompactorRegistry>,
        max_output_chars: usize,
    ) -> Self {
        Self {
            inner,
            compactors,
            max_output_chars,
        }
    }

    fn shrink(&self, tool_name: &str, text: &str) -> String {
        let compacted = self.compactors.apply(tool_name, text);
        let capped = truncate_with_counts(&compacted, self.max_output_chars);
        if let Some((kept, total)) = capped.counts {
            tracing::info!(
                tool = tool_name,
                kept_lines = kept,
                total_lines = total,
                limit = self.max_output_chars,
                "truncated tool output"
            );
        }
        capped.text
    }
}

#[async_trait]
impl ToolProvider for CompactingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn connect(&self) -> Result<(), ProviderError> {
        self.inner.connect().await
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ProviderError> {
        self.inner.list_tools().await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, ProviderError> {
        let output = self.inner.call_tool(name, arguments).await?;
        let content = output
            .content
            .into_iter()
            .map(|item| match item {
                ToolContent::Text(text) if !text.is_empty() => {
                    ToolContent::Text(self.shrink(name, &text))
                }
                other => other,
            })
            .collect();
        Ok(ToolOutput {
            content,
            is_error: output.is_error,
        })
    }

    async fn teardown(&self) -> Result<(), ProviderError> {
        self.inner.teardown().await
    }
}

/// 截断结果；`counts` 为 `(kept, total)`，未截断时为 None
struct Capped {
    text: String,
    counts: Option<(usize, usize)>,
}

/// 超过 `max_chars` 个字符时按整行截断并追加脚注；未超限原样返回
pub fn truncate_lines(text: &str, max_chars: usize) -> String {
    truncate_with_counts(text, max_chars).text
}

fn footer(kept: usize, total: usize, max_chars: usize) -> String {
    format!("---\n[truncated: showing {kept}/{total} lines, {max_chars} char limit]")
}

fn truncate_with_counts(text: &str, max_chars: usize) -> Capped {
    if text.chars().count() <= max_chars {
        return Capped {
            text: text.to_string(),
            counts: None,
        };
    }

    let lines: Vec<&str> = text.split('\n').collect();
    let total = lines.len();

    // kept <= total，按 total/total 算出的脚注长度是上界
    let reserve = footer(total, total, max_chars).chars().count();
    let budget = max_chars.saturating_sub(reserve);

    let mut kept: Vec<&str> = Vec::new();
    let mut used = 0usize;
    for line in &lines {
        let cost = line.chars().count() + 1;
        if used + cost > budget {
            break;
        }
        kept.push(line);
        used += cost;
    }

    let kept_count = kept.len();
    let mut out = kept.join("\n");
    if kept_count > 0 {
        out.push('\n');
    }
    out.push_str(&footer(kept_count, total, max_chars));
    Capped {
        text: out,
        counts: Some((kept_count, total)),
    }
}
