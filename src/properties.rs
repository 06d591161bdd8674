//! 账号资源列表：一次性打开单个工具服务，调用一个列表工具后立即回收
//!
//! 分析属性来自 `get_account_summaries`（JSON，兼容 snake_case / camelCase），
//! Search Console 站点来自 `list_properties`（Markdown：`- **{site}** (Permission: {level})`）。
//! 服务没有对应工具时返回空列表；无论成功与否凭据都会删除。

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::core::{ProviderError, SessionError};
use crate::credentials::SecretMaterial;
use crate::providers::ToolContent;
use crate::session::{Capability, ProviderSet, SessionManager};

pub const ACCOUNT_SUMMARIES_TOOL: &str = "get_account_summaries";
pub const SITE_LIST_TOOL: &str = "list_properties";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AnalyticsProperty {
    pub property_id: String,
    pub property_name: String,
    pub account_name: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchConsoleSite {
    pub site_url: String,
    pub permission_level: String,
}

/// 列出用户可访问的分析属性
pub async fn list_analytics_properties(
    sessions: &SessionManager,
    owner: &str,
    secret: &SecretMaterial,
) -> Result<Vec<AnalyticsProperty>, SessionError> {
    let texts = call_list_tool(sessions, owner, secret, Capability::Analytics, ACCOUNT_SUMMARIES_TOOL).await?;
    let mut properties = Vec::new();
    for text in texts {
        let data: Value = serde_json::from_str(&text).map_err(|e| ProviderError::Protocol {
            provider: Capability::Analytics.as_str().to_string(),
            message: format!("unreadable account summaries: {e}"),
        })?;
        properties.extend(parse_account_summaries(&data));
    }
    tracing::info!(owner = owner, count = properties.len(), "analytics properties listed");
    Ok(properties)
}

/// 列出用户可访问的 Search Console 站点
pub async fn list_search_console_sites(
    sessions: &SessionManager,
    owner: &str,
    secret: &SecretMaterial,
) -> Result<Vec<SearchConsoleSite>, SessionError> {
    let texts = call_list_tool(sessions, owner, secret, Capability::SearchConsole, SITE_LIST_TOOL).await?;
    let sites: Vec<SearchConsoleSite> = texts.iter().flat_map(|t| parse_site_list(t)).collect();
    tracing::info!(owner = owner, count = sites.len(), "search console sites listed");
    Ok(sites)
}

/// 打开单服务会话，有该工具时调用一次，返回文本内容；会话总是关闭
async fn call_list_tool(
    sessions: &SessionManager,
    owner: &str,
    secret: &SecretMaterial,
    capability: Capability,
    tool: &str,
) -> Result<Vec<String>, SessionError> {
    let mut set = sessions.open_single(owner, secret, capability).await?;
    let result = read_list(&mut set, tool).await;
    sessions.close_turn(&mut set).await;
    Ok(result?)
}

async fn read_list(set: &mut ProviderSet, tool: &str) -> Result<Vec<String>, ProviderError> {
    set.enter().await?;
    let Some(provider) = set.providers().into_iter().next() else {
        return Ok(Vec::new());
    };
    let tools = provider.list_tools().await?;
    if !tools.iter().any(|t| t.name == tool) {
        tracing::debug!(provider = provider.name(), tool = tool, "list tool not offered");
        return Ok(Vec::new());
    }
    let output = provider
        .call_tool(tool, Value::Object(Default::default()))
        .await?;
    Ok(output
        .content
        .into_iter()
        .filter_map(|c| match c {
            ToolContent::Text(text) => Some(text),
            ToolContent::Other(_) => None,
        })
        .collect())
}

fn field<'a>(value: &'a Value, snake: &str, camel: &str) -> Option<&'a Value> {
    value.get(snake).or_else(|| value.get(camel))
}

fn text_field(value: &Value, snake: &str, camel: &str) -> String {
    field(value, snake, camel)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// 账号摘要 → 属性列表；接受单个账号、`account_summaries` 包装或账号数组
pub fn parse_account_summaries(data: &Value) -> Vec<AnalyticsProperty> {
    let accounts: Vec<&Value> = match data {
        Value::Object(_) if field(data, "property_summaries", "propertySummaries").is_some() => vec![data],
        Value::Object(_) => field(data, "account_summaries", "accountSummaries")
            .and_then(Value::as_array)
            .map(|a| a.iter().collect())
            .unwrap_or_default(),
        Value::Array(items) => items.iter().collect(),
        _ => Vec::new(),
    };

    let mut properties = Vec::new();
    for account in accounts {
        let mut account_name = text_field(account, "display_name", "displayName");
        if account_name.is_empty() {
            account_name = text_field(account, "account", "account");
        }
        let summaries = field(account, "property_summaries", "propertySummaries")
            .and_then(Value::as_array);
        for prop in summaries.into_iter().flatten() {
            properties.push(AnalyticsProperty {
                property_id: text_field(prop, "property", "property"),
                property_name: text_field(prop, "display_name", "displayName"),
                account_name: account_name.clone(),
            });
        }
    }
    properties
}

fn site_pattern() -> Option<&'static Regex> {
    static SITE_RE: OnceLock<Option<Regex>> = OnceLock::new();
    SITE_RE
        .get_or_init(|| Regex::new(r"\*\*(.+?)\*\*\s*\(Permission:\s*(\w+)\)").ok())
        .as_ref()
}

/// Markdown 站点列表 → 站点与权限
pub fn parse_site_list(text: &str) -> Vec<SearchConsoleSite> {
    let Some(re) = site_pattern() else {
        return Vec::new();
    };
    re.captures_iter(text)
        .map(|c| SearchConsoleSite {
            site_url: c[1].to_string(),
            permission_level: c[2].to_string(),
        })
        .collect()
}
