//! 推理摘要翻译
//!
//! 翻译在消费端同步执行（与事件投递串行）；失败或空输出一律回退原文，永远不会让本轮失败。

use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message};
use crate::stream::StreamEvent;

#[async_trait]
pub trait Translator: Send + Sync {
    /// 返回译文；无法翻译时返回原文
    async fn translate(&self, text: &str) -> String;
}

/// 未配置目标语言时使用：原样返回
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTranslator;

#[async_trait]
impl Translator for NoopTranslator {
    async fn translate(&self, text: &str) -> String {
        text.to_string()
    }
}

/// 调用 LLM 翻译到目标语言
pub struct LlmTranslator {
    llm: Arc<dyn LlmClient>,
    language: String,
}

impl LlmTranslator {
    pub fn new(llm: Arc<dyn LlmClient>, language: impl Into<String>) -> Self {
        Self {
            llm,
            language: language.into(),
        }
    }
}

#[async_trait]
impl Translator for LlmTranslator {
    async fn translate(&self, text: &str) -> String {
        let messages = [
            Message::system(format!(
                "Translate the user's text into {}. Output only the translation.",
                self.language
            )),
            Message::user(text),
        ];
        match self.llm.complete(&messages).await {
            Ok(out) if !out.trim().is_empty() => out.trim().to_string(),
            Ok(_) => text.to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "translation failed, keeping original text");
                text.to_string()
            }
        }
    }
}

/// 对待翻译的推理事件执行翻译并清除标记；其余事件原样返回
pub async fn translate_pending(translator: &dyn Translator, event: StreamEvent) -> StreamEvent {
    match event {
        StreamEvent::Reasoning {
            content,
            has_summary,
            needs_translation: true,
        } => StreamEvent::Reasoning {
            content: translator.translate(&content).await,
            has_summary,
            needs_translation: false,
        },
        other => other,
    }
}
