//! 进程内静态工具服务（测试 / 演示用，无需子进程）
//!
//! 预先登记工具及其响应函数；记录每次调用的工具名与参数，以及 connect / teardown 次数。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::ProviderError;
use crate::providers::{ToolOutput, ToolProvider, ToolSpec};

type Responder = Arc<dyn Fn(&Value) -> ToolOutput + Send + Sync>;

/// 静态工具服务
pub struct StaticProvider {
    name: String,
    tools: Vec<ToolSpec>,
    responders: HashMap<String, Responder>,
    delay: Option<Duration>,
    fail_connect: bool,
    fail_teardown: bool,
    calls: Mutex<Vec<(String, Value)>>,
    connects: Arc<AtomicUsize>,
    teardowns: Arc<AtomicUsize>,
}

impl StaticProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: Vec::new(),
            responders: HashMap::new(),
            delay: None,
            fail_connect: false,
            fail_teardown: false,
            calls: Mutex::new(Vec::new()),
            connects: Arc::new(AtomicUsize::new(0)),
            teardowns: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 登记一个总是返回固定文本的工具
    pub fn with_text_tool(self, name: &str, text: impl Into<String>) -> Self {
        let text = text.into();
        self.with_tool(name, move |_| ToolOutput::text(text.clone()))
    }

    /// 登记一个自定义响应的工具
    pub fn with_tool<F>(mut self, name: &str, responder: F) -> Self
    where
        F: Fn(&Value) -> ToolOutput + Send + Sync + 'static,
    {
        self.tools.push(ToolSpec {
            name: name.to_string(),
            description: format!("static tool {name}"),
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
        });
        self.responders.insert(name.to_string(), Arc::new(responder));
        self
    }

    /// 每次调用前等待（模拟慢服务）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn failing_teardown(mut self) -> Self {
        self.fail_teardown = true;
        self
    }

    /// 已收到的调用（工具名，参数）
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// connect 计数器（可在 provider 被移入 Box 之前克隆出来观察）
    pub fn connect_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.connects)
    }

    /// teardown 计数器
    pub fn teardown_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.teardowns)
    }
}

#[async_trait]
impl ToolProvider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), ProviderError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect {
            return Err(ProviderError::Protocol {
                provider: self.name.clone(),
                message: "connect refused".to_string(),
            });
        }
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ProviderError> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, ProviderError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((name.to_string(), arguments.clone()));
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let responder = self
            .responders
            .get(name)
            .ok_or_else(|| ProviderError::ToolNotFound {
                provider: self.name.clone(),
                tool: name.to_string(),
            })?;
        Ok(responder(&arguments))
    }

    async fn teardown(&self) -> Result<(), ProviderError> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        if self.fail_teardown {
            return Err(ProviderError::Protocol {
                provider: self.name.clone(),
                message: "teardown failed".to_string(),
            });
        }
        Ok(())
    }
}
