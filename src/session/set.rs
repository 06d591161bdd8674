//! 每轮的工具服务集合：有序的适配器 + 对应的凭据位置
//!
//! `enter` 连接全部工具服务；`close` 只生效一次：逐个 teardown（失败只记日志），
//! 然后无条件删除凭据。未关闭就被丢弃时同步删除凭据并告警。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

use crate::core::ProviderError;
use crate::credentials::{CredentialHandle, CredentialMaterializer};
use crate::providers::ToolProvider;

/// 用户维度的会话记录
#[derive(Debug)]
pub(crate) struct OwnerSession {
    /// 串行化同一用户的 open_turn
    pub(crate) lock: Arc<tokio::sync::Mutex<()>>,
    pub(crate) last_used: Instant,
    pub(crate) active_turns: usize,
}

impl OwnerSession {
    pub(crate) fn new() -> Self {
        Self {
            lock: Arc::new(tokio::sync::Mutex::new(())),
            last_used: Instant::now(),
            active_turns: 0,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

pub(crate) type OwnerRegistry = Arc<Mutex<HashMap<String, OwnerSession>>>;

pub struct ProviderSet {
    turn_id: String,
    owner: String,
    providers: Vec<Arc<dyn ToolProvider>>,
    credentials: Vec<CredentialHandle>,
    materializer: Arc<CredentialMaterializer>,
    registry: OwnerRegistry,
    /// 已尝试连接的数量（包括失败的那个）
    attempted: usize,
    closed: bool,
    released: bool,
}

impl ProviderSet {
    pub(crate) fn new(
        turn_id: String,
        owner: String,
        providers: Vec<Arc<dyn ToolProvider>>,
        credentials: Vec<CredentialHandle>,
        materializer: Arc<CredentialMaterializer>,
        registry: OwnerRegistry,
    ) -> Self {
        Self {
            turn_id,
            owner,
            providers,
            credentials,
            materializer,
            registry,
            attempted: 0,
            closed: false,
            released: false,
        }
    }

    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn providers(&self) -> Vec<Arc<dyn ToolProvider>> {
        self.providers.clone()
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// 本轮凭据所在目录
    pub fn credential_dirs(&self) -> Vec<PathBuf> {
        self.credentials.iter().map(|c| c.dir().to_path_buf()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// 依次连接每个工具服务；失败时已尝试的部分留给 close 回收
    pub async fn enter(&mut self) -> Result<(), ProviderError> {
        if self.closed {
            return Err(ProviderError::NotConnected {
                name: format!("turn {}", self.turn_id),
            });
        }
        while self.attempted < self.providers.len() {
            let provider = Arc::clone(&self.providers[self.attempted]);
            self.attempted += 1;
            provider.connect().await?;
            tracing::debug!(turn_id = %self.turn_id, provider = provider.name(), "provider connected");
        }
        Ok(())
    }

    /// teardown + 删除凭据；第二次调用直接返回 false
    pub(crate) async fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;

        // connect 失败的那个也可能已经拉起了子进程
        for provider in self.providers.iter().take(self.attempted) {
            if let Err(e) = provider.teardown().await {
                tracing::warn!(turn_id = %self.turn_id, provider = provider.name(), error = %e, "provider teardown failed");
            }
        }
        self.release_credentials();
        tracing::info!(turn_id = %self.turn_id, owner = %self.owner, "turn resources closed");
        true
    }

    fn release_credentials(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for handle in self.credentials.drain(..) {
            self.materializer.release(&handle);
        }
        let mut sessions = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(session) = sessions.get_mut(&self.owner) {
            session.active_turns = session.active_turns.saturating_sub(1);
            session.touch();
        }
    }
}

impl Drop for ProviderSet {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(turn_id = %self.turn_id, owner = %self.owner, "provider set dropped without close, releasing credentials");
            self.closed = true;
            self.release_credentials();
        }
    }
}
