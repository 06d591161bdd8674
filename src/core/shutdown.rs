//! 优雅关闭
//!
//! 统一监听关闭信号，然后依次执行注册的清理任务（每个任务单独限时）：
//! 停止会话清扫任务、清空凭据根目录。进行中的轮次通过各自的 close_turn 回收。

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::credentials::CredentialMaterializer;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    /// 关闭信号 token
    shutdown_token: CancellationToken,
    /// 关闭原因广播
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// 用户发起的退出 (Ctrl+C)
    UserInitiated,
    /// SIGTERM 信号
    Signal,
    /// 致命错误
    FatalError(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 获取关闭 token（交给后台任务）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// 触发关闭
    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// 订阅关闭原因
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    /// 等待关闭信号
    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理任务
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    /// 单个清理任务的超时时间（秒）
    timeout_secs: u64,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout_secs: 5,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 执行所有清理任务；失败或超时只记日志
    pub async fn run_cleanup(&self) {
        tracing::info!(tasks = self.cleanup_tasks.len(), "running cleanup tasks");

        let timeout = tokio::time::Duration::from_secs(self.timeout_secs);

        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!(task = name, "cleanup task completed");
                }
                Ok(Err(e)) => {
                    tracing::warn!(task = name, error = %format!("{e:#}"), "cleanup task failed");
                }
                Err(_) => {
                    tracing::warn!(task = name, timeout_secs = self.timeout_secs, "cleanup task timed out");
                }
            }
        }

        tracing::info!("All cleanup tasks finished");
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 清空凭据根目录
pub struct CredentialCleanup {
    materializer: Arc<CredentialMaterializer>,
}

impl CredentialCleanup {
    pub fn new(materializer: Arc<CredentialMaterializer>) -> Self {
        Self { materializer }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for CredentialCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.materializer.cleanup_all().with_context(|| {
            format!(
                "failed to remove credential root {}",
                self.materializer.base_dir().display()
            )
        })
    }

    fn name(&self) -> &'static str {
        "Credentials"
    }
}

/// 停止后台清扫任务并等待其退出
pub struct SweeperCleanup {
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SweeperCleanup {
    pub fn new(token: CancellationToken, handle: JoinHandle<()>) -> Self {
        Self {
            token,
            handle: Mutex::new(Some(handle)),
        }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for SweeperCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.token.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            handle.await.context("session sweeper task failed")?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SessionSweeper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_manager_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!token.is_cancelled());
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(token.is_cancelled());
        assert!(manager.is_shutdown());
    }

    #[tokio::test]
    async fn test_coordinator_wipes_credentials_and_stops_sweeper() {
        let tmp = tempfile::tempdir().unwrap();
        let materializer = Arc::new(CredentialMaterializer::new(tmp.path().join("creds")));
        let secret = crate::credentials::SecretMaterial {
            client_id: "c".into(),
            client_secret: "s".into(),
            refresh_token: "r".into(),
            quota_project_id: None,
        };
        let handle = materializer.materialize("user-1", &secret, "analytics").unwrap();

        let token = CancellationToken::new();
        let sweeper_token = token.clone();
        let sweeper = tokio::spawn(async move { sweeper_token.cancelled().await });

        let mut coordinator = ShutdownCoordinator::new(Arc::new(ShutdownManager::new()));
        coordinator.register(SweeperCleanup::new(token.clone(), sweeper));
        coordinator.register(CredentialCleanup::new(Arc::clone(&materializer)));
        coordinator.run_cleanup().await;

        assert!(token.is_cancelled());
        assert!(!handle.dir().exists());
        assert!(!tmp.path().join("creds").exists());
    }
}
