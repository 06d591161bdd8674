//! 会话资源管理：每轮对话的凭据 + 工具服务生命周期
//!
//! open_turn 为每个声明的工具服务落盘一份独立凭据并构造适配器
//! （输出上限总是生效；`compact` 的服务套用报表压缩；同一能力有多个服务时加前缀）。
//! close_turn 对每个 ProviderSet 只生效一次。后台清扫只是兜底：
//! 用户空闲超过阈值且没有进行中的轮次时，删除其凭据目录并移除会话记录。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::SessionError;
use crate::credentials::{CredentialHandle, CredentialMaterializer, SecretMaterial};
use crate::providers::{
    CompactingProvider, CompactorRegistry, PrefixedProvider, ToolProvider, DEFAULT_MAX_OUTPUT_CHARS,
};
use crate::session::set::{OwnerRegistry, OwnerSession};
use crate::session::{derive_prefix, Capability, ProviderFactory, ProviderSet, ProviderSpec};

/// 空闲阈值默认 10 分钟
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// 清扫间隔默认 60 秒
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    /// 单次工具输出字符上限
    pub max_output_chars: usize,
    /// 写入 `project_env` 声明的环境变量，并作为分析类凭据的配额项目
    pub project_id: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
            project_id: None,
        }
    }
}

pub struct SessionManager {
    materializer: Arc<CredentialMaterializer>,
    factory: Arc<dyn ProviderFactory>,
    specs: Vec<ProviderSpec>,
    compactors: Arc<CompactorRegistry>,
    passthrough: Arc<CompactorRegistry>,
    settings: SessionSettings,
    sessions: OwnerRegistry,
}

impl SessionManager {
    pub fn new(
        materializer: Arc<CredentialMaterializer>,
        factory: Arc<dyn ProviderFactory>,
        specs: Vec<ProviderSpec>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            materializer,
            factory,
            specs,
            compactors: Arc::new(CompactorRegistry::analytics_defaults()),
            passthrough: Arc::new(CompactorRegistry::new()),
            settings,
            sessions: OwnerRegistry::default(),
        }
    }

    pub fn with_compactors(mut self, compactors: CompactorRegistry) -> Self {
        self.compactors = Arc::new(compactors);
        self
    }

    pub fn materializer(&self) -> &Arc<CredentialMaterializer> {
        &self.materializer
    }

    pub fn specs(&self) -> &[ProviderSpec] {
        &self.specs
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, OwnerSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn owner_lock(&self, owner: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut sessions = self.registry();
        let session = sessions
            .entry(owner.to_string())
            .or_insert_with(OwnerSession::new);
        Arc::clone(&session.lock)
    }

    /// 为本轮落盘凭据并构造全部适配器；中途失败会删除已落盘的凭据
    pub async fn open_turn(
        &self,
        owner: &str,
        secret: &SecretMaterial,
    ) -> Result<ProviderSet, SessionError> {
        self.open(owner, secret, &self.specs, true).await
    }

    /// 只为某能力声明的第一个服务开一次性会话，不套输出上限与前缀（原样读取列表类结果）。
    /// 调用方用完必须 close_turn
    pub async fn open_single(
        &self,
        owner: &str,
        secret: &SecretMaterial,
        capability: Capability,
    ) -> Result<ProviderSet, SessionError> {
        let spec = self
            .specs
            .iter()
            .find(|s| s.capability == capability)
            .ok_or_else(|| SessionError::NoProvider(capability.as_str().to_string()))?;
        self.open(owner, secret, std::slice::from_ref(spec), false).await
    }

    async fn open(
        &self,
        owner: &str,
        secret: &SecretMaterial,
        specs: &[ProviderSpec],
        adapted: bool,
    ) -> Result<ProviderSet, SessionError> {
        let lock = self.owner_lock(owner);
        let _serialized = lock.lock().await;

        let turn_id = uuid::Uuid::new_v4().to_string();
        let mut per_capability: HashMap<Capability, usize> = HashMap::new();
        for spec in specs {
            *per_capability.entry(spec.capability).or_default() += 1;
        }

        let mut providers: Vec<Arc<dyn ToolProvider>> = Vec::with_capacity(specs.len());
        let mut credentials: Vec<CredentialHandle> = Vec::new();
        for (index, spec) in specs.iter().enumerate() {
            let prefix = (per_capability.get(&spec.capability).copied().unwrap_or(0) > 1)
                .then(|| derive_prefix(spec, index));
            match self.build_provider(owner, secret, spec, prefix, adapted, &mut credentials) {
                Ok(provider) => providers.push(provider),
                Err(e) => {
                    for handle in &credentials {
                        self.materializer.release(handle);
                    }
                    tracing::warn!(owner = owner, provider = %spec.label, error = %e, "open_turn failed");
                    return Err(e);
                }
            }
        }

        {
            let mut sessions = self.registry();
            let session = sessions
                .entry(owner.to_string())
                .or_insert_with(OwnerSession::new);
            session.active_turns += 1;
            session.touch();
        }

        tracing::info!(
            turn_id = %turn_id,
            owner = owner,
            providers = providers.len(),
            credentials = credentials.len(),
            "turn opened"
        );
        Ok(ProviderSet::new(
            turn_id,
            owner.to_string(),
            providers,
            credentials,
            Arc::clone(&self.materializer),
            Arc::clone(&self.sessions),
        ))
    }

    fn build_provider(
        &self,
        owner: &str,
        secret: &SecretMaterial,
        spec: &ProviderSpec,
        prefix: Option<String>,
        adapted: bool,
        credentials: &mut Vec<CredentialHandle>,
    ) -> Result<Arc<dyn ToolProvider>, SessionError> {
        let mut env = spec.env.clone();

        if let Some(var) = &spec.credential_env {
            let mut material = secret.clone();
            material.quota_project_id = match spec.capability {
                Capability::Analytics => secret
                    .quota_project_id
                    .clone()
                    .or_else(|| self.settings.project_id.clone()),
                _ => None,
            };
            let purpose = format!("{}-{}", spec.capability.as_str(), spec.label);
            let handle = self.materializer.materialize(owner, &material, &purpose)?;
            env.insert(var.clone(), handle.file_path().display().to_string());
            credentials.push(handle);
        }

        if let Some(project) = &self.settings.project_id {
            for var in &spec.project_env {
                env.insert(var.clone(), project.clone());
            }
        }

        let raw = self.factory.create(spec, env)?;
        if !adapted {
            return Ok(Arc::from(raw));
        }
        let compactors = if spec.compact {
            Arc::clone(&self.compactors)
        } else {
            Arc::clone(&self.passthrough)
        };
        let capped: Box<dyn ToolProvider> = Box::new(CompactingProvider::new(
            raw,
            compactors,
            self.settings.max_output_chars,
        ));

        if let Some(prefix) = prefix {
            tracing::debug!(provider = %spec.label, prefix = %prefix, "prefixing provider tools");
            Ok(Arc::new(PrefixedProvider::new(capped, prefix)))
        } else {
            Ok(Arc::from(capped))
        }
    }

    /// teardown 工具服务并删除凭据；同一个 set 只生效一次，返回本次是否实际执行
    pub async fn close_turn(&self, set: &mut ProviderSet) -> bool {
        set.close().await
    }

    /// 清扫空闲用户，返回被清理的 owner
    pub fn sweep_expired(&self) -> Vec<String> {
        let expired: Vec<String> = {
            let mut sessions = self.registry();
            let expired: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| {
                    s.active_turns == 0
                        && Arc::strong_count(&s.lock) == 1
                        && s.last_used.elapsed() > self.settings.idle_timeout
                })
                .map(|(owner, _)| owner.clone())
                .collect();
            // owner 目录的删除必须持锁：open_turn 先经 owner_lock 登记，再在目录下落盘
            for owner in &expired {
                sessions.remove(owner);
                self.materializer.release_owner(owner);
            }
            expired
        };

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired sessions swept");
        }
        expired
    }

    /// 周期性清扫，直到 token 取消
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.sweep_expired();
                    }
                }
            }
            tracing::debug!("session sweeper stopped");
        })
    }

    pub fn active_turns(&self, owner: &str) -> usize {
        self.registry().get(owner).map(|s| s.active_turns).unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.registry().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::core::ProviderError;
    use crate::providers::StaticProvider;

    /// 记录收到的 env，返回带固定工具的静态服务
    #[derive(Default)]
    struct RecordingFactory {
        envs: Mutex<Vec<(String, HashMap<String, String>)>>,
        fail_label: Option<String>,
    }

    impl ProviderFactory for RecordingFactory {
        fn create(
            &self,
            spec: &ProviderSpec,
            env: HashMap<String, String>,
        ) -> Result<Box<dyn ToolProvider>, ProviderError> {
            if self.fail_label.as_deref() == Some(spec.label.as_str()) {
                return Err(ProviderError::Protocol {
                    provider: spec.label.clone(),
                    message: "bad command".into(),
                });
            }
            self.envs.lock().unwrap().push((spec.label.clone(), env));
            Ok(Box::new(
                StaticProvider::new(spec.label.clone()).with_text_tool("get-posts", "x".repeat(50)),
            ))
        }
    }

    fn secret() -> SecretMaterial {
        SecretMaterial {
            client_id: "cid".into(),
            client_secret: "csecret".into(),
            refresh_token: "rt".into(),
            quota_project_id: None,
        }
    }

    fn specs() -> Vec<ProviderSpec> {
        let mut ga4 = ProviderSpec::new("ga4", Capability::Analytics, "analytics-mcp")
            .with_credential_env("GOOGLE_APPLICATION_CREDENTIALS")
            .compacted();
        ga4.project_env = vec!["GOOGLE_CLOUD_PROJECT".into()];
        vec![
            ga4,
            ProviderSpec::new("gsc", Capability::SearchConsole, "gsc-mcp").with_credential_env("GSC_TOKEN_FILE"),
            ProviderSpec::new("wordpress_achieve", Capability::ContentManagement, "wp-mcp"),
            ProviderSpec::new("wordpress", Capability::ContentManagement, "wp-mcp"),
        ]
    }

    fn manager(dir: &std::path::Path, factory: Arc<RecordingFactory>) -> SessionManager {
        SessionManager::new(
            Arc::new(CredentialMaterializer::new(dir)),
            factory,
            specs(),
            SessionSettings {
                max_output_chars: 30,
                project_id: Some("proj-1".into()),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_open_turn_materializes_and_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(RecordingFactory::default());
        let manager = manager(dir.path(), Arc::clone(&factory));

        let mut set = manager.open_turn("user-1", &secret()).await.unwrap();
        assert_eq!(
            set.provider_names(),
            vec!["ga4", "gsc", "achieve_wordpress_achieve", "p3_wordpress"]
        );
        let dirs = set.credential_dirs();
        assert_eq!(dirs.len(), 2);
        assert!(dirs.iter().all(|d| d.join("credentials.json").exists()));
        assert_eq!(manager.active_turns("user-1"), 1);

        let envs = factory.envs.lock().unwrap().clone();
        let ga4_env = &envs[0].1;
        assert_eq!(ga4_env["GOOGLE_CLOUD_PROJECT"], "proj-1");
        let ga4_record: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&ga4_env["GOOGLE_APPLICATION_CREDENTIALS"]).unwrap(),
        )
        .unwrap();
        assert_eq!(ga4_record["quota_project_id"], "proj-1");
        let gsc_record: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&envs[1].1["GSC_TOKEN_FILE"]).unwrap(),
        )
        .unwrap();
        assert!(gsc_record.get("quota_project_id").is_none());

        // 输出上限对未压缩的服务同样生效
        let providers = set.providers();
        let out = providers[2]
            .call_tool("achieve__get-posts", serde_json::Value::Null)
            .await
            .unwrap()
            .to_text();
        assert!(out.ends_with("30 char limit]"));

        assert!(manager.close_turn(&mut set).await);
        assert!(!manager.close_turn(&mut set).await);
        assert!(dirs.iter().all(|d| !d.exists()));
        assert_eq!(manager.active_turns("user-1"), 0);
    }

    #[tokio::test]
    async fn test_failed_open_releases_partial_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(RecordingFactory {
            fail_label: Some("wordpress".into()),
            ..Default::default()
        });
        let manager = manager(dir.path(), factory);

        let err = manager.open_turn("user-1", &secret()).await;
        assert!(matches!(err, Err(SessionError::Provider(_))));
        let owner_dir = dir.path().join("user-1");
        let leftover = std::fs::read_dir(&owner_dir).map(|d| d.count()).unwrap_or(0);
        assert_eq!(leftover, 0);
        assert_eq!(manager.active_turns("user-1"), 0);
    }

    #[tokio::test]
    async fn test_dropped_set_still_releases_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Arc::new(RecordingFactory::default()));
        let set = manager.open_turn("user-2", &secret()).await.unwrap();
        let dirs = set.credential_dirs();
        drop(set);
        assert!(dirs.iter().all(|d| !d.exists()));
        assert_eq!(manager.active_turns("user-2"), 0);
    }

    #[tokio::test]
    async fn test_concurrent_turns_same_owner_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(manager(dir.path(), Arc::new(RecordingFactory::default())));
        let (secret_a, secret_b) = (secret(), secret());
        let (a, b) = tokio::join!(
            manager.open_turn("user-1", &secret_a),
            manager.open_turn("user-1", &secret_b)
        );
        let (mut a, mut b) = (a.unwrap(), b.unwrap());
        let a_dirs = a.credential_dirs();
        assert!(a_dirs.iter().all(|d| !b.credential_dirs().contains(d)));
        assert_eq!(manager.active_turns("user-1"), 2);

        manager.close_turn(&mut a).await;
        assert!(b.credential_dirs().iter().all(|d| d.exists()));
        manager.close_turn(&mut b).await;
        assert_eq!(manager.active_turns("user-1"), 0);
    }

    fn assert_credentials_present(set: &ProviderSet) {
        let dirs = set.credential_dirs();
        assert_eq!(dirs.len(), 2);
        for dir in dirs {
            assert!(dir.join("credentials.json").exists(), "missing {}", dir.display());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_closing_turns_never_break_sibling_opens() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(manager(dir.path(), Arc::new(RecordingFactory::default())));

        let turns: Vec<_> = (0..32)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    for _ in 0..10 {
                        let mut set = manager.open_turn("user-1", &secret()).await.unwrap();
                        assert_credentials_present(&set);
                        tokio::task::yield_now().await;
                        assert_credentials_present(&set);
                        assert!(manager.close_turn(&mut set).await);
                    }
                })
            })
            .collect();
        for turn in turns {
            turn.await.unwrap();
        }
        assert_eq!(manager.active_turns("user-1"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sweep_never_deletes_fresh_turn_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(SessionManager::new(
            Arc::new(CredentialMaterializer::new(dir.path())),
            Arc::new(RecordingFactory::default()),
            specs(),
            SessionSettings {
                idle_timeout: Duration::ZERO,
                ..Default::default()
            },
        ));

        let sweeping = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                let mut swept = 0;
                for _ in 0..500 {
                    swept += manager.sweep_expired().len();
                    tokio::task::yield_now().await;
                }
                swept
            })
        };
        let opening: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    for _ in 0..25 {
                        let mut set = manager.open_turn("user-1", &secret()).await.unwrap();
                        tokio::task::yield_now().await;
                        assert_credentials_present(&set);
                        manager.close_turn(&mut set).await;
                    }
                })
            })
            .collect();
        for turn in opening {
            turn.await.unwrap();
        }
        sweeping.await.unwrap();
        assert_eq!(manager.active_turns("user-1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_skips_owner_with_open_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Arc::new(RecordingFactory::default()));
        let mut set = manager.open_turn("user-1", &secret()).await.unwrap();
        manager.close_turn(&mut set).await;
        tokio::time::advance(DEFAULT_IDLE_TIMEOUT + Duration::from_secs(1)).await;

        // open_turn 已拿到 owner 锁、尚未登记 active_turns
        let pending = manager.owner_lock("user-1");
        assert!(manager.sweep_expired().is_empty());
        drop(pending);
        assert_eq!(manager.sweep_expired(), vec!["user-1".to_string()]);
        assert!(!dir.path().join("user-1").exists());
    }

    #[tokio::test]
    async fn test_open_single_is_unadapted_and_closed_once() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(RecordingFactory::default());
        let manager = manager(dir.path(), Arc::clone(&factory));

        let mut set = manager
            .open_single("user-1", &secret(), Capability::ContentManagement)
            .await
            .unwrap();
        assert_eq!(set.provider_names(), vec!["wordpress_achieve"]);
        assert!(set.credential_dirs().is_empty());
        let out = set.providers()[0]
            .call_tool("get-posts", serde_json::Value::Null)
            .await
            .unwrap()
            .to_text();
        assert_eq!(out.len(), 50);
        assert_eq!(manager.active_turns("user-1"), 1);
        assert!(manager.close_turn(&mut set).await);
        assert_eq!(manager.active_turns("user-1"), 0);

        let none = SessionManager::new(
            Arc::new(CredentialMaterializer::new(dir.path())),
            factory,
            vec![],
            SessionSettings::default(),
        )
        .open_single("user-1", &secret(), Capability::Ads)
        .await;
        assert!(matches!(none, Err(SessionError::NoProvider(c)) if c == "ads"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_only_removes_idle_owners() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Arc::new(RecordingFactory::default()));

        let mut idle = manager.open_turn("idle-user", &secret()).await.unwrap();
        manager.close_turn(&mut idle).await;
        let busy = manager.open_turn("busy-user", &secret()).await.unwrap();

        assert!(manager.sweep_expired().is_empty());
        tokio::time::advance(DEFAULT_IDLE_TIMEOUT + Duration::from_secs(1)).await;

        assert_eq!(manager.sweep_expired(), vec!["idle-user".to_string()]);
        assert_eq!(manager.session_count(), 1);
        assert!(busy.credential_dirs().iter().all(|d| d.exists()));
        drop(busy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(manager(dir.path(), Arc::new(RecordingFactory::default())));
        let token = CancellationToken::new();
        let handle = manager.spawn_sweeper(DEFAULT_SWEEP_INTERVAL, token.clone());
        tokio::time::advance(DEFAULT_SWEEP_INTERVAL * 2).await;
        token.cancel();
        handle.await.unwrap();
    }
}
