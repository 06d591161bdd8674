//! 凭据落盘：为每轮对话的工具服务子进程写入短期凭据文件
//!
//! 目录结构：`<base_dir>/<owner>/<purpose>-<session_token>/credentials.json`。
//! 每次 materialize 都生成新的 session_token 子目录，同一用户的并发轮次、不同用途（GA4 / GSC / Ads）
//! 永远不会共享路径；子进程后台刷新 token 改写凭据文件时不会互相覆盖。

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::CredentialError;

/// 凭据文件名（工具服务通过环境变量拿到完整路径）
pub const CREDENTIALS_FILE_NAME: &str = "credentials.json";

/// 调用方提供的秘密材料（OAuth 获取与刷新在外部完成）
#[derive(Clone, Deserialize)]
pub struct SecretMaterial {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    /// 配额项目（仅部分能力需要）
    #[serde(default)]
    pub quota_project_id: Option<String>,
}

impl std::fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretMaterial")
            .field("client_id", &self.client_id)
            .field("quota_project_id", &self.quota_project_id)
            .finish_non_exhaustive()
    }
}

/// 写入磁盘的凭据记录（authorized_user 格式）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_project_id: Option<String>,
}

impl CredentialRecord {
    pub fn authorized_user(secret: &SecretMaterial) -> Self {
        Self {
            kind: "authorized_user".to_string(),
            client_id: secret.client_id.clone(),
            client_secret: secret.client_secret.clone(),
            refresh_token: secret.refresh_token.clone(),
            quota_project_id: secret
                .quota_project_id
                .clone()
                .filter(|p| !p.is_empty()),
        }
    }
}

/// 一次 materialize 的结果：归属、用途、唯一 token 与落盘位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialHandle {
    pub owner: String,
    pub purpose: String,
    pub session_token: String,
    dir: PathBuf,
}

impl CredentialHandle {
    /// 本次会话独占的子目录
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 凭据文件路径（传给子进程）
    pub fn file_path(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE_NAME)
    }
}

/// 凭据落盘器：持有根目录，负责写入、删除与全量清理
#[derive(Debug, Clone)]
pub struct CredentialMaterializer {
    base_dir: PathBuf,
}

impl CredentialMaterializer {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// 默认根目录：系统临时目录下的 tapline-credentials
    pub fn default_base_dir() -> PathBuf {
        std::env::temp_dir().join("tapline-credentials")
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// 写入一份 owner + purpose 作用域的凭据，返回新的唯一位置
    pub fn materialize(
        &self,
        owner: &str,
        secret: &SecretMaterial,
        purpose: &str,
    ) -> Result<CredentialHandle, CredentialError> {
        let session_token = uuid::Uuid::new_v4().simple().to_string();
        let dir = self
            .base_dir
            .join(sanitize_segment(owner))
            .join(format!("{}-{}", sanitize_segment(purpose), session_token));

        create_private_dir(&dir)?;

        let record = CredentialRecord::authorized_user(secret);
        let body = serde_json::to_vec(&record)?;
        let path = dir.join(CREDENTIALS_FILE_NAME);
        write_private_file(&path, &body)?;

        tracing::debug!(
            owner = owner,
            purpose = purpose,
            path = %path.display(),
            "credential materialized"
        );

        Ok(CredentialHandle {
            owner: owner.to_string(),
            purpose: purpose.to_string(),
            session_token,
            dir,
        })
    }

    /// 删除子目录及其下全部文件；已不存在视为成功。
    /// owner 目录保留，同一用户并发的 materialize 可能正在其下建目录；由空闲清扫删除
    pub fn release(&self, handle: &CredentialHandle) {
        match fs::remove_dir_all(&handle.dir) {
            Ok(()) => {
                tracing::debug!(owner = %handle.owner, purpose = %handle.purpose, "credential released");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    path = %handle.dir.display(),
                    error = %e,
                    "failed to release credential directory"
                );
            }
        }
    }

    /// 删除某个用户的全部凭据（空闲清扫时调用，收拾异常退出的轮次留下的目录）
    pub fn release_owner(&self, owner: &str) {
        let dir = self.base_dir.join(sanitize_segment(owner));
        match fs::remove_dir_all(&dir) {
            Ok(()) => tracing::debug!(owner = owner, "owner credentials released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %dir.display(), error = %e, "failed to release owner credentials"),
        }
    }

    /// 清空整个根目录（进程关闭时调用）
    pub fn cleanup_all(&self) -> std::io::Result<()> {
        match fs::remove_dir_all(&self.base_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// 路径片段只保留 [A-Za-z0-9_-]，防止 owner / purpose 逃逸出根目录
fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

fn create_private_dir(dir: &Path) -> Result<(), CredentialError> {
    let map_err = |source| CredentialError::Prepare {
        path: dir.to_path_buf(),
        source,
    };
    fs::create_dir_all(dir).map_err(map_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700)).map_err(map_err)?;
    }
    Ok(())
}

fn write_private_file(path: &Path, body: &[u8]) -> Result<(), CredentialError> {
    let map_err = |source| CredentialError::Write {
        path: path.to_path_buf(),
        source,
    };
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(map_err)?;
    file.write_all(body).map_err(map_err)?;
    file.flush().map_err(map_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> SecretMaterial {
        SecretMaterial {
            client_id: "cid".to_string(),
            client_secret: "csecret".to_string(),
            refresh_token: "rtoken".to_string(),
            quota_project_id: Some("proj-1".to_string()),
        }
    }

    #[test]
    fn test_materialize_writes_authorized_user_record() {
        let tmp = tempfile::tempdir().unwrap();
        let materializer = CredentialMaterializer::new(tmp.path());
        let handle = materializer.materialize("user_1", &secret(), "analytics").unwrap();

        let raw = fs::read_to_string(handle.file_path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "authorized_user");
        assert_eq!(value["client_id"], "cid");
        assert_eq!(value["client_secret"], "csecret");
        assert_eq!(value["refresh_token"], "rtoken");
        assert_eq!(value["quota_project_id"], "proj-1");
    }

    #[test]
    fn test_quota_project_omitted_when_empty() {
        let mut s = secret();
        s.quota_project_id = Some(String::new());
        let record = CredentialRecord::authorized_user(&s);
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("quota_project_id").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_credential_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let materializer = CredentialMaterializer::new(tmp.path());
        let handle = materializer.materialize("user_1", &secret(), "analytics").unwrap();

        let mode = fs::metadata(handle.file_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_same_owner_same_purpose_never_collides() {
        let tmp = tempfile::tempdir().unwrap();
        let materializer = CredentialMaterializer::new(tmp.path());

        let handles: Vec<CredentialHandle> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| materializer.materialize("user_1", &secret(), "analytics").unwrap()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let mut dirs: Vec<PathBuf> = handles.iter().map(|h| h.dir().to_path_buf()).collect();
        dirs.sort();
        dirs.dedup();
        assert_eq!(dirs.len(), 8);
        for handle in &handles {
            assert!(handle.file_path().exists());
        }
    }

    #[test]
    fn test_release_is_idempotent_and_keeps_siblings() {
        let tmp = tempfile::tempdir().unwrap();
        let materializer = CredentialMaterializer::new(tmp.path());
        let ga4 = materializer.materialize("user_1", &secret(), "analytics").unwrap();
        let gsc = materializer.materialize("user_1", &secret(), "search_console").unwrap();

        materializer.release(&ga4);
        materializer.release(&ga4);

        assert!(!ga4.dir().exists());
        assert!(gsc.file_path().exists());

        materializer.release(&gsc);
        let owner_dir = tmp.path().join("user_1");
        assert_eq!(fs::read_dir(&owner_dir).unwrap().count(), 0);

        materializer.release_owner("user_1");
        assert!(!owner_dir.exists());
    }

    #[test]
    fn test_release_never_breaks_sibling_materialize() {
        let tmp = tempfile::tempdir().unwrap();
        let materializer = CredentialMaterializer::new(tmp.path());

        std::thread::scope(|scope| {
            let releasing = scope.spawn(|| {
                for _ in 0..500 {
                    let handle = materializer.materialize("u", &secret(), "a").unwrap();
                    materializer.release(&handle);
                }
            });
            let writing = scope.spawn(|| {
                for _ in 0..500 {
                    let handle = materializer.materialize("u", &secret(), "b").unwrap();
                    assert!(handle.file_path().exists());
                    materializer.release(&handle);
                }
            });
            releasing.join().unwrap();
            writing.join().unwrap();
        });
    }

    #[test]
    fn test_owner_cannot_escape_base_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let materializer = CredentialMaterializer::new(tmp.path());
        let handle = materializer.materialize("../../etc", &secret(), "a/b").unwrap();
        assert!(handle.dir().starts_with(tmp.path()));
        assert_eq!(handle.dir().parent().unwrap(), tmp.path().join("______etc"));
    }

    #[test]
    fn test_cleanup_all_tolerates_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        let materializer = CredentialMaterializer::new(tmp.path().join("missing"));
        assert!(materializer.cleanup_all().is_ok());
    }
}
