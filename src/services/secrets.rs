//! 密钥库
//!
//! 每个密钥一个文件（权限 0600），首次使用时生成，之后只读；
//! 重新生成必须显式调用 `regenerate`。

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{OrchestratorError, OrchestratorResult};

/// 共享数据库 root 密码
pub const MYSQL_ROOT_PASSWORD: &str = "mysql_root_password";
/// API bearer token
pub const AGENT_TOKEN: &str = "agent_token";

/// 默认密钥长度
const SECRET_LENGTH: usize = 32;

/// 生成随机字母数字串
pub fn generate_secret(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// 文件型密钥库
pub struct SecretStore {
    dir: PathBuf,
    /// 串行化创建，避免两个调用方各生成一份
    write_lock: Mutex<()>,
}

impl SecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> OrchestratorResult<PathBuf> {
        if !is_valid_name(name) {
            return Err(OrchestratorError::Secret(format!("invalid secret name '{}'", name)));
        }
        Ok(self.dir.join(name))
    }

    /// 读取密钥，不存在返回 None
    pub async fn get(&self, name: &str) -> OrchestratorResult<Option<String>> {
        let path = self.path_for(name)?;
        match fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OrchestratorError::Secret(format!("cannot read '{}': {}", name, e))),
        }
    }

    /// 存在则读取，否则生成并持久化
    pub async fn get_or_create(&self, name: &str) -> OrchestratorResult<String> {
        if let Some(value) = self.get(name).await? {
            return Ok(value);
        }

        let _guard = self.write_lock.lock().await;
        // 等锁期间可能已被其他调用方创建
        if let Some(value) = self.get(name).await? {
            return Ok(value);
        }

        let value = generate_secret(SECRET_LENGTH);
        self.write(name, &value).await?;
        info!(secret = %name, "Generated new secret");
        Ok(value)
    }

    /// 显式轮换密钥
    pub async fn regenerate(&self, name: &str) -> OrchestratorResult<String> {
        let _guard = self.write_lock.lock().await;
        let value = generate_secret(SECRET_LENGTH);
        self.write(name, &value).await?;
        info!(secret = %name, "Regenerated secret");
        Ok(value)
    }

    async fn write(&self, name: &str, value: &str) -> OrchestratorResult<()> {
        let path = self.path_for(name)?;
        let map_err = |e: std::io::Error| OrchestratorError::Secret(format!("cannot write '{}': {}", name, e));

        fs::create_dir_all(&self.dir).await.map_err(map_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o700))
                .await
                .map_err(map_err)?;
        }

        let temp_path = path.with_extension("tmp");
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&temp_path).await.map_err(map_err)?;
        file.write_all(value.as_bytes()).await.map_err(map_err)?;
        file.sync_all().await.map_err(map_err)?;
        drop(file);

        fs::rename(&temp_path, &path).await.map_err(map_err)?;
        Ok(())
    }
}
