//! JSON 文件持久化
//!
//! 注册表和租户台账都保存为带版本号的 JSON 文档，写入走临时文件 + 原子重命名

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

/// 当前文档格式版本
const DOCUMENT_VERSION: u32 = 1;

/// 持久化文档
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedDocument<T> {
    /// 版本号（用于未来格式升级）
    pub version: u32,
    /// 保存时间
    pub saved_at: DateTime<Utc>,
    pub data: T,
}

/// 从文件加载文档；文件不存在返回 None，内容损坏返回错误（不静默丢弃已有状态）
pub async fn load<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    match serde_json::from_str::<PersistedDocument<T>>(&content) {
        Ok(doc) => {
            if doc.version != DOCUMENT_VERSION {
                warn!(
                    path = %path.display(),
                    version = doc.version,
                    "Persisted document has unexpected version"
                );
            }
            info!(path = %path.display(), saved_at = %doc.saved_at, "Loaded persisted document");
            Ok(Some(doc.data))
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to parse persisted document");
            Err(io::Error::new(io::ErrorKind::InvalidData, e))
        }
    }
}

/// 保存文档（原子写入），文件权限收紧为仅属主可读写
pub async fn save<T: Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let temp_path = path.with_extension("json.tmp");

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let doc = PersistedDocument {
        version: DOCUMENT_VERSION,
        saved_at: Utc::now(),
        data,
    };
    let content = serde_json::to_string_pretty(&doc).map_err(io::Error::other)?;

    fs::write(&temp_path, &content).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    fs::rename(&temp_path, path).await?;
    Ok(())
}
