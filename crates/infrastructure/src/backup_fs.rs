//! 文件系统备份存储
//!
//! 目录布局沿用 `<根>/device_<id>/<时间戳>.<扩展名>`，只追加；
//! `discard` 专供完整性校验失败路径删除损坏副本。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mikrofleet_core::{BackupKind, BackupStorage, DeviceId, FleetError, Result};

pub struct FsBackupStorage {
    root: PathBuf,
}

impl FsBackupStorage {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn resolve(&self, reference: &str) -> PathBuf {
        self.root.join(reference)
    }
}

#[async_trait]
impl BackupStorage for FsBackupStorage {
    async fn store(
        &self,
        device_id: DeviceId,
        created_at: DateTime<Utc>,
        kind: BackupKind,
        blob: &[u8],
    ) -> Result<String> {
        let reference = format!(
            "device_{device_id}/{}.{}",
            created_at.format("%Y%m%dT%H%M%SZ"),
            kind.file_extension()
        );
        let path = self.resolve(&reference);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                FleetError::Storage(format!("创建备份目录 {} 失败: {e}", parent.display()))
            })?;
        }
        tokio::fs::write(&path, blob)
            .await
            .map_err(|e| FleetError::Storage(format!("写入备份 {} 失败: {e}", path.display())))?;
        Ok(reference)
    }

    async fn fetch(&self, reference: &str) -> Result<Vec<u8>> {
        let path = self.resolve(reference);
        tokio::fs::read(&path)
            .await
            .map_err(|e| FleetError::Storage(format!("读取备份 {} 失败: {e}", path.display())))
    }

    async fn discard(&self, reference: &str) -> Result<()> {
        let path = self.resolve(reference);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| FleetError::Storage(format!("删除备份 {} 失败: {e}", path.display())))
    }
}
