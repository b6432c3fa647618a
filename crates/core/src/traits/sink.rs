use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::models::{BackupKind, DeviceId, ExecutionRecord};

/// 执行结果汇（外部协作方），只追加
#[async_trait]
pub trait ExecutionRecordSink: Send + Sync {
    async fn record(&self, record: &ExecutionRecord) -> Result<()>;
}

/// 备份存储（外部协作方）
///
/// `discard` 服务于完整性校验失败路径：损坏的副本不留在存储里。
#[async_trait]
pub trait BackupStorage: Send + Sync {
    async fn store(
        &self,
        device_id: DeviceId,
        created_at: DateTime<Utc>,
        kind: BackupKind,
        blob: &[u8],
    ) -> Result<String>;

    async fn fetch(&self, reference: &str) -> Result<Vec<u8>>;

    async fn discard(&self, reference: &str) -> Result<()>;
}
