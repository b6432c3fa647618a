use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::device::DeviceId;
use crate::models::task::BackupKind;

/// 一次已入库的设备配置备份
///
/// 只追加：同一设备的新备份只会叠加，从不覆盖旧记录。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub device_id: DeviceId,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    /// 备份存储返回的定位引用
    pub reference: String,
    /// 传输后内容的 SHA-256 摘要（十六进制）
    pub sha256: String,
}
