use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type DeviceId = i64;
pub type GroupId = i64;

/// 设备健康状态
///
/// 仅由健康检查和连接池两个子系统写入，其余组件只读。
/// 该状态对调度是建议性的：acquire 总是发起真实连接而不信任陈旧标志。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Unknown,
    Reachable,
    Unreachable,
}

/// 受管设备
///
/// 身份信息（地址、端口、协议变体）与凭据分离存放：凭据只经由
/// CredentialVault 解析，引擎自身从不落盘明文口令。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub address: String,
    pub api_port: u16,
    pub use_tls: bool,
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
}

impl Device {
    pub fn label(&self) -> String {
        format!("{}({})", self.name, self.address)
    }
}

/// 设备分组，仅在调度物化时用于目标展开
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceGroup {
    pub id: GroupId,
    pub name: String,
    pub device_ids: Vec<DeviceId>,
}

/// 设备健康读模型
///
/// 外部协作方（面板）可轮询；引擎自身不会阻塞在它上面。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceHealth {
    pub state: HealthState,
    pub last_checked_at: Option<DateTime<Utc>>,
    /// 出现认证失败后置位，提示凭据需要人工处理
    pub auth_flagged: bool,
}

impl Default for DeviceHealth {
    fn default() -> Self {
        Self {
            state: HealthState::Unknown,
            last_checked_at: None,
            auth_flagged: false,
        }
    }
}
