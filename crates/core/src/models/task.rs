use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::models::address_list::ListSemantics;
use crate::models::device::{DeviceId, GroupId};
use crate::models::schedule::Schedule;

pub type TaskId = i64;

/// 任务定义
///
/// 不可变：操作方只会用新版本整体替换，引擎内部从不修改。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub action: Action,
    pub target: Target,
    pub schedule: Schedule,
    /// 单次执行的墙钟超时（秒）
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// 瞬时失败后的最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_timeout_seconds() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_enabled() -> bool {
    true
}

impl Task {
    /// 装载期校验：非法调度表达式在这里被拒绝，不留到触发时刻
    pub fn validate(&self) -> Result<()> {
        self.schedule.validate()
    }
}

/// 任务动作，闭合集合
///
/// 刻意不做开放式的"执行任意东西"分发面，保持执行器契约有限可测。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// 逐行下发 RouterOS 命令
    RunScript { script: String },
    /// 地址列表增删，由核对器计算并应用最小差异
    MutateAddressList {
        list: String,
        /// 缺省时按已知列表名推断
        #[serde(default)]
        semantics: Option<ListSemantics>,
        #[serde(default)]
        add: Vec<String>,
        #[serde(default)]
        remove: Vec<String>,
        #[serde(default)]
        comment: Option<String>,
    },
    /// 设备侧快照并回传到备份存储
    Backup {
        #[serde(default, rename = "backup_kind")]
        kind: BackupKind,
    },
    /// 重启，发后不等，宽限期后复查健康
    Reboot,
}

impl Action {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Action::RunScript { .. } => "run_script",
            Action::MutateAddressList { .. } => "mutate_address_list",
            Action::Backup { .. } => "backup",
            Action::Reboot => "reboot",
        }
    }
}

/// 备份形式：二进制快照或导出脚本
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    #[default]
    Backup,
    Export,
}

impl BackupKind {
    pub fn file_extension(self) -> &'static str {
        match self {
            BackupKind::Backup => "backup",
            BackupKind::Export => "rsc",
        }
    }
}

/// 任务目标：设备清单或设备分组，物化时展开为具体设备集合
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Devices(Vec<DeviceId>),
    Group(GroupId),
}
