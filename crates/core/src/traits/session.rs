use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::models::AddressListEntry;
use crate::traits::vault::DeviceEndpoint;

/// 一次命令调用返回的回复行集合（`!re` 句子的属性映射）
pub type CommandReply = Vec<BTreeMap<String, String>>;

/// 设备侧逐条拒绝的明细
///
/// 连接级故障走 Err 通道；单条目被设备理解但拒绝时走这里，
/// 由核对器在复读校验阶段折算成剩余差异。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRejection {
    pub address: String,
    pub op: EntryOp,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryOp {
    Add,
    Remove,
}

/// 设备协议会话
///
/// 执行器与核对器只依赖这组抽象操作，具体线上编码完全留在
/// 协议适配层。所有调用都是带超时的同步等待，从不无界阻塞。
#[async_trait]
pub trait DeviceSession: Send {
    /// 执行一条命令。`args` 中以 `?` 开头的键按查询词下发，
    /// 其余按属性词下发。
    async fn execute(&mut self, command: &str, args: &[(String, String)]) -> Result<CommandReply>;

    /// 读取指定地址列表的当前成员
    async fn query_address_list(&mut self, list: &str) -> Result<Vec<AddressListEntry>>;

    /// 应用一批增删。逐条应用：值已存在的 add 与已缺失的 remove
    /// 是无操作；设备逐条拒绝的以 EntryRejection 返回而不中断批次。
    async fn mutate_address_list(
        &mut self,
        list: &str,
        adds: &[AddressListEntry],
        removes: &[String],
    ) -> Result<Vec<EntryRejection>>;

    /// 会话是否仍可归还连接池复用
    fn is_usable(&self) -> bool;

    /// 主动作废会话（例如重启指令送达后），归还时将被连接池丢弃
    fn invalidate(&mut self);
}

/// 会话工厂：按端点建立新会话
///
/// 独立成 trait 是为了让测试注入假设备。
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, endpoint: &DeviceEndpoint) -> Result<Box<dyn DeviceSession>>;
}
