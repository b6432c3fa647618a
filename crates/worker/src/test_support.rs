//! 测试用的内存假设备与假存储

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mikrofleet_core::{
    AddressListEntry, BackupKind, BackupStorage, CancelFlag, CommandReply, DeviceEndpoint,
    DeviceId, DeviceSession, EntryOp, EntryRejection, FleetError, HealthProbe, HealthState,
    Result,
};

/// 内存假设备会话
///
/// 记录操作顺序（`query:`/`add:`/`remove:`/`exec:` 前缀），并支持
/// 注入逐条拒绝、静默丢弃与命令级故障。
#[derive(Default)]
pub struct MockSession {
    pub lists: HashMap<String, Vec<AddressListEntry>>,
    pub ops: Vec<String>,
    /// 设备逐条拒绝这些地址的新增
    pub reject_adds: HashSet<String>,
    /// 设备"接受"但实际不落地这些新增
    pub drop_adds: HashSet<String>,
    /// 按命令路径预置的回复
    pub exec_responses: HashMap<String, CommandReply>,
    /// 按命令路径注入故障："timeout" | "reset" | "reject"
    pub fail_commands: HashMap<String, &'static str>,
    pub usable: bool,
    /// 第一次增删批次完成后触发取消（测试批次边界语义）
    pub cancel_after_first_mutation: Option<CancelFlag>,
    next_id: u32,
}

impl MockSession {
    pub fn new() -> Self {
        Self {
            usable: true,
            ..Self::default()
        }
    }

    pub fn with_list(list: &str, addresses: &[&str]) -> Self {
        let mut session = Self::new();
        let entries = addresses
            .iter()
            .enumerate()
            .map(|(i, address)| {
                let mut entry = AddressListEntry::new(list, *address);
                entry.id = Some(format!("*{i}"));
                entry
            })
            .collect();
        session.lists.insert(list.to_string(), entries);
        session.next_id = addresses.len() as u32;
        session
    }

    pub fn membership(&self, list: &str) -> BTreeSet<String> {
        self.entries(list)
            .iter()
            .map(|entry| entry.address.clone())
            .collect()
    }

    pub fn entries(&self, list: &str) -> Vec<AddressListEntry> {
        self.lists.get(list).cloned().unwrap_or_default()
    }

    fn fail_for(&self, command: &str) -> Option<FleetError> {
        match self.fail_commands.get(command) {
            Some(&"timeout") => Some(FleetError::Timeout {
                operation: command.to_string(),
            }),
            Some(&"reset") => Some(FleetError::ConnectionReset(command.to_string())),
            Some(&"reject") => Some(FleetError::CommandRejected {
                message: format!("rejected: {command}"),
            }),
            _ => None,
        }
    }
}

#[async_trait]
impl DeviceSession for MockSession {
    async fn execute(&mut self, command: &str, args: &[(String, String)]) -> Result<CommandReply> {
        self.ops.push(format!("exec:{command}"));
        if let Some(err) = self.fail_for(command) {
            if err.poisons_session() {
                self.usable = false;
            }
            return Err(err);
        }
        let _ = args;
        Ok(self.exec_responses.get(command).cloned().unwrap_or_default())
    }

    async fn query_address_list(&mut self, list: &str) -> Result<Vec<AddressListEntry>> {
        self.ops.push(format!("query:{list}"));
        Ok(self.entries(list))
    }

    async fn mutate_address_list(
        &mut self,
        list: &str,
        adds: &[AddressListEntry],
        removes: &[String],
    ) -> Result<Vec<EntryRejection>> {
        let mut rejections = Vec::new();

        for entry in adds {
            self.ops.push(format!("add:{}", entry.address));
            if self.reject_adds.contains(&entry.address) {
                rejections.push(EntryRejection {
                    address: entry.address.clone(),
                    op: EntryOp::Add,
                    reason: "invalid entry".to_string(),
                });
                continue;
            }
            if self.drop_adds.contains(&entry.address) {
                continue;
            }
            let slot = self.lists.entry(list.to_string()).or_default();
            if slot.iter().any(|e| e.address == entry.address) {
                continue;
            }
            self.next_id += 1;
            let mut stored = entry.clone();
            stored.id = Some(format!("*{}", self.next_id));
            slot.push(stored);
        }

        for address in removes {
            self.ops.push(format!("remove:{address}"));
            if let Some(slot) = self.lists.get_mut(list) {
                slot.retain(|e| &e.address != address);
            }
        }

        if let Some(cancel) = &self.cancel_after_first_mutation {
            cancel.cancel();
        }

        Ok(rejections)
    }

    fn is_usable(&self) -> bool {
        self.usable
    }

    fn invalidate(&mut self) {
        self.usable = false;
    }
}

/// 内存备份存储，可注入取回时的内容篡改
#[derive(Default)]
pub struct MemoryBackupStorage {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    pub corrupt_on_fetch: bool,
    pub discarded: Mutex<Vec<String>>,
}

impl MemoryBackupStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn corrupting() -> Self {
        Self {
            corrupt_on_fetch: true,
            ..Self::default()
        }
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.blobs.lock().unwrap().contains_key(reference)
    }
}

#[async_trait]
impl BackupStorage for MemoryBackupStorage {
    async fn store(
        &self,
        device_id: DeviceId,
        created_at: DateTime<Utc>,
        kind: BackupKind,
        blob: &[u8],
    ) -> Result<String> {
        let reference = format!(
            "mem://device_{device_id}/{}.{}",
            created_at.timestamp(),
            kind.file_extension()
        );
        self.blobs
            .lock()
            .unwrap()
            .insert(reference.clone(), blob.to_vec());
        Ok(reference)
    }

    async fn fetch(&self, reference: &str) -> Result<Vec<u8>> {
        let blob = self
            .blobs
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| FleetError::Storage(format!("备份不存在: {reference}")))?;
        if self.corrupt_on_fetch {
            let mut corrupted = blob;
            corrupted.push(0xFF);
            return Ok(corrupted);
        }
        Ok(blob)
    }

    async fn discard(&self, reference: &str) -> Result<()> {
        self.blobs.lock().unwrap().remove(reference);
        self.discarded.lock().unwrap().push(reference.to_string());
        Ok(())
    }
}

/// 固定结果的健康探测
pub struct StaticProbe(pub HealthState);

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn probe(&self, _endpoint: &DeviceEndpoint) -> HealthState {
        self.0
    }
}

/// 固定端点的凭据保管库
pub struct StubVault;

#[async_trait]
impl mikrofleet_core::CredentialVault for StubVault {
    async fn resolve(&self, device_id: DeviceId) -> Result<DeviceEndpoint> {
        Ok(DeviceEndpoint {
            device_id,
            address: "192.0.2.1".to_string(),
            api_port: 8728,
            use_tls: false,
            username: "admin".to_string(),
            password: "secret".to_string(),
        })
    }
}
