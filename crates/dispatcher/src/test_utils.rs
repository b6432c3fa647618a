//! 测试用的假会话工厂与假执行器

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use mikrofleet_core::{
    AddressListEntry, CommandReply, CommandRunner, CredentialVault, Device, DeviceEndpoint,
    DeviceId, DeviceSession, EntryRejection, ExecutionContext, ExecutionOutcome, FleetError,
    Result, SessionFactory, TaskId,
};

/// 构造一批测试设备
pub fn devices(ids: &[DeviceId]) -> Vec<Device> {
    ids.iter()
        .map(|id| Device {
            id: *id,
            name: format!("r{id}"),
            address: format!("192.0.2.{id}"),
            api_port: 8728,
            use_tls: false,
            group_ids: vec![],
        })
        .collect()
}

/// 固定端点的凭据保管库
pub struct StaticEndpointVault;

#[async_trait]
impl CredentialVault for StaticEndpointVault {
    async fn resolve(&self, device_id: DeviceId) -> Result<DeviceEndpoint> {
        Ok(DeviceEndpoint {
            device_id,
            address: format!("192.0.2.{device_id}"),
            api_port: 8728,
            use_tls: false,
            username: "admin".to_string(),
            password: "secret".to_string(),
        })
    }
}

/// 带地址列表状态的假设备会话
///
/// 命令一律回空应答；地址列表的查询与增删作用在会话内的内存
/// 状态上，足以让核对器的复读校验走通。
#[derive(Default)]
pub struct FakeDeviceSession {
    usable: bool,
    lists: HashMap<String, Vec<AddressListEntry>>,
}

impl FakeDeviceSession {
    pub fn new() -> Self {
        Self {
            usable: true,
            lists: HashMap::new(),
        }
    }
}

#[async_trait]
impl DeviceSession for FakeDeviceSession {
    async fn execute(&mut self, _command: &str, _args: &[(String, String)]) -> Result<CommandReply> {
        Ok(Vec::new())
    }

    async fn query_address_list(&mut self, list: &str) -> Result<Vec<AddressListEntry>> {
        Ok(self.lists.get(list).cloned().unwrap_or_default())
    }

    async fn mutate_address_list(
        &mut self,
        list: &str,
        adds: &[AddressListEntry],
        removes: &[String],
    ) -> Result<Vec<EntryRejection>> {
        let slot = self.lists.entry(list.to_string()).or_default();
        for entry in adds {
            if !slot.iter().any(|e| e.address == entry.address) {
                slot.push(entry.clone());
            }
        }
        slot.retain(|e| !removes.contains(&e.address));
        Ok(Vec::new())
    }

    fn is_usable(&self) -> bool {
        self.usable
    }

    fn invalidate(&mut self) {
        self.usable = false;
    }
}

/// 可编排失败的会话工厂
///
/// 指定设备前 N 次建连返回不可达，之后成功，用于演练
/// 不可达 → 重试 → 成功 的路径。
#[derive(Default)]
pub struct ScriptedSessionFactory {
    fail_remaining: Mutex<HashMap<DeviceId, u32>>,
    pub opened: AtomicUsize,
}

impl ScriptedSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_first(&self, device_id: DeviceId, times: u32) {
        if let Ok(mut map) = self.fail_remaining.lock() {
            map.insert(device_id, times);
        }
    }
}

#[async_trait]
impl SessionFactory for ScriptedSessionFactory {
    async fn open(&self, endpoint: &DeviceEndpoint) -> Result<Box<dyn DeviceSession>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut map) = self.fail_remaining.lock() {
            if let Some(remaining) = map.get_mut(&endpoint.device_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(FleetError::Unreachable {
                        device: endpoint.address.clone(),
                    });
                }
            }
        }
        Ok(Box::new(FakeDeviceSession::new()))
    }
}

/// 假执行器：可按任务编排结局，并统计每台设备的并发执行数
#[derive(Default)]
pub struct FakeRunner {
    /// task_id -> 结局（缺省成功）
    outcomes: Mutex<HashMap<TaskId, &'static str>>,
    pub delay: Duration,
    active: Mutex<HashMap<DeviceId, u32>>,
    max_active: Mutex<HashMap<DeviceId, u32>>,
    pub runs: AtomicUsize,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// "fatal" | "transient" | "ok"
    pub fn set_outcome(&self, task_id: TaskId, outcome: &'static str) {
        if let Ok(mut map) = self.outcomes.lock() {
            map.insert(task_id, outcome);
        }
    }

    pub fn max_active_for(&self, device_id: DeviceId) -> u32 {
        self.max_active
            .lock()
            .ok()
            .and_then(|m| m.get(&device_id).copied())
            .unwrap_or(0)
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(
        &self,
        ctx: &ExecutionContext,
        _session: &mut dyn DeviceSession,
    ) -> Result<ExecutionOutcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        {
            let mut active = self.active.lock().map_err(|_| {
                FleetError::Internal("active 锁中毒".to_string())
            })?;
            let count = active.entry(ctx.device.id).or_insert(0);
            *count += 1;
            let snapshot = *count;
            drop(active);
            let mut max_active = self.max_active.lock().map_err(|_| {
                FleetError::Internal("max_active 锁中毒".to_string())
            })?;
            let max = max_active.entry(ctx.device.id).or_insert(0);
            *max = (*max).max(snapshot);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Ok(mut active) = self.active.lock() {
            if let Some(count) = active.get_mut(&ctx.device.id) {
                *count -= 1;
            }
        }
        ctx.cancel.check()?;

        let outcome = self
            .outcomes
            .lock()
            .ok()
            .and_then(|m| m.get(&ctx.task.id).copied())
            .unwrap_or("ok");
        match outcome {
            "fatal" => Err(FleetError::CommandRejected {
                message: "脚本被设备拒绝".to_string(),
            }),
            "auth" => Err(FleetError::AuthenticationFailed {
                device: ctx.device.label(),
            }),
            "transient" => Err(FleetError::Unreachable {
                device: ctx.device.label(),
            }),
            _ => Ok(ExecutionOutcome {
                output: Some("done".to_string()),
            }),
        }
    }
}
