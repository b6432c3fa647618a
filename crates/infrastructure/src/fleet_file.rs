//! 设备群定义文件
//!
//! 一个 TOML 文件承载设备、分组与任务定义，装载时逐项校验，
//! 非法的调度表达式在这里被拒绝。装载结果进入内存目录与任务存储。

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use mikrofleet_core::{
    Device, DeviceDirectory, DeviceGroup, DeviceHealth, DeviceId, FleetError, HealthState, Result,
    Target, Task, TaskId, TaskStore,
};

#[derive(Debug, Deserialize)]
struct FleetDocument {
    #[serde(default)]
    devices: Vec<Device>,
    #[serde(default)]
    groups: Vec<DeviceGroup>,
    #[serde(default)]
    tasks: Vec<Task>,
}

/// 装载设备群定义文件
pub fn load_fleet_file(path: &Path) -> Result<(Vec<Device>, Vec<DeviceGroup>, Vec<Task>)> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        FleetError::Configuration(format!("读取设备群文件 {} 失败: {e}", path.display()))
    })?;
    let doc: FleetDocument = toml::from_str(&content).map_err(|e| {
        FleetError::Configuration(format!("解析设备群文件 {} 失败: {e}", path.display()))
    })?;

    for task in &doc.tasks {
        task.validate().map_err(|e| {
            FleetError::Configuration(format!("任务 {} ({}) 非法: {e}", task.id, task.name))
        })?;
    }

    info!(
        "装载设备群定义: {} 台设备, {} 个分组, {} 个任务",
        doc.devices.len(),
        doc.groups.len(),
        doc.tasks.len()
    );
    Ok((doc.devices, doc.groups, doc.tasks))
}

/// 内存任务存储
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl MemoryTaskStore {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: RwLock::new(tasks.into_iter().map(|t| (t.id, t)).collect()),
        }
    }

    /// 整体替换任务集（任务定义不可变，只能被新版本整体取代）
    pub async fn replace(&self, tasks: Vec<Task>) {
        *self.tasks.write().await = tasks.into_iter().map(|t| (t.id, t)).collect();
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn load_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn task(&self, id: TaskId) -> Result<Task> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(FleetError::TaskNotFound { id })
    }
}

/// 内存设备目录
///
/// 健康状态是其中唯一可变的部分，只有健康检查与连接池会调用
/// 写入接口。
pub struct MemoryDeviceDirectory {
    devices: HashMap<DeviceId, Device>,
    groups: HashMap<i64, DeviceGroup>,
    health: RwLock<HashMap<DeviceId, DeviceHealth>>,
}

impl MemoryDeviceDirectory {
    pub fn new(devices: Vec<Device>, groups: Vec<DeviceGroup>) -> Self {
        let health = devices
            .iter()
            .map(|d| (d.id, DeviceHealth::default()))
            .collect();
        Self {
            devices: devices.into_iter().map(|d| (d.id, d)).collect(),
            groups: groups.into_iter().map(|g| (g.id, g)).collect(),
            health: RwLock::new(health),
        }
    }
}

#[async_trait]
impl DeviceDirectory for MemoryDeviceDirectory {
    async fn device(&self, id: DeviceId) -> Result<Device> {
        self.devices
            .get(&id)
            .cloned()
            .ok_or(FleetError::DeviceNotFound { id })
    }

    async fn all_devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.values().cloned().collect();
        devices.sort_by_key(|d| d.id);
        devices
    }

    async fn expand(&self, target: &Target) -> Result<Vec<Device>> {
        let mut ids: Vec<DeviceId> = match target {
            Target::Devices(ids) => ids.clone(),
            Target::Group(group_id) => self
                .groups
                .get(group_id)
                .ok_or(FleetError::DeviceNotFound { id: *group_id })?
                .device_ids
                .clone(),
        };
        ids.sort_unstable();
        ids.dedup();

        let mut devices = Vec::with_capacity(ids.len());
        for id in ids {
            match self.devices.get(&id) {
                Some(device) => devices.push(device.clone()),
                None => warn!("目标中的设备 {id} 不在目录里，跳过"),
            }
        }
        Ok(devices)
    }

    async fn health(&self, id: DeviceId) -> Option<DeviceHealth> {
        self.health.read().await.get(&id).cloned()
    }

    async fn update_health(&self, id: DeviceId, state: HealthState) {
        let mut health = self.health.write().await;
        let entry = health.entry(id).or_default();
        entry.state = state;
        entry.last_checked_at = Some(Utc::now());
    }

    async fn flag_auth_failure(&self, id: DeviceId) {
        let mut health = self.health.write().await;
        health.entry(id).or_default().auth_flagged = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_fleet_file_and_validation() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[[devices]]
id = 1
name = "edge-r1"
address = "192.0.2.1"
api_port = 8728
use_tls = false
group_ids = [10]

[[groups]]
id = 10
name = "边界路由"
device_ids = [1]

[[tasks]]
id = 100
name = "夜间备份"
target = {{ group = 10 }}
schedule = {{ cron = "0 3 * * *" }}

[tasks.action]
kind = "backup"
"#
        )
        .unwrap();

        let (devices, groups, tasks) = load_fleet_file(file.path()).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(groups.len(), 1);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].max_retries, 3);
    }

    #[test]
    fn test_malformed_cron_rejected_at_load() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[[tasks]]
id = 1
name = "坏任务"
target = {{ devices = [1] }}
schedule = {{ cron = "not a cron" }}

[tasks.action]
kind = "reboot"
"#
        )
        .unwrap();

        assert!(load_fleet_file(file.path()).is_err());
    }

    #[tokio::test]
    async fn test_expand_group_dedups_and_sorts() {
        let devices = vec![
            Device {
                id: 2,
                name: "b".into(),
                address: "192.0.2.2".into(),
                api_port: 8728,
                use_tls: false,
                group_ids: vec![],
            },
            Device {
                id: 1,
                name: "a".into(),
                address: "192.0.2.1".into(),
                api_port: 8728,
                use_tls: false,
                group_ids: vec![],
            },
        ];
        let directory = MemoryDeviceDirectory::new(devices, vec![]);

        let expanded = directory
            .expand(&Target::Devices(vec![2, 1, 2, 99]))
            .await
            .unwrap();
        let ids: Vec<_> = expanded.iter().map(|d| d.id).collect();
        // 去重、按 id 排序，未知设备被跳过
        assert_eq!(ids, vec![1, 2]);
    }
}
