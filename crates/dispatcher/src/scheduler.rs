//! 调度器
//!
//! 为每个任务维护下一次触发水位线。每个 tick 找出触发时刻已到的
//! 任务，把目标展开成具体设备集合，为每个 (触发, 设备) 物化一个
//! Pending TaskRun，并按调度规则推进水位线。同一任务的两次触发
//! 从不合并：错过的触发逐一补发，各自产生独立实例。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use mikrofleet_core::{DeviceDirectory, Result, Task, TaskId, TaskRun, TaskStore};

use crate::queue::RunQueue;

/// 任务的触发水位线
///
/// `None` 表示规则已消耗（Once 已触发）或无法再触发。
type FireState = Option<DateTime<Utc>>;

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    directory: Arc<dyn DeviceDirectory>,
    queue: Arc<RunQueue>,
    fire_state: Mutex<HashMap<TaskId, FireState>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        directory: Arc<dyn DeviceDirectory>,
        queue: Arc<RunQueue>,
    ) -> Self {
        Self {
            store,
            directory,
            queue,
            fire_state: Mutex::new(HashMap::new()),
        }
    }

    /// 执行一轮调度，返回本轮物化的 TaskRun 数
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let tasks = self.store.load_tasks().await?;
        let due = self.collect_due_fires(&tasks, now);

        let mut materialized = 0;
        for (task, fires) in due {
            let devices = match self.directory.expand(&task.target).await {
                Ok(devices) => devices,
                Err(e) => {
                    error!("任务 {} 目标展开失败: {e}", task.name);
                    continue;
                }
            };
            if devices.is_empty() {
                debug!("任务 {} 的目标展开为空，跳过本轮触发", task.name);
                continue;
            }
            for fire_at in fires {
                for device in &devices {
                    self.queue.push(TaskRun::new(task.id, device.id, fire_at));
                    materialized += 1;
                }
                info!(
                    "任务 {} 于 {} 的触发已物化到 {} 台设备",
                    task.name,
                    fire_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    devices.len()
                );
            }
        }
        Ok(materialized)
    }

    /// 在锁内推进各任务的水位线，收集所有已到的触发时刻
    ///
    /// 首次见到的任务只上膛（以 now 为基准算下一次触发）不触发，
    /// 与"过去的触发不补"的装载语义一致。
    fn collect_due_fires(&self, tasks: &[Task], now: DateTime<Utc>) -> Vec<(Task, Vec<DateTime<Utc>>)> {
        let Ok(mut state) = self.fire_state.lock() else {
            return Vec::new();
        };
        // 任务集被整体替换时清掉消失任务的水位线
        state.retain(|id, _| tasks.iter().any(|t| t.id == *id));

        let mut due = Vec::new();
        for task in tasks {
            if !task.enabled {
                continue;
            }
            let entry = state.entry(task.id);
            let slot = match entry {
                std::collections::hash_map::Entry::Vacant(vacant) => {
                    let armed = task.schedule.next_fire(now);
                    debug!(
                        "任务 {} 首次上膛，下一次触发: {:?}",
                        task.name, armed
                    );
                    vacant.insert(armed);
                    continue;
                }
                std::collections::hash_map::Entry::Occupied(occupied) => occupied.into_mut(),
            };

            let mut fires = Vec::new();
            while let Some(fire_at) = *slot {
                if fire_at > now {
                    break;
                }
                fires.push(fire_at);
                *slot = task.schedule.next_fire(fire_at);
            }
            if !fires.is_empty() {
                due.push((task.clone(), fires));
            }
        }
        due
    }

    /// 后台运行：固定间隔轮询，直到收到关闭信号
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        info!("调度器启动，轮询间隔 {interval:?}");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!("调度轮询失败: {e}");
                    }
                }
                _ = shutdown.recv() => {
                    info!("调度器退出");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use mikrofleet_core::{Action, Schedule, Target};
    use mikrofleet_infrastructure::{MemoryDeviceDirectory, MemoryTaskStore};

    use crate::test_utils::devices;

    fn daily_task(id: TaskId, target: Target) -> Task {
        Task {
            id,
            name: format!("任务{id}"),
            action: Action::Reboot,
            target,
            schedule: Schedule::Daily(NaiveTime::from_hms_opt(3, 0, 0).unwrap()),
            timeout_seconds: 30,
            max_retries: 3,
            enabled: true,
        }
    }

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn scheduler(tasks: Vec<Task>) -> (Scheduler, Arc<RunQueue>) {
        let queue = Arc::new(RunQueue::new());
        let store = Arc::new(MemoryTaskStore::new(tasks));
        let directory = Arc::new(MemoryDeviceDirectory::new(devices(&[1, 2, 3]), vec![]));
        (Scheduler::new(store, directory, queue.clone()), queue)
    }

    #[tokio::test]
    async fn test_first_sight_arms_without_firing() {
        let (scheduler, queue) = scheduler(vec![daily_task(1, Target::Devices(vec![1]))]);

        // 首轮：03:00 已经过去，但任务只上膛不补发
        let count = scheduler.tick(at("2026-03-01T10:00:00Z")).await.unwrap();
        assert_eq!(count, 0);
        assert_eq!(queue.pending_count(), 0);

        // 次日 03:00 过后正常触发
        let count = scheduler.tick(at("2026-03-02T03:00:01Z")).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_missed_fires_are_not_coalesced() {
        let task = Task {
            schedule: Schedule::Cron("*/5 * * * *".to_string()),
            ..daily_task(1, Target::Devices(vec![1]))
        };
        let (scheduler, queue) = scheduler(vec![task]);

        scheduler.tick(at("2026-03-01T10:00:00Z")).await.unwrap();
        // 停摆 15 分钟：三个触发点（10:05/10:10/10:15）逐一补发
        let count = scheduler.tick(at("2026-03-01T10:15:00Z")).await.unwrap();
        assert_eq!(count, 3);
        assert_eq!(queue.pending_count(), 3);
    }

    #[tokio::test]
    async fn test_group_target_fans_out_per_device() {
        let group = mikrofleet_core::DeviceGroup {
            id: 10,
            name: "边界".to_string(),
            device_ids: vec![3, 1, 3],
        };
        let queue = Arc::new(RunQueue::new());
        let store = Arc::new(MemoryTaskStore::new(vec![daily_task(1, Target::Group(10))]));
        let directory = Arc::new(MemoryDeviceDirectory::new(devices(&[1, 2, 3]), vec![group]));
        let scheduler = Scheduler::new(store, directory, queue.clone());

        scheduler.tick(at("2026-03-01T02:00:00Z")).await.unwrap();
        let count = scheduler.tick(at("2026-03-01T03:00:01Z")).await.unwrap();
        // 分组去重后两台设备，各自一个独立实例
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_once_schedule_is_consumed() {
        let task = Task {
            schedule: Schedule::Once(at("2026-03-01T12:00:00Z")),
            ..daily_task(1, Target::Devices(vec![1]))
        };
        let (scheduler, _queue) = scheduler(vec![task]);

        scheduler.tick(at("2026-03-01T11:00:00Z")).await.unwrap();
        let count = scheduler.tick(at("2026-03-01T12:00:00Z")).await.unwrap();
        assert_eq!(count, 1);
        // 已消耗：之后的轮询不再触发
        let count = scheduler.tick(at("2026-03-05T00:00:00Z")).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_disabled_task_never_fires() {
        let task = Task {
            enabled: false,
            ..daily_task(1, Target::Devices(vec![1]))
        };
        let (scheduler, _queue) = scheduler(vec![task]);

        scheduler.tick(at("2026-03-01T02:00:00Z")).await.unwrap();
        let count = scheduler.tick(at("2026-03-02T03:00:01Z")).await.unwrap();
        assert_eq!(count, 0);
    }
}
