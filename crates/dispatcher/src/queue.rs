//! 待执行队列
//!
//! 就绪 TaskRun 按创建顺序 FIFO 出队；设备级互斥是一层过滤而不是
//! 重排：被占用设备的实例原地跳过，设备释放后按原有顺位被认领。
//! 认领即持有该设备的准入锁，直到 finish 归还。

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::debug;

use mikrofleet_core::{DeviceId, TaskId, TaskRun};

#[derive(Default)]
struct Inner {
    pending: VecDeque<TaskRun>,
    busy: HashSet<DeviceId>,
}

#[derive(Default)]
pub struct RunQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, run: TaskRun) {
        if let Ok(mut inner) = self.inner.lock() {
            debug!(
                "入队 TaskRun {} (任务 {} 设备 {})",
                run.id, run.task_id, run.device_id
            );
            inner.pending.push_back(run);
        }
        self.notify.notify_waiters();
    }

    /// 认领第一个设备空闲的待执行实例，并锁住该设备
    pub fn try_claim(&self) -> Option<TaskRun> {
        let mut guard = self.inner.lock().ok()?;
        let inner = &mut *guard;
        let index = inner
            .pending
            .iter()
            .position(|run| !inner.busy.contains(&run.device_id))?;
        let run = inner.pending.remove(index)?;
        inner.busy.insert(run.device_id);
        Some(run)
    }

    /// 释放设备准入锁；可能让某个被跳过的实例变为可认领
    pub fn finish(&self, device_id: DeviceId) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.busy.remove(&device_id);
        }
        self.notify.notify_waiters();
    }

    /// 等待新入队或设备释放
    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }

    /// 撤出某任务的全部待执行实例（任务被新版本取代时）
    pub fn remove_pending_for_task(&self, task_id: TaskId) -> Vec<TaskRun> {
        let Ok(mut inner) = self.inner.lock() else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        inner.pending.retain(|run| {
            if run.task_id == task_id {
                removed.push(run.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().map(|i| i.pending.len()).unwrap_or(0)
    }

    pub fn busy_count(&self) -> usize {
        self.inner.lock().map(|i| i.busy.len()).unwrap_or(0)
    }
}
