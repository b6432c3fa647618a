//! 重试队列
//!
//! 持有重试票据。TaskRun 进入 AwaitingRetry 时生成票据，
//! `earliest_retry_at = now + backoff(已重试次数)`，退避按指数增长、
//! 有上限、带随机抖动。后台扫描把到期票据重新物化为 Pending 实例
//! 注入待执行队列；超过任务的重试上限则转 Exhausted 并记录，
//! 绝不静默丢弃。

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use mikrofleet_core::{
    ErrorKind, ExecutionRecord, ExecutionRecordSink, FleetError, Result, RetryConfig, TaskRun,
    TaskRunStatus,
};

use crate::queue::RunQueue;

/// 重试票据，归重试队列独占，TaskRun 到达终态即销毁
#[derive(Debug, Clone)]
pub struct RetryTicket {
    pub run: TaskRun,
    /// 下一次尝试的序号（严格递增）
    pub attempt: u32,
    pub earliest_retry_at: DateTime<Utc>,
    pub last_error: ErrorKind,
}

/// admit 的裁决
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// 已排入重试等待
    Scheduled,
    /// 重试耗尽，TaskRun 已转 Exhausted 并记录
    Exhausted,
}

pub struct RetryQueue {
    tickets: Mutex<Vec<RetryTicket>>,
    queue: Arc<RunQueue>,
    sink: Arc<dyn ExecutionRecordSink>,
    config: RetryConfig,
}

impl RetryQueue {
    pub fn new(queue: Arc<RunQueue>, sink: Arc<dyn ExecutionRecordSink>, config: RetryConfig) -> Self {
        Self {
            tickets: Mutex::new(Vec::new()),
            queue,
            sink,
            config,
        }
    }

    /// 计算指数退避间隔（含上限与抖动）
    pub fn backoff_interval(&self, retry_count: u32) -> Duration {
        let base = self.config.base_interval_seconds as f64;
        let exponential = base * self.config.backoff_multiplier.powi(retry_count as i32);
        let capped = exponential.min(self.config.max_interval_seconds as f64);

        // 随机抖动避免雷群效应
        let jitter = capped * self.config.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let with_jitter = (capped + jitter).max(base);
        Duration::from_secs(with_jitter as u64)
    }

    /// 接收一次瞬时失败
    ///
    /// 未到上限：记录 AwaitingRetry 周期并生成票据；
    /// 已到上限：转 Exhausted、记录、上报，不再产生票据。
    pub async fn admit(
        &self,
        mut run: TaskRun,
        max_retries: u32,
        error: &FleetError,
    ) -> Result<Admission> {
        if run.retry_count >= max_retries {
            run.update_status(TaskRunStatus::Exhausted);
            warn!(
                "TaskRun {} (任务 {} 设备 {}) 重试耗尽于第 {} 次重试: {error}",
                run.id, run.task_id, run.device_id, run.retry_count
            );
            self.sink
                .record(&ExecutionRecord::from_run(&run, Some(error.kind())))
                .await?;
            return Ok(Admission::Exhausted);
        }

        run.update_status(TaskRunStatus::AwaitingRetry);
        let record = ExecutionRecord::from_run(&run, Some(error.kind()));

        let earliest_retry_at = Utc::now()
            + chrono::Duration::from_std(self.backoff_interval(run.retry_count))
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let ticket = RetryTicket {
            attempt: run.retry_count + 1,
            earliest_retry_at,
            last_error: error.kind(),
            run,
        };
        info!(
            "TaskRun {} 进入重试等待，第 {} 次尝试不早于 {}",
            ticket.run.id,
            ticket.attempt,
            earliest_retry_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        // 票据先于记录可见：记录一旦出现，扫描一定能看到票据
        if let Ok(mut tickets) = self.tickets.lock() {
            tickets.push(ticket);
        }
        self.sink.record(&record).await?;
        Ok(Admission::Scheduled)
    }

    /// 把到期票据重新物化为 Pending 实例注入队列，返回本轮数量
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<RetryTicket> = {
            let Ok(mut tickets) = self.tickets.lock() else {
                return 0;
            };
            let mut due = Vec::new();
            tickets.retain(|ticket| {
                if ticket.earliest_retry_at <= now {
                    due.push(ticket.clone());
                    false
                } else {
                    true
                }
            });
            due
        };

        for ticket in &due {
            let retry_run = TaskRun::retry_of(&ticket.run, ticket.earliest_retry_at);
            debug!(
                "重试票据到期: TaskRun {} 第 {} 次尝试入队",
                retry_run.id, retry_run.retry_count
            );
            self.queue.push(retry_run);
        }
        due.len()
    }

    pub fn ticket_count(&self) -> usize {
        self.tickets.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// 后台运行扫描循环
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        info!("重试队列扫描启动，间隔 {interval:?}");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let rearmed = self.sweep(Utc::now());
                    if rearmed > 0 {
                        info!("本轮扫描重新注入 {rearmed} 个重试实例");
                    }
                }
                _ = shutdown.recv() => {
                    info!("重试队列扫描退出");
                    return;
                }
            }
        }
    }
}
