//! 分发器
//!
//! 有界工作协程池从待执行队列认领 Pending TaskRun：认领即持有
//! 设备准入锁（同一设备永不并行执行，即便是不同任务），随后取连接、
//! 调执行器、按错误分类路由结果。瞬时错误转 AwaitingRetry 交给
//! 重试队列，不会越过分发器向上冒泡；其余错误终态落记录。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use mikrofleet_core::{
    CancelFlag, CommandRunner, Device, DeviceDirectory, ExecutionContext, ExecutionOutcome,
    ExecutionRecord, ExecutionRecordSink, FleetError, Result, Task, TaskId, TaskRun,
    TaskRunStatus, TaskStore,
};
use mikrofleet_connector::ConnectionPool;

use crate::queue::RunQueue;
use crate::retry::RetryQueue;

pub struct Dispatcher {
    queue: Arc<RunQueue>,
    pool: Arc<ConnectionPool>,
    runner: Arc<dyn CommandRunner>,
    retry: Arc<RetryQueue>,
    sink: Arc<dyn ExecutionRecordSink>,
    store: Arc<dyn TaskStore>,
    directory: Arc<dyn DeviceDirectory>,
    worker_count: usize,
    /// 在执行实例的取消句柄，按 run id 登记
    in_flight: Mutex<HashMap<Uuid, (TaskId, CancelFlag)>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<RunQueue>,
        pool: Arc<ConnectionPool>,
        runner: Arc<dyn CommandRunner>,
        retry: Arc<RetryQueue>,
        sink: Arc<dyn ExecutionRecordSink>,
        store: Arc<dyn TaskStore>,
        directory: Arc<dyn DeviceDirectory>,
        worker_count: usize,
    ) -> Self {
        Self {
            queue,
            pool,
            runner,
            retry,
            sink,
            store,
            directory,
            worker_count,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// 启动工作协程池
    pub fn spawn_workers(
        self: &Arc<Self>,
        shutdown: &broadcast::Sender<()>,
    ) -> Vec<JoinHandle<()>> {
        (0..self.worker_count)
            .map(|index| {
                let dispatcher = Arc::clone(self);
                let shutdown_rx = shutdown.subscribe();
                tokio::spawn(async move { dispatcher.worker_loop(index, shutdown_rx).await })
            })
            .collect()
    }

    async fn worker_loop(&self, index: usize, mut shutdown: broadcast::Receiver<()>) {
        debug!("工作协程 {index} 启动");
        loop {
            if let Some(run) = self.queue.try_claim() {
                self.process_run(run).await;
                continue;
            }
            tokio::select! {
                _ = self.queue.wait_for_work() => {}
                // 唤醒通知与认领之间存在窗口，低频轮询兜底
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                _ = shutdown.recv() => {
                    debug!("工作协程 {index} 退出");
                    return;
                }
            }
        }
    }

    /// 处理一个已认领的实例；无论结局如何都归还设备准入锁
    async fn process_run(&self, mut run: TaskRun) {
        let device_id = run.device_id;

        let context = match self.resolve_context(&run).await {
            Ok(context) => context,
            Err(e) => {
                error!("TaskRun {} 上下文解析失败: {e}", run.id);
                run.error = Some(e.to_string());
                run.update_status(TaskRunStatus::Failed);
                self.record(&run, Some(&e)).await;
                self.queue.finish(device_id);
                return;
            }
        };
        let (task, device) = context;

        run.update_status(TaskRunStatus::Running);
        info!(
            "开始执行 TaskRun {} (任务 {} 设备 {} 第 {} 次尝试)",
            run.id,
            task.name,
            device.label(),
            run.retry_count + 1
        );

        let cancel = CancelFlag::new();
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.insert(run.id, (task.id, cancel.clone()));
        }

        let result = self.execute(&task, &device, &run, cancel).await;

        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&run.id);
        }

        match result {
            Ok(outcome) => {
                run.output = outcome.output;
                run.update_status(TaskRunStatus::Succeeded);
                info!("TaskRun {} 执行成功", run.id);
                self.record(&run, None).await;
            }
            Err(e) if e.is_transient() => {
                // 瞬时错误到此为止：转交重试队列，不向上冒泡
                warn!("TaskRun {} 瞬时失败: {e}", run.id);
                run.error = Some(e.to_string());
                if let Err(record_err) = self.retry.admit(run, task.max_retries, &e).await {
                    error!("重试入队失败: {record_err}");
                }
            }
            Err(e) => {
                warn!("TaskRun {} 终态失败: {e}", run.id);
                if matches!(e, FleetError::AuthenticationFailed { .. }) {
                    self.directory.flag_auth_failure(device.id).await;
                }
                run.error = Some(e.to_string());
                run.update_status(TaskRunStatus::Failed);
                self.record(&run, Some(&e)).await;
            }
        }

        self.queue.finish(device_id);
    }

    async fn resolve_context(&self, run: &TaskRun) -> Result<(Task, Device)> {
        let task = self.store.task(run.task_id).await?;
        let device = self.directory.device(run.device_id).await?;
        Ok((task, device))
    }

    /// 取连接并在任务级墙钟超时内运行执行器
    async fn execute(
        &self,
        task: &Task,
        device: &Device,
        run: &TaskRun,
        cancel: CancelFlag,
    ) -> Result<ExecutionOutcome> {
        let mut session = self.pool.acquire(device).await?;

        let context = ExecutionContext {
            run_id: run.id,
            retry_count: run.retry_count,
            task: task.clone(),
            device: device.clone(),
            cancel,
        };
        let deadline = Duration::from_secs(task.timeout_seconds);
        let result =
            tokio::time::timeout(deadline, self.runner.run(&context, session.as_mut())).await;

        match result {
            Ok(outcome) => {
                self.pool.release(device.id, session).await;
                outcome
            }
            Err(_) => {
                // 超时后会话状态不可信：作废并丢弃，错误按瞬时分类
                session.invalidate();
                self.pool.release(device.id, session).await;
                Err(FleetError::Timeout {
                    operation: format!("任务 {} @ {}", task.name, device.label()),
                })
            }
        }
    }

    async fn record(&self, run: &TaskRun, error: Option<&FleetError>) {
        let record = ExecutionRecord::from_run(run, error.map(FleetError::kind));
        if let Err(e) = self.sink.record(&record).await {
            error!("执行记录写入失败: {e}");
        }
    }

    /// 任务被新版本取代时的取消钩子
    ///
    /// 撤出该任务的全部待执行实例并记录，再向在执行实例发取消信号；
    /// 执行器会在下一个协议调用边界让步。
    pub async fn cancel_runs_for(&self, task_id: TaskId) -> usize {
        let mut cancelled = 0;

        for mut run in self.queue.remove_pending_for_task(task_id) {
            run.error = Some(FleetError::Cancelled.to_string());
            run.update_status(TaskRunStatus::Failed);
            self.record(&run, Some(&FleetError::Cancelled)).await;
            cancelled += 1;
        }

        if let Ok(in_flight) = self.in_flight.lock() {
            for (run_id, (owner, cancel)) in in_flight.iter() {
                if *owner == task_id {
                    info!("向在执行的 TaskRun {run_id} 发出取消信号");
                    cancel.cancel();
                    cancelled += 1;
                }
            }
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mikrofleet_core::{Action, Schedule, Target, TaskRun};
    use mikrofleet_infrastructure::{MemoryDeviceDirectory, MemoryRecordSink, MemoryTaskStore};
    use mikrofleet_core::RetryConfig;

    use crate::test_utils::{devices, FakeRunner, ScriptedSessionFactory, StaticEndpointVault};

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        queue: Arc<RunQueue>,
        retry: Arc<RetryQueue>,
        sink: Arc<MemoryRecordSink>,
        runner: Arc<FakeRunner>,
        factory: Arc<ScriptedSessionFactory>,
        directory: Arc<MemoryDeviceDirectory>,
        shutdown: broadcast::Sender<()>,
    }

    fn task(id: TaskId) -> Task {
        Task {
            id,
            name: format!("任务{id}"),
            action: Action::Reboot,
            target: Target::Devices(vec![1]),
            schedule: Schedule::Cron("0 3 * * *".to_string()),
            timeout_seconds: 30,
            max_retries: 2,
            enabled: true,
        }
    }

    fn fixture(tasks: Vec<Task>, device_ids: &[i64], runner: FakeRunner, workers: usize) -> Fixture {
        let queue = Arc::new(RunQueue::new());
        let sink = Arc::new(MemoryRecordSink::new());
        let store = Arc::new(MemoryTaskStore::new(tasks));
        let directory: Arc<MemoryDeviceDirectory> =
            Arc::new(MemoryDeviceDirectory::new(devices(device_ids), vec![]));
        let factory = Arc::new(ScriptedSessionFactory::new());
        let pool = Arc::new(ConnectionPool::new(
            Arc::new(StaticEndpointVault),
            factory.clone(),
            directory.clone(),
        ));
        let retry = Arc::new(RetryQueue::new(
            queue.clone(),
            sink.clone(),
            RetryConfig {
                jitter_factor: 0.0,
                ..RetryConfig::default()
            },
        ));
        let runner = Arc::new(runner);
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            pool,
            runner.clone(),
            retry.clone(),
            sink.clone(),
            store,
            directory.clone(),
            workers,
        ));
        let (shutdown, _) = broadcast::channel(4);
        Fixture {
            dispatcher,
            queue,
            retry,
            sink,
            runner,
            factory,
            directory,
            shutdown,
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F, what: &str) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("等待超时: {what}");
    }

    #[tokio::test]
    async fn test_per_device_execution_is_serialized() {
        let fx = fixture(
            vec![task(1), task(2)],
            &[1],
            FakeRunner::with_delay(Duration::from_millis(50)),
            4,
        );
        let handles = fx.dispatcher.spawn_workers(&fx.shutdown);

        // 两个不同任务指向同一设备：绝不并行
        for task_id in [1, 2, 1, 2] {
            fx.queue.push(TaskRun::new(task_id, 1, Utc::now()));
        }
        let sink = fx.sink.clone();
        wait_until(|| sink.records().len() >= 4, "四个实例全部完成").await;

        assert_eq!(fx.runner.max_active_for(1), 1, "同一设备出现并行执行");
        let _ = fx.shutdown.send(());
        for handle in handles {
            let _ = handle.await;
        }
    }

    #[tokio::test]
    async fn test_fatal_error_fails_without_retry() {
        let runner = FakeRunner::new();
        runner.set_outcome(1, "fatal");
        let fx = fixture(vec![task(1)], &[1], runner, 1);
        let handles = fx.dispatcher.spawn_workers(&fx.shutdown);

        fx.queue.push(TaskRun::new(1, 1, Utc::now()));
        let sink = fx.sink.clone();
        wait_until(|| !sink.records().is_empty(), "终态记录落盘").await;

        let records = fx.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, TaskRunStatus::Failed);
        assert_eq!(records[0].retry_count, 0);
        // 非瞬时错误不进重试队列
        assert_eq!(fx.retry.ticket_count(), 0);

        let _ = fx.shutdown.send(());
        for handle in handles {
            let _ = handle.await;
        }
    }

    #[tokio::test]
    async fn test_transient_error_goes_to_retry_queue() {
        let runner = FakeRunner::new();
        runner.set_outcome(1, "transient");
        let fx = fixture(vec![task(1)], &[1], runner, 1);
        let handles = fx.dispatcher.spawn_workers(&fx.shutdown);

        fx.queue.push(TaskRun::new(1, 1, Utc::now()));
        let retry = fx.retry.clone();
        let sink = fx.sink.clone();
        wait_until(
            || retry.ticket_count() == 1 && !sink.records().is_empty(),
            "瞬时失败进入重试队列",
        )
        .await;

        let records = fx.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, TaskRunStatus::AwaitingRetry);

        let _ = fx.shutdown.send(());
        for handle in handles {
            let _ = handle.await;
        }
    }

    #[tokio::test]
    async fn test_unreachable_device_routes_to_retry() {
        let fx = fixture(vec![task(1)], &[1], FakeRunner::new(), 1);
        // 建连即失败：执行器从未被调用
        fx.factory.fail_first(1, 1);
        let handles = fx.dispatcher.spawn_workers(&fx.shutdown);

        fx.queue.push(TaskRun::new(1, 1, Utc::now()));
        let retry = fx.retry.clone();
        wait_until(|| retry.ticket_count() == 1, "不可达进入重试队列").await;
        assert_eq!(fx.runner.runs.load(std::sync::atomic::Ordering::SeqCst), 0);

        let _ = fx.shutdown.send(());
        for handle in handles {
            let _ = handle.await;
        }
    }

    #[tokio::test]
    async fn test_cancel_pending_runs_for_superseded_task() {
        let fx = fixture(vec![task(1), task(2)], &[1, 2], FakeRunner::new(), 1);
        // 不启动工作协程，先堆积待执行实例
        fx.queue.push(TaskRun::new(1, 1, Utc::now()));
        fx.queue.push(TaskRun::new(1, 2, Utc::now()));
        fx.queue.push(TaskRun::new(2, 1, Utc::now()));

        let cancelled = fx.dispatcher.cancel_runs_for(1).await;
        assert_eq!(cancelled, 2);
        assert_eq!(fx.queue.pending_count(), 1);

        let records = fx.sink.records();
        assert_eq!(records.len(), 2);
        assert!(records
            .iter()
            .all(|r| r.outcome == TaskRunStatus::Failed
                && r.error_kind == Some(mikrofleet_core::ErrorKind::Cancelled)));
    }

    #[tokio::test]
    async fn test_auth_failure_flags_device_and_fails_terminally() {
        let runner = FakeRunner::new();
        runner.set_outcome(1, "auth");
        let fx = fixture(vec![task(1)], &[1], runner, 1);
        let handles = fx.dispatcher.spawn_workers(&fx.shutdown);

        fx.queue.push(TaskRun::new(1, 1, Utc::now()));
        let sink = fx.sink.clone();
        wait_until(|| !sink.records().is_empty(), "认证失败落终态记录").await;

        let records = fx.sink.records();
        assert_eq!(records[0].outcome, TaskRunStatus::Failed);
        assert_eq!(fx.retry.ticket_count(), 0);
        // 设备被置上认证失败标志，供面板呈现
        let health = fx.directory.health(1).await.unwrap();
        assert!(health.auth_flagged);

        let _ = fx.shutdown.send(());
        for handle in handles {
            let _ = handle.await;
        }
    }
}
