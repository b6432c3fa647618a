//! 命令执行器
//!
//! 把任务动作翻译成对已借出会话的协议调用：脚本逐行下发、备份
//! 触发快照并回传入库、重启发后不等再复查健康。执行器自身无状态，
//! 取消在每个协议调用边界被观察。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use mikrofleet_core::{
    Action, Backup, BackupKind, BackupStorage, CommandRunner, CredentialVault, DeviceSession,
    ExecutionContext, ExecutionOutcome, FleetError, HealthProbe, HealthState, ListSemantics,
    Result,
};

use crate::reconciler;

pub struct CommandExecutor {
    storage: Arc<dyn BackupStorage>,
    probe: Arc<dyn HealthProbe>,
    vault: Arc<dyn CredentialVault>,
    /// 重启后到健康复查之间的宽限期
    reboot_grace: Duration,
}

impl CommandExecutor {
    pub fn new(
        storage: Arc<dyn BackupStorage>,
        probe: Arc<dyn HealthProbe>,
        vault: Arc<dyn CredentialVault>,
        reboot_grace: Duration,
    ) -> Self {
        Self {
            storage,
            probe,
            vault,
            reboot_grace,
        }
    }

    async fn run_script(
        &self,
        ctx: &ExecutionContext,
        session: &mut dyn DeviceSession,
        script: &str,
    ) -> Result<ExecutionOutcome> {
        let mut outputs = Vec::new();
        for line in script.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            ctx.cancel.check()?;

            let (command, args) = parse_command_line(line)?;
            let rows = session.execute(&command, &args).await?;
            let rendered: Vec<String> = rows
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect();
            outputs.push(format!("{command}: {}", rendered.join("; ")));
        }
        Ok(ExecutionOutcome {
            output: Some(outputs.join("\n")),
        })
    }

    async fn mutate_address_list(
        &self,
        ctx: &ExecutionContext,
        session: &mut dyn DeviceSession,
        list: &str,
        semantics: Option<ListSemantics>,
        add: &[String],
        remove: &[String],
        comment: Option<&str>,
    ) -> Result<ExecutionOutcome> {
        let semantics = semantics.unwrap_or_else(|| ListSemantics::infer(list));

        // 期望集 = 当前 ∪ 新增 ∖ 删除，随后统一走最小差异核对
        let current: BTreeSet<String> = session
            .query_address_list(list)
            .await?
            .into_iter()
            .map(|entry| entry.address)
            .collect();
        let mut desired = current;
        for address in add {
            desired.insert(address.clone());
        }
        for address in remove {
            desired.remove(address);
        }

        let report =
            reconciler::reconcile(session, list, semantics, &desired, comment, &ctx.cancel).await?;
        info!(
            "设备 {} 列表 {list} 核对完成: +{} -{}",
            ctx.device.label(),
            report.added.len(),
            report.removed.len()
        );
        let output = serde_json::to_string(&report)
            .map_err(|e| FleetError::Internal(format!("核对结果序列化失败: {e}")))?;
        Ok(ExecutionOutcome {
            output: Some(output),
        })
    }

    async fn backup(
        &self,
        ctx: &ExecutionContext,
        session: &mut dyn DeviceSession,
        kind: BackupKind,
    ) -> Result<ExecutionOutcome> {
        let created_at = Utc::now();
        let base = format!(
            "{}_{}_{}",
            sanitize_name(&ctx.device.name),
            ctx.device.id,
            created_at.format("%Y%m%dT%H%M%SZ")
        );
        let file_name = format!("{base}.{}", kind.file_extension());

        // 触发设备侧快照
        match kind {
            BackupKind::Backup => {
                session
                    .execute(
                        "/system/backup/save",
                        &[("name".to_string(), base.clone())],
                    )
                    .await?;
            }
            BackupKind::Export => {
                session
                    .execute("/export", &[("file".to_string(), base.clone())])
                    .await?;
            }
        }

        ctx.cancel.check()?;

        // 回读文件内容与设备报告的大小
        let rows = session
            .execute(
                "/file/print",
                &[
                    (".proplist".to_string(), "name,size,contents".to_string()),
                    ("?name".to_string(), file_name.clone()),
                ],
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| FleetError::BackupIntegrity {
                device: ctx.device.label(),
                message: format!("设备未生成备份文件 {file_name}"),
            })?;
        let blob = row
            .get("contents")
            .map(|c| c.as_bytes().to_vec())
            .ok_or_else(|| FleetError::BackupIntegrity {
                device: ctx.device.label(),
                message: "备份文件内容为空".to_string(),
            })?;
        if let Some(size) = row.get("size").and_then(|s| s.parse::<usize>().ok()) {
            if size != blob.len() {
                return Err(FleetError::BackupIntegrity {
                    device: ctx.device.label(),
                    message: format!("传输不完整: 设备报告 {size} 字节，实收 {} 字节", blob.len()),
                });
            }
        }

        let sha256 = hex_digest(&blob);
        let reference = self
            .storage
            .store(ctx.device.id, created_at, kind, &blob)
            .await?;

        // 入库后取回比对摘要，不一致则丢弃损坏副本
        let stored = self.storage.fetch(&reference).await?;
        if hex_digest(&stored) != sha256 {
            if let Err(e) = self.storage.discard(&reference).await {
                warn!("丢弃损坏备份 {reference} 失败: {e}");
            }
            return Err(FleetError::BackupIntegrity {
                device: ctx.device.label(),
                message: "入库后摘要不匹配，备份已丢弃".to_string(),
            });
        }

        let record = Backup {
            device_id: ctx.device.id,
            kind,
            created_at,
            reference,
            sha256,
        };
        info!(
            "设备 {} 备份完成: {} ({} 字节)",
            ctx.device.label(),
            record.reference,
            blob.len()
        );
        let output = serde_json::to_string(&record)
            .map_err(|e| FleetError::Internal(format!("备份记录序列化失败: {e}")))?;
        Ok(ExecutionOutcome {
            output: Some(output),
        })
    }

    async fn reboot(
        &self,
        ctx: &ExecutionContext,
        session: &mut dyn DeviceSession,
    ) -> Result<ExecutionOutcome> {
        // 发后不等：设备掉线即视为指令已送达
        match session.execute("/system/reboot", &[]).await {
            Ok(_) => {}
            Err(FleetError::ConnectionReset(_)) | Err(FleetError::Timeout { .. }) => {
                debug!("设备 {} 在重启指令后断开连接", ctx.device.label());
            }
            Err(e) => return Err(e),
        }
        // 旧会话随重启作废
        session.invalidate();

        tokio::time::sleep(self.reboot_grace).await;

        // 恢复情况只上报，不决定本次执行成败
        let recovered = match self.vault.resolve(ctx.device.id).await {
            Ok(endpoint) => self.probe.probe(&endpoint).await == HealthState::Reachable,
            Err(e) => {
                warn!("重启复查无法解析设备 {} 的端点: {e}", ctx.device.label());
                false
            }
        };
        if recovered {
            info!("设备 {} 重启后已恢复", ctx.device.label());
        } else {
            warn!("设备 {} 在宽限期后仍未恢复", ctx.device.label());
        }
        Ok(ExecutionOutcome {
            output: Some(format!("{{\"rebooted\":true,\"recovered\":{recovered}}}")),
        })
    }
}

#[async_trait]
impl CommandRunner for CommandExecutor {
    async fn run(
        &self,
        ctx: &ExecutionContext,
        session: &mut dyn DeviceSession,
    ) -> Result<ExecutionOutcome> {
        match ctx.task.action.clone() {
            Action::RunScript { script } => self.run_script(ctx, session, &script).await,
            Action::MutateAddressList {
                list,
                semantics,
                add,
                remove,
                comment,
            } => {
                self.mutate_address_list(
                    ctx,
                    session,
                    &list,
                    semantics,
                    &add,
                    &remove,
                    comment.as_deref(),
                )
                .await
            }
            Action::Backup { kind } => self.backup(ctx, session, kind).await,
            Action::Reboot => self.reboot(ctx, session).await,
        }
    }
}

/// 把脚本行解析为命令路径加参数词
///
/// 行首必须是 `/` 开头的命令路径，其余记号按 `key=value` 解析；
/// 不满足的行按设备拒绝处理，不做任何猜测性修补。
fn parse_command_line(line: &str) -> Result<(String, Vec<(String, String)>)> {
    let mut tokens = line.split_whitespace();
    let command = tokens
        .next()
        .ok_or_else(|| FleetError::CommandRejected {
            message: "空命令行".to_string(),
        })?
        .to_string();
    if !command.starts_with('/') {
        return Err(FleetError::CommandRejected {
            message: format!("脚本行不是命令路径: {line}"),
        });
    }

    let mut args = Vec::new();
    for token in tokens {
        let Some((key, value)) = token.split_once('=') else {
            return Err(FleetError::CommandRejected {
                message: format!("非法参数 {token}: 期望 key=value"),
            });
        };
        args.push((key.to_string(), value.to_string()));
    }
    Ok((command, args))
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() {
        "device".to_string()
    } else {
        trimmed.to_string()
    }
}

fn hex_digest(blob: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(blob);
    format!("{:x}", hasher.finalize())
}
