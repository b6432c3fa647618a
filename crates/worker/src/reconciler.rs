//! 防火墙地址列表核对器
//!
//! 给定设备、列表名与期望成员集，读取当前成员后计算最小增删差异
//! 并应用。Allow 型列表必须先加后删：新增经复读确认之前不发出任何
//! 删除，设备永远不会落入比新旧期望集都更严的中间态。应用之后再
//! 复读一次，残余差异按核对冲突上报而不是静默重试。

use std::collections::BTreeSet;

use tracing::{debug, warn};

use mikrofleet_core::{
    AddressListEntry, CancelFlag, DeviceSession, FleetError, ListSemantics, Result,
};

/// 最小差异：`to_add = desired − current`，`to_remove = current − desired`
///
/// 两侧都按字典序排定，计划对同样的输入是确定的。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub to_add: Vec<String>,
    pub to_remove: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// 计算把 `current` 带到 `desired` 所需的最小差异
pub fn plan(current: &BTreeSet<String>, desired: &BTreeSet<String>) -> ReconcilePlan {
    ReconcilePlan {
        to_add: desired.difference(current).cloned().collect(),
        to_remove: current.difference(desired).cloned().collect(),
    }
}

/// 一次核对的结果
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReconcileReport {
    pub list: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: usize,
}

/// 把设备上的地址列表核对到期望成员集
///
/// 中途取消会先完成当前增删批次再让步（见取消语义）。
pub async fn reconcile(
    session: &mut dyn DeviceSession,
    list: &str,
    semantics: ListSemantics,
    desired: &BTreeSet<String>,
    comment: Option<&str>,
    cancel: &CancelFlag,
) -> Result<ReconcileReport> {
    cancel.check()?;

    let current = read_membership(session, list).await?;
    let diff = plan(&current, desired);
    let unchanged = desired.intersection(&current).count();

    if diff.is_empty() {
        debug!("列表 {list} 已与期望一致，共 {unchanged} 项");
        return Ok(ReconcileReport {
            list: list.to_string(),
            added: Vec::new(),
            removed: Vec::new(),
            unchanged,
        });
    }

    let adds: Vec<AddressListEntry> = diff
        .to_add
        .iter()
        .map(|address| {
            let mut entry = AddressListEntry::new(list, address.clone());
            entry.comment = comment.map(str::to_string);
            entry
        })
        .collect();

    match semantics {
        ListSemantics::Allow => {
            // 先加：新增未确认前绝不发出删除
            if !adds.is_empty() {
                let rejections = session.mutate_address_list(list, &adds, &[]).await?;
                if !rejections.is_empty() {
                    warn!("列表 {list} 有 {} 条新增被设备拒绝", rejections.len());
                }
                let after_adds = read_membership(session, list).await?;
                let missing: Vec<String> = desired.difference(&after_adds).cloned().collect();
                if !missing.is_empty() {
                    // 新增未全部落地，删除被扣下，上报剩余差异
                    let extra = after_adds.difference(desired).cloned().collect();
                    return Err(FleetError::ReconciliationConflict {
                        list: list.to_string(),
                        missing,
                        extra,
                    });
                }
            }

            // 批次边界：已取消则到此为止，新增已生效、删除未发出
            cancel.check()?;

            if !diff.to_remove.is_empty() {
                session
                    .mutate_address_list(list, &[], &diff.to_remove)
                    .await?;
            }
        }
        ListSemantics::Deny => {
            // Deny 型列表短暂缺项只会放宽访问，增删单批乱序即可
            session
                .mutate_address_list(list, &adds, &diff.to_remove)
                .await?;
        }
    }

    // 复读校验：残余差异按冲突上报，可能是设备或并发的外部修改所致
    let settled = read_membership(session, list).await?;
    let missing: Vec<String> = desired.difference(&settled).cloned().collect();
    let extra: Vec<String> = settled.difference(desired).cloned().collect();
    if !missing.is_empty() || !extra.is_empty() {
        return Err(FleetError::ReconciliationConflict {
            list: list.to_string(),
            missing,
            extra,
        });
    }

    Ok(ReconcileReport {
        list: list.to_string(),
        added: diff.to_add,
        removed: diff.to_remove,
        unchanged,
    })
}

async fn read_membership(session: &mut dyn DeviceSession, list: &str) -> Result<BTreeSet<String>> {
    let entries = session.query_address_list(list).await?;
    Ok(entries.into_iter().map(|entry| entry.address).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockSession;

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_plan_minimal_diff() {
        let current = set(&["old.example.com", "10.0.0.5"]);
        let desired = set(&["example.com", "10.0.0.5"]);
        let diff = plan(&current, &desired);

        assert_eq!(diff.to_add, vec!["example.com".to_string()]);
        assert_eq!(diff.to_remove, vec!["old.example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_apply_yields_exactly_desired_then_idempotent() {
        let mut session = MockSession::with_list("WhiteList", &["a.example", "stale.example"]);
        let desired = set(&["a.example", "b.example"]);
        let cancel = CancelFlag::new();

        let report = reconcile(
            &mut session,
            "WhiteList",
            ListSemantics::Allow,
            &desired,
            None,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(report.added, vec!["b.example".to_string()]);
        assert_eq!(report.removed, vec!["stale.example".to_string()]);
        assert_eq!(session.membership("WhiteList"), desired);

        // 幂等：对已收敛的状态重跑产生空差异，不再发出任何增删
        session.ops.clear();
        let report = reconcile(
            &mut session,
            "WhiteList",
            ListSemantics::Allow,
            &desired,
            None,
            &cancel,
        )
        .await
        .unwrap();
        assert!(report.added.is_empty() && report.removed.is_empty());
        assert!(session.ops.iter().all(|op| op.starts_with("query:")));
    }

    #[tokio::test]
    async fn test_whitelist_add_strictly_before_remove() {
        // 期望 {example.com, 10.0.0.5}，当前 {old.example.com, 10.0.0.5}
        let mut session = MockSession::with_list("WhiteList", &["old.example.com", "10.0.0.5"]);
        let desired = set(&["example.com", "10.0.0.5"]);

        reconcile(
            &mut session,
            "WhiteList",
            ListSemantics::Allow,
            &desired,
            None,
            &CancelFlag::new(),
        )
        .await
        .unwrap();

        let add_pos = session
            .ops
            .iter()
            .position(|op| op == "add:example.com")
            .expect("必须有新增操作");
        let remove_pos = session
            .ops
            .iter()
            .position(|op| op == "remove:old.example.com")
            .expect("必须有删除操作");
        assert!(add_pos < remove_pos, "新增必须先于删除: {:?}", session.ops);
    }

    #[tokio::test]
    async fn test_whitelist_never_drops_still_desired_entry_while_adds_pending() {
        // 设备静默丢弃新增：删除必须被扣下，旧表项原样保留
        let mut session = MockSession::with_list("WhiteList", &["old.example.com", "10.0.0.5"]);
        session.drop_adds.insert("example.com".to_string());
        let desired = set(&["example.com", "10.0.0.5"]);

        let err = reconcile(
            &mut session,
            "WhiteList",
            ListSemantics::Allow,
            &desired,
            None,
            &CancelFlag::new(),
        )
        .await
        .unwrap_err();

        match err {
            FleetError::ReconciliationConflict { missing, .. } => {
                assert_eq!(missing, vec!["example.com".to_string()]);
            }
            other => panic!("期望核对冲突，实际: {other}"),
        }
        // 仍然期望的旧表项没有被删除，不存在全断流窗口
        assert!(session.membership("WhiteList").contains("old.example.com"));
        assert!(!session.ops.iter().any(|op| op.starts_with("remove:")));
    }

    #[tokio::test]
    async fn test_deny_list_single_batch() {
        let mut session = MockSession::with_list("BLAddress", &["198.51.100.7"]);
        let desired = set(&["203.0.113.9"]);

        let report = reconcile(
            &mut session,
            "BLAddress",
            ListSemantics::Deny,
            &desired,
            None,
            &CancelFlag::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.added, vec!["203.0.113.9".to_string()]);
        assert_eq!(report.removed, vec!["198.51.100.7".to_string()]);
        assert_eq!(session.membership("BLAddress"), desired);
    }

    #[tokio::test]
    async fn test_rejected_entry_reported_as_exact_remaining_diff() {
        let mut session = MockSession::with_list("WhiteList", &["10.0.0.5"]);
        session.reject_adds.insert("bad entry".to_string());
        let desired = set(&["10.0.0.5", "bad entry", "good.example"]);

        let err = reconcile(
            &mut session,
            "WhiteList",
            ListSemantics::Allow,
            &desired,
            None,
            &CancelFlag::new(),
        )
        .await
        .unwrap_err();

        match err {
            FleetError::ReconciliationConflict { missing, extra, .. } => {
                assert_eq!(missing, vec!["bad entry".to_string()]);
                assert!(extra.is_empty());
            }
            other => panic!("期望核对冲突，实际: {other}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_add_is_noop() {
        let mut session = MockSession::with_list("WhiteList", &["10.0.0.5"]);
        let desired = set(&["10.0.0.5", "10.0.0.6"]);

        reconcile(
            &mut session,
            "WhiteList",
            ListSemantics::Allow,
            &desired,
            None,
            &CancelFlag::new(),
        )
        .await
        .unwrap();

        let count = session
            .entries("WhiteList")
            .iter()
            .filter(|e| e.address == "10.0.0.5")
            .count();
        assert_eq!(count, 1, "表项不允许重复");
    }

    #[tokio::test]
    async fn test_cancel_between_batches_keeps_adds_skips_removes() {
        let mut session = MockSession::with_list("WhiteList", &["old.example.com"]);
        let desired = set(&["new.example.com"]);
        let cancel = CancelFlag::new();
        // 新增批次一经发出即触发取消
        session.cancel_after_first_mutation = Some(cancel.clone());

        let err = reconcile(
            &mut session,
            "WhiteList",
            ListSemantics::Allow,
            &desired,
            None,
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, FleetError::Cancelled));
        let membership = session.membership("WhiteList");
        // 当前批次（新增）完成，后续批次（删除）被扣下
        assert!(membership.contains("new.example.com"));
        assert!(membership.contains("old.example.com"));
    }
}
