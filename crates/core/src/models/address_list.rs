use serde::{Deserialize, Serialize};

/// 设备地址列表中的一条记录
///
/// 唯一性按 (设备, 列表, address) 判定；`.id` 是设备侧行标识，
/// 删除操作需要先查到它。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressListEntry {
    /// 设备侧 `.id`，仅来自查询结果
    pub id: Option<String>,
    pub list: String,
    pub address: String,
    /// 设备侧到期时间（RouterOS timeout 字段），到期自动消失
    pub timeout: Option<String>,
    pub comment: Option<String>,
    pub disabled: bool,
}

impl AddressListEntry {
    pub fn new(list: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: None,
            list: list.into(),
            address: address.into(),
            timeout: None,
            comment: None,
            disabled: false,
        }
    }
}

/// 列表语义，决定核对时增删的顺序约束
///
/// Allow 型列表（如 WhiteList，被规则 #12 消费）短暂变空等同于
/// 全量断流，必须先加后删；Deny 型列表（BLAddress/Deny_List，
/// 被规则 #8/#10 消费）短暂缺项只会放宽而不会收紧，增删可批量乱序。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListSemantics {
    Allow,
    Deny,
}

impl ListSemantics {
    /// 按已知列表名推断语义，未知列表保守地按 Allow 处理
    pub fn infer(list_name: &str) -> Self {
        match list_name {
            "WhiteList" => ListSemantics::Allow,
            "BLAddress" | "BlackList" | "Deny_List" => ListSemantics::Deny,
            _ => ListSemantics::Allow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_semantics_for_known_lists() {
        assert_eq!(ListSemantics::infer("WhiteList"), ListSemantics::Allow);
        assert_eq!(ListSemantics::infer("BLAddress"), ListSemantics::Deny);
        assert_eq!(ListSemantics::infer("Deny_List"), ListSemantics::Deny);
        // 未知列表按最严格的 Allow 处理
        assert_eq!(ListSemantics::infer("CustomList"), ListSemantics::Allow);
    }
}
