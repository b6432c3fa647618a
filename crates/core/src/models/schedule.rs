use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::errors::{FleetError, Result};

/// 任务调度规则
///
/// 纯值类型：下一次触发时刻由规则加上"上次触发"水位线确定性推出。
/// 所有时刻按 UTC 计算。非法的 cron 表达式在任务装载时被拒绝，
/// 不会留到触发时刻才暴露。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// 单次：触发一次后被消耗，不再上膛
    Once(DateTime<Utc>),
    /// 每天固定时刻
    Daily(NaiveTime),
    /// 每周固定星期与时刻
    Weekly { day: ScheduleDay, time: NaiveTime },
    /// 标准五段 cron 表达式（分 时 日 月 周）
    Cron(String),
}

/// 星期字段
///
/// 自带序列化形式，避免 cron 方言里周日 0/7 的编号歧义。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleDay {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl ScheduleDay {
    pub fn to_weekday(self) -> Weekday {
        match self {
            ScheduleDay::Mon => Weekday::Mon,
            ScheduleDay::Tue => Weekday::Tue,
            ScheduleDay::Wed => Weekday::Wed,
            ScheduleDay::Thu => Weekday::Thu,
            ScheduleDay::Fri => Weekday::Fri,
            ScheduleDay::Sat => Weekday::Sat,
            ScheduleDay::Sun => Weekday::Sun,
        }
    }
}

impl Schedule {
    /// 校验调度规则，非法的 cron 表达式在这里被拒绝
    pub fn validate(&self) -> Result<()> {
        match self {
            Schedule::Cron(expr) => {
                parse_five_field(expr)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// 计算严格晚于 `after` 的下一次触发时刻
    ///
    /// Once 规则在触发时刻不晚于水位线时返回 None，即已消耗。
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Once(at) => {
                if *at > after {
                    Some(*at)
                } else {
                    None
                }
            }
            Schedule::Daily(time) => {
                let candidate = Utc.from_utc_datetime(&after.date_naive().and_time(*time));
                if candidate > after {
                    Some(candidate)
                } else {
                    Some(candidate + Duration::days(1))
                }
            }
            Schedule::Weekly { day, time } => {
                let target = day.to_weekday();
                let mut date = after.date_naive();
                for _ in 0..8 {
                    if date.weekday() == target {
                        let candidate = Utc.from_utc_datetime(&date.and_time(*time));
                        if candidate > after {
                            return Some(candidate);
                        }
                    }
                    date = date.succ_opt()?;
                }
                None
            }
            Schedule::Cron(expr) => {
                let schedule = parse_five_field(expr).ok()?;
                schedule.after(&after).next()
            }
        }
    }
}

/// 解析标准五段 cron 表达式
///
/// cron crate 需要秒字段，这里把秒固定为 0 以保持五段语义。
fn parse_five_field(expr: &str) -> Result<cron::Schedule> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(FleetError::InvalidSchedule {
            expr: expr.to_string(),
            message: format!("期望 5 个字段，实际 {fields} 个"),
        });
    }
    cron::Schedule::from_str(&format!("0 {expr}")).map_err(|e| FleetError::InvalidSchedule {
        expr: expr.to_string(),
        message: e.to_string(),
    })
}
