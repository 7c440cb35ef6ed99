//! 时间处理工具
//!
//! - 所有时间字段使用 UTC 毫秒时间戳
//! - 业务层统一使用 `Utc::now().timestamp_millis()` 生成时间

use chrono::{DateTime, TimeZone, Utc};

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// 毫秒时间戳转 RFC 3339 字符串（日志用），非法时间戳原样输出
pub fn format_timestamp(millis: u64) -> String {
    match i64::try_from(millis)
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    {
        Some(datetime) => DateTime::<Utc>::to_rfc3339(&datetime),
        None => millis.to_string(),
    }
}
