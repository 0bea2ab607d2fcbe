//! 日志级别
//!
//! 核心库通过 `log` 门面输出日志，由二进制程序决定如何收集。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 默认过滤规则
pub const DEFAULT_FILTER: &str = "info,printlink_core=debug";

/// 日志级别
///
/// 实现了 `PartialOrd` 以便过滤。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn name(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    /// 生成 `EnvFilter` 规则
    ///
    /// 外部 crate 最多到 info，本项目的 crate 使用所选级别。
    pub fn filter_directive(self) -> String {
        let ours = self.name().to_lowercase();
        let base = if self > LogLevel::Info {
            "info".to_string()
        } else {
            ours.clone()
        };
        format!("{base},printlink_core={ours},printlink={ours}")
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ERROR" => Ok(LogLevel::Error),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "INFO" => Ok(LogLevel::Info),
            "DEBUG" => Ok(LogLevel::Debug),
            "TRACE" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!("debug".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert_eq!("Warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_filter_directive() {
        assert_eq!(
            LogLevel::Trace.filter_directive(),
            "info,printlink_core=trace,printlink=trace"
        );
        assert_eq!(
            LogLevel::Warn.filter_directive(),
            "warn,printlink_core=warn,printlink=warn"
        );
    }
}
