//! 连接参数与持久化设置
//!
//! [`ManagerConfig`] 是运行时使用的参数，[`PrinterSettings`] 是写入磁盘的 TOML 设置。

use crate::connection::ConnectOptions;
use crate::discovery::ScanScope;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// 连接超时的默认值（秒）
pub const DEFAULT_CONNECT_DEADLINE_SECS: u64 = 10;
/// 两次连接尝试之间的间隔（毫秒）
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 12;

/// 连接管理器运行参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// 连接重试循环的总期限
    pub connect_deadline: Duration,
    /// 失败后到下一次尝试的固定间隔
    pub retry_delay: Duration,
    pub read_timeout: Duration,
    pub wait_timeout: Duration,
    /// 提供方单次扫描时长
    pub scan_duration: Duration,
    /// 会话级超时，`None` 表示等待提供方自行结束
    pub discovery_timeout: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connect_deadline: Duration::from_secs(DEFAULT_CONNECT_DEADLINE_SECS),
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            wait_timeout: Duration::from_millis(DEFAULT_WAIT_TIMEOUT_MS),
            scan_duration: Duration::from_secs(DEFAULT_SCAN_DURATION_SECS),
            discovery_timeout: None,
        }
    }
}

impl ManagerConfig {
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            read_timeout: self.read_timeout,
            wait_timeout: self.wait_timeout,
        }
    }

    pub fn scan_scope(&self) -> ScanScope {
        ScanScope {
            duration: self.scan_duration,
        }
    }
}

/// 持久化设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterSettings {
    /// 未指定设备时使用的打印机地址
    pub default_printer: Option<String>,
    pub connect_deadline_secs: u64,
    pub retry_delay_ms: u64,
    pub read_timeout_ms: u64,
    pub wait_timeout_ms: u64,
    pub scan_duration_secs: u64,
    /// 详细日志模式
    pub verbose: bool,
}

impl Default for PrinterSettings {
    fn default() -> Self {
        Self {
            default_printer: None,
            connect_deadline_secs: DEFAULT_CONNECT_DEADLINE_SECS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
            scan_duration_secs: DEFAULT_SCAN_DURATION_SECS,
            verbose: false,
        }
    }
}

impl PrinterSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("printlink")
            .join("settings.toml")
    }

    /// 加载设置（如果文件不存在或无法解析则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &std::path::Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(settings) => {
                    debug!("Loaded settings from {:?}", path);
                    return settings;
                }
                Err(e) => {
                    log::warn!("Failed to parse settings: {}, using defaults", e);
                }
            },
            Err(e) => {
                log::warn!("Failed to read settings file: {}, using defaults", e);
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> std::io::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            connect_deadline: Duration::from_secs(self.connect_deadline_secs),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            wait_timeout: Duration::from_millis(self.wait_timeout_ms),
            scan_duration: Duration::from_secs(self.scan_duration_secs),
            discovery_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_timing() {
        let config = PrinterSettings::default().manager_config();
        assert_eq!(config, ManagerConfig::default());
        assert_eq!(config.connect_deadline, Duration::from_secs(10));
        assert_eq!(config.retry_delay, Duration::from_secs(1));
        assert_eq!(
            config.connect_options(),
            ConnectOptions {
                read_timeout: Duration::from_millis(5000),
                wait_timeout: Duration::from_millis(500),
            }
        );
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings: PrinterSettings = toml::from_str(
            r#"
            default_printer = "AC:3F:A4:11:22:33"
            retry_delay_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(settings.default_printer.as_deref(), Some("AC:3F:A4:11:22:33"));
        assert_eq!(settings.retry_delay_ms, 250);
        assert_eq!(settings.connect_deadline_secs, DEFAULT_CONNECT_DEADLINE_SECS);
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("printlink-test-{}", std::process::id()));
        let path = dir.join("settings.toml");
        let settings = PrinterSettings {
            default_printer: Some("AC:3F:A4:00:00:01".to_string()),
            verbose: true,
            ..Default::default()
        };

        settings.save_to(&path).unwrap();
        assert_eq!(PrinterSettings::load_from(&path), settings);

        fs::write(&path, "connect_deadline_secs = \"ten\"").unwrap();
        assert_eq!(PrinterSettings::load_from(&path), PrinterSettings::default());

        let _ = fs::remove_dir_all(dir);
    }
}
