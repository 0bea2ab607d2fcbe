//! 错误类型
//!
//! 所有失败最终都只通过状态快照的 `error_message` 暴露给观察者，
//! 这里的类型用于各组件之间传递失败原因。

use crate::connection::LiveConnection;
use uuid::Uuid;

/// 连接相关错误（打开、关闭、发送）
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Timed out while {0}")]
    Timeout(&'static str),

    #[error("Connection already closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] btleplug::Error),

    #[error("{0}")]
    Other(String),
}

/// 扫描启动失败
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("IO error: {0}")]
    Io(#[from] btleplug::Error),

    #[error("{0}")]
    Provider(String),
}

/// 管理器已停止
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Connection manager has shut down")]
    Shutdown,
}

/// 关闭连接失败
///
/// 关闭失败时连接的所有权交还给调用方，由调用方决定保留还是丢弃。
#[derive(Debug, thiserror::Error)]
#[error("Error closing connection: {error}")]
pub struct CloseFailed {
    #[source]
    pub error: ConnectionError,
    pub connection: LiveConnection,
}
