//! 打印机连接抽象
//!
//! [`ConnectionFactory`] 负责打开到某个地址的物理链路，[`ConnectionHandle`] 表示一条打开的链路。
//! 管理器拿到句柄后立即包装成 [`LiveConnection`]，之后只能发送或关闭。

use crate::config::{DEFAULT_READ_TIMEOUT_MS, DEFAULT_WAIT_TIMEOUT_MS};
use crate::device::DeviceDescriptor;
use crate::error::{CloseFailed, ConnectionError};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// 打开连接时的超时参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// 单次读取/建立链路的超时
    pub read_timeout: Duration,
    /// 链路建立后等待其稳定的时间
    pub wait_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            wait_timeout: Duration::from_millis(DEFAULT_WAIT_TIMEOUT_MS),
        }
    }
}

/// 一条打开的物理链路
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// 发送不透明的打印数据
    async fn send(&mut self, payload: &[u8]) -> Result<(), ConnectionError>;

    /// 关闭链路
    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// 连接工厂
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn open(
        &self,
        address: &str,
        options: &ConnectOptions,
    ) -> Result<Box<dyn ConnectionHandle>, ConnectionError>;
}

/// 管理器独占的活动连接
///
/// `close` 消耗自身：成功后连接不复存在，失败时通过 [`CloseFailed`] 交还所有权。
pub struct LiveConnection {
    device: DeviceDescriptor,
    handle: Box<dyn ConnectionHandle>,
}

impl LiveConnection {
    pub fn new(device: DeviceDescriptor, handle: Box<dyn ConnectionHandle>) -> Self {
        Self { device, handle }
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<(), ConnectionError> {
        self.handle.send(payload).await
    }

    pub async fn close(mut self) -> Result<(), CloseFailed> {
        match self.handle.close().await {
            Ok(()) => Ok(()),
            Err(error) => Err(CloseFailed {
                error,
                connection: self,
            }),
        }
    }
}

impl fmt::Debug for LiveConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveConnection")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}
