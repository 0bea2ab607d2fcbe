//! Printlink Core Library
//!
//! 蓝牙小票/标签打印机的发现、连接与打印任务提交
//!
//! # 模块
//!
//! - **manager**: 连接生命周期状态机（扫描、带期限的连接重试、断开、打印）
//! - **discovery**: 扫描提供方接口与可取消的扫描会话
//! - **connection**: 连接工厂与连接句柄接口
//! - **state**: 不可变状态快照及其发布
//! - **ble**: 基于 btleplug 的扫描提供方与连接工厂
//! - **config**: 运行参数与持久化设置
//!
//! # 使用示例
//!
//! ```ignore
//! use printlink_core::{BleConnector, BleDiscovery, ConnectionManager, ManagerConfig};
//!
//! // 1. 创建管理器
//! let manager = ConnectionManager::new(
//!     Arc::new(BleDiscovery::new().await?),
//!     Arc::new(BleConnector::new().await?),
//!     ManagerConfig::default(),
//! );
//!
//! // 2. 扫描并等待结束
//! let state = manager.state();
//! manager.start_search();
//! let snapshot = state.wait_for(|s| !s.searching).await?;
//!
//! // 3. 连接第一台打印机并打印
//! manager.connect(snapshot.results.to_vec()[0].clone());
//! state.wait_for(|s| s.is_connected() || s.has_error()).await?;
//! manager.submit_print_job(b"^XA^FDHello^FS^XZ".to_vec());
//! ```

pub mod ble;
pub mod config;
pub mod connection;
pub mod device;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod manager;
pub mod state;

pub use ble::{BleConnector, BleDiscovery, BlePrinterLink};
pub use config::{ManagerConfig, PrinterSettings};
pub use connection::{ConnectOptions, ConnectionFactory, ConnectionHandle, LiveConnection};
pub use device::{DeviceDescriptor, DiscoveredSet, FoundDevice};
pub use discovery::{
    DiscoveryEvent, DiscoveryHandler, DiscoveryProvider, DiscoverySession, ScanScope,
};
pub use error::{CloseFailed, ConnectionError, DiscoveryError, ManagerError};
pub use logging::LogLevel;
pub use manager::{CONNECT_FAILED_MESSAGE, ConnectionManager};
pub use state::{ConnectionState, StateReader, StateSnapshot};
