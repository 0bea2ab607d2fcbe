//! 基于 btleplug 的蓝牙实现
//!
//! - [`BleDiscovery`]: 扫描附近设备，实现 [`DiscoveryProvider`](crate::discovery::DiscoveryProvider)
//! - [`BleConnector`]: 打开到打印机的 GATT 链路，实现 [`ConnectionFactory`](crate::connection::ConnectionFactory)

pub mod link;
pub mod scanner;

pub use link::{BleConnector, BlePrinterLink};
pub use scanner::BleDiscovery;

use btleplug::api::Manager as _;
use btleplug::platform::{Adapter, Manager};
use uuid::Uuid;

/// 打印机解析服务
pub const PARSER_SERVICE_UUID: Uuid = Uuid::from_u128(0x38eb4a80_c570_11e3_9507_0002a5d5c51b);
/// 主机 -> 打印机
pub const TO_PRINTER_CHAR_UUID: Uuid = Uuid::from_u128(0x38eb4a82_c570_11e3_9507_0002a5d5c51b);

/// 获取第一个蓝牙适配器
pub async fn default_adapter() -> Result<Option<Adapter>, btleplug::Error> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    Ok(adapters.into_iter().next())
}
