//! BLE 打印机链路
//!
//! 流程:
//! 1. 按地址查找已发现的外设
//! 2. 连接并等待链路稳定
//! 3. 发现服务，定位 "主机 -> 打印机" 特征
//! 4. 打印数据按块写入该特征

use super::{PARSER_SERVICE_UUID, TO_PRINTER_CHAR_UUID};
use crate::connection::{ConnectOptions, ConnectionFactory, ConnectionHandle};
use crate::error::ConnectionError;
use async_trait::async_trait;
use btleplug::api::{Central, CharPropFlags, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::time;

/// 单次写入的最大字节数
const WRITE_CHUNK_SIZE: usize = 180;

pub struct BleConnector {
    adapter: Adapter,
}

impl BleConnector {
    pub async fn new() -> Result<Self, ConnectionError> {
        let adapter = super::default_adapter()
            .await?
            .ok_or(ConnectionError::NoAdapter)?;
        Ok(Self { adapter })
    }

    pub fn with_adapter(adapter: Adapter) -> Self {
        Self { adapter }
    }

    async fn find_device(&self, address: &str) -> Result<Peripheral, ConnectionError> {
        let peripherals = self.adapter.peripherals().await?;

        for peripheral in peripherals {
            if let Some(props) = peripheral.properties().await?
                && props.address.to_string().eq_ignore_ascii_case(address)
            {
                return Ok(peripheral);
            }
        }

        Err(ConnectionError::DeviceNotFound(address.to_string()))
    }

    async fn establish(
        peripheral: &Peripheral,
        options: &ConnectOptions,
    ) -> Result<Characteristic, ConnectionError> {
        if !peripheral.is_connected().await? {
            time::timeout(options.read_timeout, peripheral.connect())
                .await
                .map_err(|_| ConnectionError::Timeout("connecting"))??;
        }

        // 等待连接稳定
        time::sleep(options.wait_timeout).await;

        time::timeout(options.read_timeout, peripheral.discover_services())
            .await
            .map_err(|_| ConnectionError::Timeout("discovering services"))??;

        find_write_characteristic(peripheral.characteristics().iter())
            .cloned()
            .ok_or(ConnectionError::CharacteristicNotFound(TO_PRINTER_CHAR_UUID))
    }
}

#[async_trait]
impl ConnectionFactory for BleConnector {
    async fn open(
        &self,
        address: &str,
        options: &ConnectOptions,
    ) -> Result<Box<dyn ConnectionHandle>, ConnectionError> {
        let peripheral = self.find_device(address).await?;
        info!("Opening connection to {}", address);

        match Self::establish(&peripheral, options).await {
            Ok(characteristic) => {
                debug!(
                    "Using characteristic {} (service {})",
                    characteristic.uuid, characteristic.service_uuid
                );
                Ok(Box::new(BlePrinterLink {
                    peripheral,
                    characteristic,
                    write_timeout: options.read_timeout,
                    closed: false,
                }))
            }
            Err(e) => {
                // 不泄漏半建立的链路
                if let Err(disconnect_err) = peripheral.disconnect().await {
                    debug!("Cleanup disconnect failed: {}", disconnect_err);
                }
                Err(e)
            }
        }
    }
}

/// 到一台打印机的 GATT 链路
pub struct BlePrinterLink {
    peripheral: Peripheral,
    characteristic: Characteristic,
    write_timeout: Duration,
    closed: bool,
}

#[async_trait]
impl ConnectionHandle for BlePrinterLink {
    async fn send(&mut self, payload: &[u8]) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        let write_type = write_type_for(self.characteristic.properties);
        debug!(
            "Writing {} bytes in {} chunk(s)",
            payload.len(),
            payload.len().div_ceil(WRITE_CHUNK_SIZE)
        );
        for chunk in payload.chunks(WRITE_CHUNK_SIZE) {
            time::timeout(
                self.write_timeout,
                self.peripheral.write(&self.characteristic, chunk, write_type),
            )
            .await
            .map_err(|_| ConnectionError::Timeout("writing print data"))??;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        if self.closed {
            warn!("Connection already closed");
            return Ok(());
        }
        self.peripheral.disconnect().await?;
        self.closed = true;
        Ok(())
    }
}

/// 优先使用打印机解析服务的写特征，否则退回到任意可写特征
fn find_write_characteristic<'a>(
    characteristics: impl Iterator<Item = &'a Characteristic> + Clone,
) -> Option<&'a Characteristic> {
    characteristics
        .clone()
        .find(|c| c.uuid == TO_PRINTER_CHAR_UUID && c.service_uuid == PARSER_SERVICE_UUID)
        .or_else(|| {
            characteristics.clone().find(|c| {
                c.properties
                    .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE)
            })
        })
}

/// 支持带响应写入时优先使用
fn write_type_for(properties: CharPropFlags) -> WriteType {
    if properties.contains(CharPropFlags::WRITE) {
        WriteType::WithResponse
    } else {
        WriteType::WithoutResponse
    }
}
