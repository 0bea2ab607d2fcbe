//! BLE Scanner - 发现附近的打印机
//!
//! 监听适配器的 `DeviceDiscovered`/`DeviceUpdated` 事件，把地址和名称回报给扫描会话。
//! 扫描持续 `ScanScope::duration` 后以 `on_finished` 结束。

use crate::device::FoundDevice;
use crate::discovery::{DiscoveryHandler, DiscoveryProvider, ScanScope};
use crate::error::DiscoveryError;
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Peripheral as _, PeripheralProperties, ScanFilter};
use btleplug::platform::{Adapter, PeripheralId};
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

pub struct BleDiscovery {
    adapter: Adapter,
    /// 名称过滤（不区分大小写的子串）
    name_filter: Option<String>,
    active: ScanSlot,
}

/// 正在运行的扫描任务
struct ActiveScan {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// 最多一个扫描任务
///
/// 新扫描开始前必须等旧任务执行完 `stop_scan`，否则旧任务会停掉新扫描。
#[derive(Default)]
struct ScanSlot {
    active: Mutex<Option<ActiveScan>>,
}

impl ScanSlot {
    fn lock(&self) -> MutexGuard<'_, Option<ActiveScan>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 只发出取消信号，不等待
    fn cancel(&self) {
        if let Some(scan) = self.lock().as_ref() {
            scan.cancel.cancel();
        }
    }

    /// 取消并等待上一个扫描任务结束
    async fn stop_previous(&self) {
        let previous = self.lock().take();
        if let Some(scan) = previous {
            scan.cancel.cancel();
            if let Err(e) = scan.task.await {
                warn!("BLE scan task failed: {}", e);
            }
        }
    }

    fn set(&self, scan: ActiveScan) {
        if let Some(stale) = self.lock().replace(scan) {
            stale.cancel.cancel();
        }
    }
}

impl BleDiscovery {
    pub async fn new() -> Result<Self, DiscoveryError> {
        let adapter = super::default_adapter()
            .await?
            .ok_or(DiscoveryError::NoAdapter)?;
        Ok(Self::with_adapter(adapter))
    }

    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            name_filter: None,
            active: ScanSlot::default(),
        }
    }

    /// 只回报名称包含 `filter` 的设备
    #[must_use]
    pub fn with_name_filter(mut self, filter: impl Into<String>) -> Self {
        self.name_filter = Some(filter.into());
        self
    }
}

#[async_trait]
impl DiscoveryProvider for BleDiscovery {
    async fn start_scan(
        &self,
        scope: ScanScope,
        handler: Arc<dyn DiscoveryHandler>,
    ) -> Result<(), DiscoveryError> {
        self.active.stop_previous().await;

        let events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        info!("Starting BLE scan for {} seconds", scope.duration.as_secs());

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let adapter = self.adapter.clone();
        let name_filter = self.name_filter.as_ref().map(|f| f.to_lowercase());
        let task = tokio::spawn(async move {
            let cancel = task_cancel;
            let timeout = time::sleep(scope.duration);
            tokio::pin!(timeout);
            tokio::pin!(events);
            let mut reported: HashMap<PeripheralId, Option<String>> = HashMap::new();

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("BLE scan cancelled");
                        break;
                    }
                    () = &mut timeout => {
                        info!("BLE scan complete: {} device(s) seen", reported.len());
                        handler.on_finished();
                        break;
                    }
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) => {
                            let props = match adapter.peripheral(&id).await {
                                Ok(peripheral) => peripheral.properties().await,
                                Err(e) => Err(e),
                            };
                            match props {
                                Ok(Some(props)) => {
                                    if !matches_filter(&props, name_filter.as_deref()) {
                                        continue;
                                    }
                                    // 名称首次出现或变化时才重新回报
                                    if reported.get(&id) == Some(&props.local_name) {
                                        continue;
                                    }
                                    reported.insert(id, props.local_name.clone());
                                    handler.on_found(found_device(&props));
                                }
                                Ok(None) => {}
                                Err(e) => debug!("Failed to read peripheral properties: {}", e),
                            }
                        }
                        Some(_) => {}
                        None => {
                            handler.on_error("Bluetooth adapter event stream ended".to_string());
                            break;
                        }
                    }
                }
            }

            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop BLE scan: {}", e);
            }
        });

        self.active.set(ActiveScan { cancel, task });
        Ok(())
    }

    fn cancel_scan(&self) {
        self.active.cancel();
    }
}

fn found_device(props: &PeripheralProperties) -> FoundDevice {
    FoundDevice {
        address: Some(props.address.to_string()),
        name: props.local_name.clone(),
    }
}

fn matches_filter(props: &PeripheralProperties, filter: Option<&str>) -> bool {
    match filter {
        None => true,
        Some(filter) => props
            .local_name
            .as_ref()
            .is_some_and(|name| name.to_lowercase().contains(filter)),
    }
}
