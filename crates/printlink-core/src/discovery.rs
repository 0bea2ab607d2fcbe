//! 打印机发现
//!
//! 扫描提供方通过回调上报结果（可能来自任意线程），[`DiscoverySession`] 把回调转换为
//! 可取消的异步事件序列。
//!
//! # 会话语义
//!
//! - `Finished` 与 `Error` 都是终止事件，先到者结束会话，之后不再产生事件
//! - 没有地址的设备被丢弃，只记录日志
//! - 会话结束（完成、出错、超时、取消或被丢弃）时恰好调用一次 `cancel_scan`

use crate::config::DEFAULT_SCAN_DURATION_SECS;
use crate::device::{DeviceDescriptor, FoundDevice};
use crate::error::DiscoveryError;
use async_trait::async_trait;
use futures_util::Stream;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// 单次扫描的范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanScope {
    /// 提供方自行结束扫描前的扫描时长
    pub duration: Duration,
}

impl Default for ScanScope {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(DEFAULT_SCAN_DURATION_SECS),
        }
    }
}

/// 扫描回调接口
pub trait DiscoveryHandler: Send + Sync {
    fn on_found(&self, device: FoundDevice);
    fn on_finished(&self);
    fn on_error(&self, message: String);
}

/// 扫描提供方（底层无线协议栈）
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    /// 开始扫描，结果通过 `handler` 回报
    async fn start_scan(
        &self,
        scope: ScanScope,
        handler: Arc<dyn DiscoveryHandler>,
    ) -> Result<(), DiscoveryError>;

    /// 请求停止扫描
    fn cancel_scan(&self);
}

/// 会话产生的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    FoundDevice(DeviceDescriptor),
    Finished,
    Error(String),
}

enum ProviderReport {
    Found(FoundDevice),
    Finished,
    Error(String),
}

struct ChannelHandler {
    tx: mpsc::UnboundedSender<ProviderReport>,
}

impl DiscoveryHandler for ChannelHandler {
    fn on_found(&self, device: FoundDevice) {
        let _ = self.tx.send(ProviderReport::Found(device));
    }

    fn on_finished(&self) {
        let _ = self.tx.send(ProviderReport::Finished);
    }

    fn on_error(&self, message: String) {
        let _ = self.tx.send(ProviderReport::Error(message));
    }
}

/// 一次扫描的生命周期
pub struct DiscoverySession {
    provider: Arc<dyn DiscoveryProvider>,
    rx: mpsc::UnboundedReceiver<ProviderReport>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    done: bool,
    scan_stopped: AtomicBool,
}

impl DiscoverySession {
    /// 向提供方注册并开始扫描
    ///
    /// `timeout` 到期时会话以 `Finished` 结束；`cancel` 被取消后会话不再产生任何事件。
    pub async fn start(
        provider: Arc<dyn DiscoveryProvider>,
        scope: ScanScope,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<Self, DiscoveryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn DiscoveryHandler> = Arc::new(ChannelHandler { tx });

        info!(
            "Starting printer discovery (scan {}s, timeout {:?})",
            scope.duration.as_secs(),
            timeout
        );
        let session = Self {
            provider: Arc::clone(&provider),
            rx,
            cancel,
            deadline: timeout.map(|t| Instant::now() + t),
            done: false,
            scan_stopped: AtomicBool::new(false),
        };
        // 启动失败时 session 被丢弃，同样会停止扫描
        provider.start_scan(scope, handler).await?;
        Ok(session)
    }

    /// 取消会话，可重复调用
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.stop_scan();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 下一个事件；会话结束或被取消后返回 `None`
    pub async fn next_event(&mut self) -> Option<DiscoveryEvent> {
        loop {
            if self.done {
                return None;
            }

            let report = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                () = sleep_until_opt(self.deadline) => {
                    debug!("Discovery session timed out");
                    Some(ProviderReport::Finished)
                }
                report = self.rx.recv() => Some(report.unwrap_or_else(|| {
                    warn!("Discovery provider dropped its handler without finishing");
                    ProviderReport::Finished
                })),
            };

            // 恢复执行后再检查一次，已取消的会话丢弃在途结果
            let Some(report) = report.filter(|_| !self.cancel.is_cancelled()) else {
                debug!("Discovery session cancelled");
                self.finish();
                return None;
            };

            match report {
                ProviderReport::Found(found) => {
                    if let Some(device) = DeviceDescriptor::from_found(found) {
                        debug!("Found printer: {} ({})", device.id, device.display_name);
                        return Some(DiscoveryEvent::FoundDevice(device));
                    }
                }
                ProviderReport::Finished => {
                    info!("Discovery finished");
                    self.finish();
                    return Some(DiscoveryEvent::Finished);
                }
                ProviderReport::Error(message) => {
                    warn!("Discovery error: {}", message);
                    self.finish();
                    return Some(DiscoveryEvent::Error(message));
                }
            }
        }
    }

    /// 转换为事件流
    pub fn into_stream(self) -> impl Stream<Item = DiscoveryEvent> + Send {
        futures_util::stream::unfold(self, |mut session| async move {
            session.next_event().await.map(|event| (event, session))
        })
    }

    fn finish(&mut self) {
        self.done = true;
        self.stop_scan();
    }

    fn stop_scan(&self) {
        if !self.scan_stopped.swap(true, Ordering::AcqRel) {
            debug!("Cancelling discovery");
            self.provider.cancel_scan();
        }
    }
}

impl Drop for DiscoverySession {
    fn drop(&mut self) {
        self.stop_scan();
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// 由测试手动触发回调的提供方
    #[derive(Default)]
    struct ManualProvider {
        handler: Mutex<Option<Arc<dyn DiscoveryHandler>>>,
        cancels: AtomicUsize,
        fail_start: bool,
    }

    impl ManualProvider {
        fn handler(&self) -> Arc<dyn DiscoveryHandler> {
            self.handler.lock().unwrap().clone().unwrap()
        }
    }

    #[async_trait]
    impl DiscoveryProvider for ManualProvider {
        async fn start_scan(
            &self,
            _scope: ScanScope,
            handler: Arc<dyn DiscoveryHandler>,
        ) -> Result<(), DiscoveryError> {
            if self.fail_start {
                return Err(DiscoveryError::Provider("adapter off".to_string()));
            }
            *self.handler.lock().unwrap() = Some(handler);
            Ok(())
        }

        fn cancel_scan(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn found(address: Option<&str>, name: &str) -> FoundDevice {
        FoundDevice {
            address: address.map(str::to_string),
            name: Some(name.to_string()),
        }
    }

    async fn start(provider: &Arc<ManualProvider>, timeout: Option<Duration>) -> DiscoverySession {
        let provider: Arc<dyn DiscoveryProvider> = provider.clone();
        DiscoverySession::start(
            provider,
            ScanScope::default(),
            timeout,
            CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_drops_devices_without_address() {
        let provider = Arc::new(ManualProvider::default());
        let session = start(&provider, None).await;

        let handler = provider.handler();
        handler.on_found(found(None, "ghost"));
        handler.on_found(found(Some(""), "blank"));
        handler.on_found(found(Some("AC:3F:A4:11:22:33"), "ZQ320"));
        handler.on_finished();

        let events: Vec<_> = session.into_stream().collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], DiscoveryEvent::FoundDevice(d) if d.id == "AC:3F:A4:11:22:33"));
        assert_eq!(events[1], DiscoveryEvent::Finished);
        assert_eq!(provider.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_first_terminal_event_wins() {
        let provider = Arc::new(ManualProvider::default());
        let mut session = start(&provider, None).await;

        let handler = provider.handler();
        handler.on_error("radio failure".to_string());
        handler.on_finished();
        handler.on_found(found(Some("AC:3F:A4:11:22:33"), "late"));

        assert_eq!(
            session.next_event().await,
            Some(DiscoveryEvent::Error("radio failure".to_string()))
        );
        assert_eq!(session.next_event().await, None);
        assert_eq!(session.next_event().await, None);
        assert_eq!(provider.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_silences_events() {
        let provider = Arc::new(ManualProvider::default());
        let mut session = start(&provider, None).await;

        provider
            .handler()
            .on_found(found(Some("AC:3F:A4:11:22:33"), "ZQ320"));
        session.cancel();
        session.cancel();

        assert!(session.is_cancelled());
        assert_eq!(session.next_event().await, None);
        drop(session);
        assert_eq!(provider.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_finishes_session() {
        let provider = Arc::new(ManualProvider::default());
        let mut session = start(&provider, Some(Duration::from_secs(5))).await;

        assert_eq!(session.next_event().await, Some(DiscoveryEvent::Finished));
        assert_eq!(session.next_event().await, None);
        assert_eq!(provider.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_failure_stops_scan() {
        let provider = Arc::new(ManualProvider {
            fail_start: true,
            ..Default::default()
        });
        let dyn_provider: Arc<dyn DiscoveryProvider> = provider.clone();
        let result = DiscoverySession::start(
            dyn_provider,
            ScanScope::default(),
            None,
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(DiscoveryError::Provider(_))));
        assert_eq!(provider.cancels.load(Ordering::SeqCst), 1);
    }
}
