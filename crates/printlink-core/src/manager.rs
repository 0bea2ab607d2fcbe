//! 连接管理器
//!
//! 打印机连接生命周期的状态机。所有状态变更都在一个后台 actor 任务中串行执行：
//!
//! 1. 公开的 [`ConnectionManager`] 只负责把命令放进无界队列，从不阻塞调用方
//! 2. actor 启动/取消扫描任务与连接重试任务，每类任务同时最多一个
//! 3. 后台任务把结果连同自己的代号（generation）发回 actor，过期代号的结果直接丢弃
//! 4. 打印与断开都在 actor 中执行，因此天然互斥
//!
//! 观察者通过 [`ConnectionManager::state`] 订阅状态快照。

use crate::config::ManagerConfig;
use crate::connection::{ConnectOptions, ConnectionFactory, ConnectionHandle, LiveConnection};
use crate::device::{DeviceDescriptor, DiscoveredSet};
use crate::discovery::{DiscoveryEvent, DiscoveryProvider, DiscoverySession, ScanScope};
use crate::error::{CloseFailed, ManagerError};
use crate::state::{self, StateReader, StateSnapshot, StateWriter};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// 连接重试期限耗尽时的错误信息
pub const CONNECT_FAILED_MESSAGE: &str = "Failed to connect to printer";

#[derive(Debug)]
enum Command {
    StartSearch,
    CancelSearch,
    Connect(DeviceDescriptor),
    Disconnect,
    SubmitPrintJob(Vec<u8>),
    Shutdown,
}

/// 后台任务发回 actor 的结果
enum Report {
    Discovery {
        generation: u64,
        event: DiscoveryEvent,
    },
    Connected {
        generation: u64,
        device: DeviceDescriptor,
        handle: Box<dyn ConnectionHandle>,
        attempts: u32,
    },
    ConnectExhausted {
        generation: u64,
        attempts: u32,
    },
}

/// 连接管理器句柄
///
/// 所有命令都是发出即返回，结果只能通过状态快照观察。
pub struct ConnectionManager {
    inbox: mpsc::UnboundedSender<Command>,
    state: StateReader,
    actor: JoinHandle<()>,
}

impl ConnectionManager {
    /// 创建管理器并在当前 tokio 运行时上启动 actor
    pub fn new(
        provider: Arc<dyn DiscoveryProvider>,
        factory: Arc<dyn ConnectionFactory>,
        config: ManagerConfig,
    ) -> Self {
        let (inbox, commands) = mpsc::unbounded_channel();
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let (writer, state) = state::channel(StateSnapshot::default());

        let actor = ManagerActor {
            provider,
            factory,
            config,
            writer,
            commands,
            reports,
            reports_tx,
            next_generation: 0,
            search: None,
            connect: None,
            connection: None,
        };

        Self {
            inbox,
            state,
            actor: tokio::spawn(actor.run()),
        }
    }

    /// 状态读端
    pub fn state(&self) -> StateReader {
        self.state.clone()
    }

    /// 当前快照
    pub fn snapshot(&self) -> Arc<StateSnapshot> {
        self.state.current()
    }

    /// 开始新的扫描，清空上次结果和错误信息
    pub fn start_search(&self) {
        self.send(Command::StartSearch);
    }

    pub fn cancel_search(&self) {
        self.send(Command::CancelSearch);
    }

    /// 连接到指定打印机，会先停止进行中的扫描和连接
    pub fn connect(&self, device: DeviceDescriptor) {
        self.send(Command::Connect(device));
    }

    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// 向已连接的打印机发送打印数据；未连接时忽略
    pub fn submit_print_job(&self, payload: impl Into<Vec<u8>>) {
        self.send(Command::SubmitPrintJob(payload.into()));
    }

    /// 停止所有后台任务、关闭连接并等待 actor 退出
    pub async fn shutdown(self) {
        self.send(Command::Shutdown);
        if let Err(e) = self.actor.await {
            error!("Connection manager task failed: {}", e);
        }
    }

    fn send(&self, command: Command) {
        if let Err(e) = self.inbox.send(command) {
            warn!("{}: dropping {:?}", ManagerError::Shutdown, e.0);
        }
    }
}

/// 一个可取消的后台任务
struct BackgroundTask {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// 取消并等待任务结束
    async fn stop(self) {
        self.cancel.cancel();
        self.join().await;
    }

    async fn join(self) {
        if let Err(e) = self.handle.await
            && e.is_panic()
        {
            error!("Background task {} panicked: {}", self.generation, e);
        }
    }
}

struct ManagerActor {
    provider: Arc<dyn DiscoveryProvider>,
    factory: Arc<dyn ConnectionFactory>,
    config: ManagerConfig,
    writer: StateWriter,
    commands: mpsc::UnboundedReceiver<Command>,
    reports: mpsc::UnboundedReceiver<Report>,
    reports_tx: mpsc::UnboundedSender<Report>,
    next_generation: u64,
    search: Option<BackgroundTask>,
    connect: Option<BackgroundTask>,
    connection: Option<LiveConnection>,
}

impl ManagerActor {
    async fn run(mut self) {
        debug!("Connection manager started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(report) = self.reports.recv() => self.handle_report(report).await,
            }
        }
        self.shutdown().await;
        debug!("Connection manager stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartSearch => self.start_search().await,
            Command::CancelSearch => self.cancel_search().await,
            Command::Connect(device) => self.connect(device).await,
            Command::Disconnect => self.disconnect().await,
            Command::SubmitPrintJob(payload) => self.submit_print_job(&payload).await,
            Command::Shutdown => unreachable!("handled by run loop"),
        }
    }

    async fn handle_report(&mut self, report: Report) {
        match report {
            Report::Discovery { generation, event } => {
                if !is_current(self.search.as_ref(), generation) {
                    debug!("Discarding stale discovery event: {:?}", event);
                    return;
                }
                self.apply_discovery_event(event).await;
            }
            Report::Connected {
                generation,
                device,
                mut handle,
                attempts,
            } => {
                if !is_current(self.connect.as_ref(), generation) {
                    warn!(
                        "Discarding connection to {} from superseded attempt",
                        device.id
                    );
                    if let Err(e) = handle.close().await {
                        warn!("Error closing discarded connection: {}", e);
                    }
                    return;
                }
                if let Some(task) = self.connect.take() {
                    task.join().await;
                }
                info!(
                    "Connected to {} ({}) after {} attempt(s)",
                    device.display_name, device.id, attempts
                );
                self.connection = Some(LiveConnection::new(device.clone(), handle));
                self.writer.update(|s| StateSnapshot {
                    connected: Some(device),
                    connecting_to: None,
                    error_message: String::new(),
                    ..s.clone()
                });
            }
            Report::ConnectExhausted {
                generation,
                attempts,
            } => {
                if !is_current(self.connect.as_ref(), generation) {
                    return;
                }
                if let Some(task) = self.connect.take() {
                    task.join().await;
                }
                if self.connection.is_none() {
                    warn!("Giving up connecting after {} attempt(s)", attempts);
                    self.writer.update(|s| StateSnapshot {
                        connecting_to: None,
                        error_message: CONNECT_FAILED_MESSAGE.to_string(),
                        ..s.clone()
                    });
                }
            }
        }
    }

    async fn start_search(&mut self) {
        info!("Searching printers");
        self.stop_search().await;
        self.stop_connect().await;

        let generation = self.bump_generation();
        self.writer.update(|s| StateSnapshot {
            searching: true,
            connecting_to: None,
            results: DiscoveredSet::new(),
            error_message: String::new(),
            ..s.clone()
        });

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_discovery(
            Arc::clone(&self.provider),
            self.config.scan_scope(),
            self.config.discovery_timeout,
            cancel.clone(),
            generation,
            self.reports_tx.clone(),
        ));
        self.search = Some(BackgroundTask {
            generation,
            cancel,
            handle,
        });
    }

    async fn cancel_search(&mut self) {
        if self.search.is_some() {
            info!("Cancelling search");
            self.stop_search().await;
        } else {
            debug!("No active search to cancel");
        }
        self.writer.update(|s| StateSnapshot {
            searching: false,
            ..s.clone()
        });
    }

    async fn apply_discovery_event(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::FoundDevice(device) => {
                self.writer.update(|s| StateSnapshot {
                    results: s.results.with(device),
                    ..s.clone()
                });
            }
            DiscoveryEvent::Finished => {
                if let Some(task) = self.search.take() {
                    task.join().await;
                }
                self.writer.update(|s| StateSnapshot {
                    searching: false,
                    ..s.clone()
                });
            }
            DiscoveryEvent::Error(message) => {
                if let Some(task) = self.search.take() {
                    task.join().await;
                }
                self.writer.update(|s| StateSnapshot {
                    searching: false,
                    error_message: format!("Searching printers: {message}"),
                    ..s.clone()
                });
            }
        }
    }

    async fn connect(&mut self, device: DeviceDescriptor) {
        info!("Connecting to {} ({})", device.display_name, device.id);
        self.stop_connect().await;
        self.stop_search().await;

        if let Some(previous) = self.connection.take() {
            info!("Closing connection to {} first", previous.device().id);
            if let Err(CloseFailed { error, .. }) = previous.close().await {
                warn!("Error closing previous connection: {}", error);
            }
        }

        let generation = self.bump_generation();
        self.writer.update(|s| StateSnapshot {
            searching: false,
            connecting_to: Some(device.clone()),
            connected: None,
            ..s.clone()
        });

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_connect(
            Arc::clone(&self.factory),
            device,
            ConnectTiming {
                deadline: self.config.connect_deadline,
                retry_delay: self.config.retry_delay,
                options: self.config.connect_options(),
            },
            cancel.clone(),
            generation,
            self.reports_tx.clone(),
        ));
        self.connect = Some(BackgroundTask {
            generation,
            cancel,
            handle,
        });
    }

    async fn disconnect(&mut self) {
        if self.connect.is_some() {
            info!("Cancelling connect attempt");
            self.stop_connect().await;
            self.writer.update(|s| StateSnapshot {
                connecting_to: None,
                ..s.clone()
            });
        }

        let Some(connection) = self.connection.take() else {
            info!("No connected printer");
            return;
        };

        self.writer.update(|s| StateSnapshot {
            disconnecting: true,
            ..s.clone()
        });
        let id = connection.device().id.clone();
        match connection.close().await {
            Ok(()) => {
                info!("Disconnected from {}", id);
                // 保留之前的错误信息（例如打印失败）
                self.writer.update(|s| StateSnapshot {
                    connected: None,
                    ..s.clone()
                });
            }
            Err(CloseFailed { error, connection }) => {
                // 关闭失败时保留连接与已连接设备
                error!("Error closing connection to {}: {}", id, error);
                self.connection = Some(connection);
                self.writer.update(|s| StateSnapshot {
                    error_message: format!("Error closing connection: {error}"),
                    ..s.clone()
                });
            }
        }

        self.writer.update(|s| StateSnapshot {
            disconnecting: false,
            ..s.clone()
        });
    }

    async fn submit_print_job(&mut self, payload: &[u8]) {
        let Some(connection) = self.connection.as_mut() else {
            warn!(
                "No connected printer, ignoring print job ({} bytes)",
                payload.len()
            );
            return;
        };

        let id = connection.device().id.clone();
        match connection.send(payload).await {
            Ok(()) => info!("Sent print job ({} bytes) to {}", payload.len(), id),
            Err(e) => {
                error!("Failed to send print job to {}: {}", id, e);
                self.writer.update(|s| StateSnapshot {
                    error_message: format!("Failed to print: {e}"),
                    ..s.clone()
                });
            }
        }
    }

    async fn shutdown(&mut self) {
        self.stop_search().await;
        self.stop_connect().await;
        if let Some(connection) = self.connection.take() {
            info!("Closing connection to {}", connection.device().id);
            if let Err(CloseFailed { error, .. }) = connection.close().await {
                warn!("Error closing connection on shutdown: {}", error);
            }
        }
        self.writer.update(|s| StateSnapshot {
            searching: false,
            connecting_to: None,
            connected: None,
            disconnecting: false,
            ..s.clone()
        });
    }

    async fn stop_search(&mut self) {
        if let Some(task) = self.search.take() {
            task.stop().await;
        }
    }

    async fn stop_connect(&mut self) {
        if let Some(task) = self.connect.take() {
            task.stop().await;
        }
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

fn is_current(task: Option<&BackgroundTask>, generation: u64) -> bool {
    task.is_some_and(|t| t.generation == generation)
}

async fn run_discovery(
    provider: Arc<dyn DiscoveryProvider>,
    scope: ScanScope,
    timeout: Option<Duration>,
    cancel: CancellationToken,
    generation: u64,
    reports: mpsc::UnboundedSender<Report>,
) {
    let started = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            provider.cancel_scan();
            return;
        }
        started = DiscoverySession::start(Arc::clone(&provider), scope, timeout, cancel.clone()) => started,
    };

    let mut session = match started {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to start discovery: {}", e);
            if !cancel.is_cancelled() {
                let _ = reports.send(Report::Discovery {
                    generation,
                    event: DiscoveryEvent::Error(e.to_string()),
                });
            }
            return;
        }
    };

    while let Some(event) = session.next_event().await {
        if reports.send(Report::Discovery { generation, event }).is_err() {
            break;
        }
    }
}

struct ConnectTiming {
    deadline: Duration,
    retry_delay: Duration,
    options: ConnectOptions,
}

/// 连接重试循环
///
/// 每次迭代先检查总期限；打开与等待期间都可被取消，取消时不上报任何结果。
async fn run_connect(
    factory: Arc<dyn ConnectionFactory>,
    device: DeviceDescriptor,
    timing: ConnectTiming,
    cancel: CancellationToken,
    generation: u64,
    reports: mpsc::UnboundedSender<Report>,
) {
    let deadline = Instant::now() + timing.deadline;
    let mut attempts = 0u32;

    while Instant::now() < deadline {
        attempts += 1;
        debug!("Connect attempt {} to {}", attempts, device.id);

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            result = time::timeout_at(deadline, factory.open(&device.id, &timing.options)) => result,
        };

        match result {
            Ok(Ok(mut handle)) => {
                if cancel.is_cancelled() {
                    if let Err(e) = handle.close().await {
                        warn!("Error closing cancelled connection: {}", e);
                    }
                    return;
                }
                let _ = reports.send(Report::Connected {
                    generation,
                    device,
                    handle,
                    attempts,
                });
                return;
            }
            Ok(Err(e)) => debug!("Connect attempt {} failed: {}", attempts, e),
            Err(_) => {
                debug!("Connect attempt {} cut short by deadline", attempts);
                break;
            }
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = time::sleep(timing.retry_delay) => {}
        }
    }

    if !cancel.is_cancelled() {
        let _ = reports.send(Report::ConnectExhausted {
            generation,
            attempts,
        });
    }
}
