//! 子命令实现
//!
//! 每个子命令都只通过 `ConnectionManager` 的命令和状态快照工作。

use crate::test_page::TEST_PAGE_ZPL;
use anyhow::{Context, Result, bail};
use futures_util::StreamExt;
use printlink_core::{
    BleConnector, BleDiscovery, ConnectionManager, DeviceDescriptor, ManagerConfig,
    PrinterSettings, StateSnapshot,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// 使用第一个蓝牙适配器创建管理器
pub async fn build_manager(config: ManagerConfig) -> Result<ConnectionManager> {
    let adapter = printlink_core::ble::default_adapter()
        .await
        .context("Failed to access Bluetooth")?
        .context("No Bluetooth adapters found")?;

    let provider = Arc::new(BleDiscovery::with_adapter(adapter.clone()));
    let factory = Arc::new(BleConnector::with_adapter(adapter));
    Ok(ConnectionManager::new(provider, factory, config))
}

/// 扫描并实时打印发现的设备
pub async fn scan(settings: &PrinterSettings, timeout: Option<u64>) -> Result<bool> {
    let mut config = settings.manager_config();
    config.discovery_timeout = timeout.map(Duration::from_secs);

    let manager = build_manager(config).await?;
    let mut snapshots = manager.state().subscribe();
    let mut seen = HashSet::new();

    manager.start_search();
    while let Some(snapshot) = snapshots.next().await {
        for device in snapshot.results.iter() {
            if seen.insert(device.id.clone()) {
                println!("   [{}] {} ({})", seen.len() - 1, device.display_name, device.id);
            }
        }
        if !snapshot.searching {
            break;
        }
    }

    if seen.is_empty() {
        println!("   未发现打印机");
    }
    let ok = report_final(&manager.snapshot());
    manager.shutdown().await;
    Ok(ok)
}

/// 连接打印机、发送数据并断开
pub async fn print(
    settings: &PrinterSettings,
    device: Option<String>,
    file: Option<PathBuf>,
) -> Result<bool> {
    let address = match device.or_else(|| settings.default_printer.clone()) {
        Some(address) => address,
        None => bail!("No printer given; use --device or `printlink config set-default`"),
    };
    let payload = match &file {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => TEST_PAGE_ZPL.as_bytes().to_vec(),
    };

    let manager = build_manager(settings.manager_config()).await?;
    let state = manager.state();

    // 先扫描，让适配器知道这台设备
    println!("🔍 查找打印机 {}...", address);
    let mut snapshots = state.subscribe();
    manager.start_search();
    let mut target = None;
    while let Some(snapshot) = snapshots.next().await {
        if let Some(device) = snapshot.results.get(&address) {
            target = Some(device.clone());
            break;
        }
        if !snapshot.searching {
            break;
        }
    }
    let target =
        target.unwrap_or_else(|| DeviceDescriptor::new(address.clone(), address.clone()));

    println!("🔗 连接到 {} ({})", target.display_name, target.id);
    snapshots = state.subscribe();
    manager.connect(target);

    // 订阅之后的第一个快照就是 ConnectingTo，连接结束时 connecting_to 被清空
    let mut connected = false;
    while let Some(snapshot) = snapshots.next().await {
        if snapshot.connecting_to.is_none() {
            connected = snapshot.is_connected();
            break;
        }
    }

    if connected {
        println!("🖨️  发送 {} 字节", payload.len());
        manager.submit_print_job(payload);
        manager.disconnect();
    }

    // 关闭在所有已排队命令之后执行
    manager.shutdown().await;
    Ok(report_final(&state.current()))
}

/// 以 JSON 行输出每个状态快照，直到 Ctrl-C
pub async fn watch(settings: &PrinterSettings, device: Option<String>) -> Result<bool> {
    let manager = build_manager(settings.manager_config()).await?;
    let mut snapshots = manager.state().subscribe();
    let mut connect_requested = false;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    manager.start_search();
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            snapshot = snapshots.next() => {
                let Some(snapshot) = snapshot else { break };
                println!("{}", serde_json::to_string(&*snapshot)?);

                if !connect_requested
                    && let Some(target) = device.as_deref().and_then(|id| snapshot.results.get(id))
                {
                    connect_requested = true;
                    manager.connect(target.clone());
                }
            }
        }
    }

    let ok = report_final(&manager.snapshot());
    manager.shutdown().await;
    Ok(ok)
}

fn report_final(snapshot: &StateSnapshot) -> bool {
    if snapshot.has_error() {
        eprintln!("❌ {}", snapshot.error_message);
        false
    } else {
        true
    }
}
