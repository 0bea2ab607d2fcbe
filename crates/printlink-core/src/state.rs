//! 连接状态快照与状态存储
//!
//! 快照不可变，每次状态变化都整体替换。写端 [`StateWriter`] 只有一个，
//! 由连接管理器持有；读端 [`StateReader`] 可任意克隆。

use crate::device::{DeviceDescriptor, DiscoveredSet};
use crate::error::ManagerError;
use futures_util::Stream;
use log::warn;
use serde::{Serialize, Serializer};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

/// 快照历史通道容量
const HISTORY_CAPACITY: usize = 256;

/// 观察者看到的状态快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub searching: bool,
    #[serde(serialize_with = "serialize_display_name")]
    pub connecting_to: Option<DeviceDescriptor>,
    pub results: DiscoveredSet,
    pub connected: Option<DeviceDescriptor>,
    pub disconnecting: bool,
    /// 空字符串表示没有错误
    pub error_message: String,
}

fn serialize_display_name<S: Serializer>(
    device: &Option<DeviceDescriptor>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match device {
        Some(d) => serializer.serialize_some(&d.display_name),
        None => serializer.serialize_none(),
    }
}

impl StateSnapshot {
    /// 以标签联合的形式查看当前阶段
    pub fn phase(&self) -> ConnectionState {
        match (&self.connected, &self.connecting_to) {
            (Some(device), _) if self.disconnecting => ConnectionState::Disconnecting {
                device: device.clone(),
            },
            (_, Some(target)) => ConnectionState::ConnectingTo {
                target: target.clone(),
            },
            _ if self.searching => ConnectionState::Searching {
                results: self.results.clone(),
            },
            (Some(device), None) => ConnectionState::Connected {
                device: device.clone(),
            },
            (None, None) => ConnectionState::Idle,
        }
    }

    pub fn has_error(&self) -> bool {
        !self.error_message.is_empty()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.is_some()
    }
}

/// 连接生命周期阶段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Searching { results: DiscoveredSet },
    ConnectingTo { target: DeviceDescriptor },
    Connected { device: DeviceDescriptor },
    Disconnecting { device: DeviceDescriptor },
}

/// 创建一对写端/读端
pub fn channel(initial: StateSnapshot) -> (StateWriter, StateReader) {
    let (tx, rx) = watch::channel(Arc::new(initial));
    let (history, _) = broadcast::channel(HISTORY_CAPACITY);
    let reader = StateReader {
        rx,
        history: history.clone(),
    };
    (StateWriter { tx, history }, reader)
}

/// 唯一写端
pub struct StateWriter {
    tx: watch::Sender<Arc<StateSnapshot>>,
    history: broadcast::Sender<Arc<StateSnapshot>>,
}

impl StateWriter {
    pub fn current(&self) -> Arc<StateSnapshot> {
        Arc::clone(&self.tx.borrow())
    }

    /// 由当前快照构造新快照并发布
    ///
    /// 新旧快照相同时不发布。
    pub fn update(&self, f: impl FnOnce(&StateSnapshot) -> StateSnapshot) {
        let history = &self.history;
        self.tx.send_if_modified(|current| {
            let next = f(&**current);
            if next == **current {
                return false;
            }
            let next = Arc::new(next);
            // 在持有写锁时发布，保证历史流与当前值顺序一致
            let _ = history.send(Arc::clone(&next));
            *current = next;
            true
        });
    }
}

/// 只读端
#[derive(Clone)]
pub struct StateReader {
    rx: watch::Receiver<Arc<StateSnapshot>>,
    history: broadcast::Sender<Arc<StateSnapshot>>,
}

impl StateReader {
    pub fn current(&self) -> Arc<StateSnapshot> {
        Arc::clone(&self.rx.borrow())
    }

    /// 最新值接收器，可能跳过中间快照
    pub fn watch(&self) -> watch::Receiver<Arc<StateSnapshot>> {
        self.rx.clone()
    }

    /// 订阅之后产生的每一个快照，按产生顺序
    ///
    /// 所有订阅者看到相同的顺序。落后超过 `HISTORY_CAPACITY`（256）个快照的订阅者
    /// 会丢失最旧的那部分（记录 warn 日志），之后从仍保留的最旧快照继续，顺序不变。
    /// 只关心最新值时用 [`watch`](Self::watch)。
    pub fn subscribe(&self) -> impl Stream<Item = Arc<StateSnapshot>> + Send + Unpin + 'static {
        BroadcastStream::new(self.history.subscribe()).filter_map(|item| match item {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("State subscriber fell behind: {}", e);
                None
            }
        })
    }

    /// 等待满足条件的快照（当前值满足时立即返回）
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&StateSnapshot) -> bool,
    ) -> Result<Arc<StateSnapshot>, ManagerError> {
        let mut rx = self.rx.clone();
        let snapshot = rx
            .wait_for(|s| predicate(s.as_ref()))
            .await
            .map_err(|_| ManagerError::Shutdown)?;
        Ok(Arc::clone(&snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn printer(id: &str) -> DeviceDescriptor {
        DeviceDescriptor::new(id, format!("Printer {id}"))
    }

    #[test]
    fn test_phase_precedence() {
        let mut s = StateSnapshot::default();
        assert_eq!(s.phase(), ConnectionState::Idle);

        s.searching = true;
        assert!(matches!(s.phase(), ConnectionState::Searching { .. }));

        s.connecting_to = Some(printer("01"));
        assert_eq!(
            s.phase(),
            ConnectionState::ConnectingTo {
                target: printer("01")
            }
        );

        s.connecting_to = None;
        s.searching = false;
        s.connected = Some(printer("01"));
        assert!(matches!(s.phase(), ConnectionState::Connected { .. }));

        s.disconnecting = true;
        assert!(matches!(s.phase(), ConnectionState::Disconnecting { .. }));
    }

    #[test]
    fn test_snapshot_json_shape() {
        let snapshot = StateSnapshot {
            connecting_to: Some(printer("01")),
            results: [printer("02"), printer("01")].into_iter().collect(),
            ..Default::default()
        };
        let json = serde_json::to_value(&snapshot).unwrap();

        assert_eq!(json["connectingTo"], "Printer 01");
        assert_eq!(json["results"][0]["id"], "01");
        assert_eq!(json["results"][1]["displayName"], "Printer 02");
        assert_eq!(json["connected"], serde_json::Value::Null);
        assert_eq!(json["errorMessage"], "");
    }

    #[tokio::test]
    async fn test_subscribers_see_same_order() {
        let (writer, reader) = channel(StateSnapshot::default());
        let mut a = reader.subscribe();
        let mut b = reader.clone().subscribe();

        writer.update(|s| StateSnapshot {
            searching: true,
            ..s.clone()
        });
        writer.update(|s| StateSnapshot {
            results: s.results.with(printer("01")),
            ..s.clone()
        });
        writer.update(|s| StateSnapshot {
            searching: false,
            ..s.clone()
        });

        for stream in [&mut a, &mut b] {
            let first = stream.next().await.unwrap();
            let second = stream.next().await.unwrap();
            let third = stream.next().await.unwrap();
            assert!(first.searching && first.results.is_empty());
            assert!(second.searching && second.results.len() == 1);
            assert!(!third.searching && third.results.len() == 1);
        }
        assert_eq!(*reader.current(), *writer.current());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_resumes_in_order() {
        let (writer, reader) = channel(StateSnapshot::default());
        let mut stream = reader.subscribe();

        let total = HISTORY_CAPACITY + 44;
        for i in 0..total {
            writer.update(|s| StateSnapshot {
                error_message: i.to_string(),
                ..s.clone()
            });
        }

        // 最旧的 44 个已被覆盖，剩余部分按顺序送达
        for i in (total - HISTORY_CAPACITY)..total {
            let snapshot = stream.next().await.unwrap();
            assert_eq!(snapshot.error_message, i.to_string());
        }
        assert_eq!(reader.current().error_message, (total - 1).to_string());
    }

    #[tokio::test]
    async fn test_unchanged_update_is_not_published() {
        let (writer, reader) = channel(StateSnapshot::default());
        let mut rx = reader.watch();
        rx.borrow_and_update();

        writer.update(StateSnapshot::clone);
        assert!(!rx.has_changed().unwrap());

        writer.update(|s| StateSnapshot {
            error_message: "boom".to_string(),
            ..s.clone()
        });
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_returns_current_when_matching() {
        let (writer, reader) = channel(StateSnapshot::default());
        let snapshot = reader.wait_for(|s| !s.searching).await.unwrap();
        assert!(!snapshot.searching);

        drop(writer);
        assert!(reader.wait_for(|s| s.searching).await.is_err());
    }
}
