//! 设备描述与扫描结果集合

use log::warn;
use serde::Serialize;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// 可发现的打印机
///
/// `id` 为硬件地址，是唯一键；两个描述符仅按 `id` 比较。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub id: String,
    pub display_name: String,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    /// 从扫描回报构造描述符
    ///
    /// 地址缺失或为空时返回 `None`，名称缺失时用地址代替。
    pub fn from_found(found: FoundDevice) -> Option<Self> {
        let id = match found.address {
            Some(addr) if !addr.trim().is_empty() => addr,
            _ => {
                warn!(
                    "Found printer with no address (name={:?}), dropping",
                    found.name
                );
                return None;
            }
        };
        let display_name = found
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| id.clone());
        Some(Self { id, display_name })
    }
}

impl PartialEq for DeviceDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DeviceDescriptor {}

impl Hash for DeviceDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// 扫描提供方上报的原始设备信息
#[derive(Debug, Clone, Default)]
pub struct FoundDevice {
    pub address: Option<String>,
    pub name: Option<String>,
}

/// 按 `id` 去重的扫描结果
#[derive(Debug, Clone, Default)]
pub struct DiscoveredSet {
    devices: BTreeMap<String, DeviceDescriptor>,
}

impl DiscoveredSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入设备，相同 `id` 覆盖旧值
    pub fn insert(&mut self, device: DeviceDescriptor) {
        self.devices.insert(device.id.clone(), device);
    }

    /// 返回加入 `device` 后的新集合
    #[must_use]
    pub fn with(&self, device: DeviceDescriptor) -> Self {
        let mut next = self.clone();
        next.insert(device);
        next
    }

    pub fn get(&self, id: &str) -> Option<&DeviceDescriptor> {
        self.devices.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.values()
    }

    /// 按 `id` 排序的列表
    pub fn to_vec(&self) -> Vec<DeviceDescriptor> {
        self.devices.values().cloned().collect()
    }
}

impl FromIterator<DeviceDescriptor> for DiscoveredSet {
    fn from_iter<T: IntoIterator<Item = DeviceDescriptor>>(iter: T) -> Self {
        let mut set = Self::new();
        for device in iter {
            set.insert(device);
        }
        set
    }
}

/// 集合比较包含显示名称，同一 `id` 改名也视为变化
impl PartialEq for DiscoveredSet {
    fn eq(&self, other: &Self) -> bool {
        self.devices.len() == other.devices.len()
            && self
                .devices
                .values()
                .zip(other.devices.values())
                .all(|(a, b)| a.id == b.id && a.display_name == b.display_name)
    }
}

impl Eq for DiscoveredSet {}

impl Serialize for DiscoveredSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.devices.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_equality_by_id() {
        let a = DeviceDescriptor::new("AC:3F:A4:00:00:01", "ZQ320");
        let b = DeviceDescriptor::new("AC:3F:A4:00:00:01", "ZQ320 (renamed)");
        let c = DeviceDescriptor::new("AC:3F:A4:00:00:02", "ZQ320");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_from_found_drops_missing_address() {
        assert!(DeviceDescriptor::from_found(FoundDevice::default()).is_none());
        assert!(
            DeviceDescriptor::from_found(FoundDevice {
                address: Some("  ".to_string()),
                name: Some("ZQ520".to_string()),
            })
            .is_none()
        );
    }

    #[test]
    fn test_from_found_name_fallback() {
        let dev = DeviceDescriptor::from_found(FoundDevice {
            address: Some("AC:3F:A4:00:00:09".to_string()),
            name: None,
        })
        .unwrap();
        assert_eq!(dev.display_name, "AC:3F:A4:00:00:09");
    }

    #[test]
    fn test_discovered_set_counts_distinct_ids() {
        let ids = ["03", "01", "02", "01", "03", "03"];
        let set: DiscoveredSet = ids
            .iter()
            .enumerate()
            .map(|(i, id)| DeviceDescriptor::new(*id, format!("printer-{i}")))
            .collect();

        assert_eq!(set.len(), 3);
        // 重复 id 以最后一次为准
        assert_eq!(set.get("03").unwrap().display_name, "printer-5");
        let order: Vec<_> = set.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(order, ["01", "02", "03"]);
    }

    #[test]
    fn test_rename_changes_set() {
        let before = DiscoveredSet::new().with(DeviceDescriptor::new("01", "01"));
        let after = before.with(DeviceDescriptor::new("01", "ZQ320 Front Desk"));
        assert_ne!(before, after);
        assert_eq!(after.len(), 1);
        assert_eq!(after, after.clone());
    }

    #[test]
    fn test_with_leaves_original_untouched() {
        let empty = DiscoveredSet::new();
        let one = empty.with(DeviceDescriptor::new("01", "a"));
        assert!(empty.is_empty());
        assert!(one.contains("01"));
    }
}
