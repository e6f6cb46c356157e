//! Package events: saves, additions, renames and deletions of on-disk assets.

use serde::{Deserialize, Serialize};

use crate::activity::EventId;

/// What happened to the package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PackageUpdateType {
    Added = 1,
    Saved = 2,
    Renamed = 3,
    Deleted = 4,
    /// Fencing update without content, bytes migrate from the head revision
    Dummy = 5,
}

/// Package metadata carried with every package event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub package_name: String,
    /// Destination name, only for `Renamed`
    pub new_package_name: Option<String>,
    /// File extension without the dot (`umap`, `uasset`, ...)
    pub extension: String,
    pub update_type: PackageUpdateType,
    /// Live transactions with an event id up to this one are obsoleted by the save
    pub transaction_event_id_at_save: EventId,
    pub pre_save: bool,
    pub auto_save: bool,
}

impl PackageInfo {
    pub fn new(package_name: impl Into<String>, update_type: PackageUpdateType) -> Self {
        Self {
            package_name: package_name.into(),
            new_package_name: None,
            extension: "uasset".to_string(),
            update_type,
            transaction_event_id_at_save: 0,
            pre_save: false,
            auto_save: false,
        }
    }

    pub fn renamed(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            new_package_name: Some(to.into()),
            ..Self::new(from, PackageUpdateType::Renamed)
        }
    }

    /// Name the package has after this event is applied.
    pub fn resulting_package_name(&self) -> &str {
        match (&self.update_type, &self.new_package_name) {
            (PackageUpdateType::Renamed, Some(name)) => name,
            _ => &self.package_name,
        }
    }
}

/// Package content: embedded, or a reference into the file-sharing side channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PackageData {
    Empty,
    Inline(Vec<u8>),
    Shared { file_id: String, size: u64 },
}

impl PackageData {
    pub fn is_empty(&self) -> bool {
        matches!(self, PackageData::Empty)
    }

    /// Declared size in bytes.
    pub fn size(&self) -> u64 {
        match self {
            PackageData::Empty => 0,
            PackageData::Inline(bytes) => bytes.len() as u64,
            PackageData::Shared { size, .. } => *size,
        }
    }
}

/// A package update. `revision` is assigned by the ledger on append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageEvent {
    pub info: PackageInfo,
    pub data: PackageData,
    pub revision: i64,
}

impl PackageEvent {
    pub fn new(info: PackageInfo, data: PackageData) -> Self {
        Self {
            info,
            data,
            revision: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resulting_name() {
        let saved = PackageInfo::new("/Game/Foo", PackageUpdateType::Saved);
        assert_eq!(saved.resulting_package_name(), "/Game/Foo");

        let renamed = PackageInfo::renamed("/Game/Foo", "/Game/Bar");
        assert_eq!(renamed.resulting_package_name(), "/Game/Bar");
        assert_eq!(renamed.update_type, PackageUpdateType::Renamed);
    }

    #[test]
    fn test_package_data_size() {
        assert_eq!(PackageData::Empty.size(), 0);
        assert!(PackageData::Empty.is_empty());
        assert_eq!(PackageData::Inline(vec![0; 12]).size(), 12);
        let shared = PackageData::Shared { file_id: "abc".into(), size: 4096 };
        assert_eq!(shared.size(), 4096);
        assert!(!shared.is_empty());
    }
}
