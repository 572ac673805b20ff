//! 存储单元定义
//!
//! 存储单元是持久状态的一个逻辑分区：主数据库、设置文件、各媒体目录。
//! 集合是固定的，写入方和读取方共享同一份定义；归档中出现的未知条目
//! 会被容忍并忽略（记录为 extra），不会导致失败。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 应用持久状态的逻辑分区
///
/// 每个单元有且只有一个活动数据中的标准位置和一个标准归档条目名。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageUnit {
    /// 主数据库 - app.db
    /// 必备单元：清单中必须出现其校验和条目
    Database,

    /// 用户设置（键值偏好存储）- settings.json
    Settings,

    /// 用户上传图片 - images/
    Images,

    /// 用户文档 - documents/
    Documents,
}

impl StorageUnit {
    /// 固定的存储单元集合
    pub const ALL: &'static [StorageUnit] = &[
        StorageUnit::Database,
        StorageUnit::Settings,
        StorageUnit::Images,
        StorageUnit::Documents,
    ];

    /// 活动根目录下的标准相对路径（目录单元以 `/` 结尾）
    pub fn relative_path_pattern(&self) -> &'static str {
        match self {
            StorageUnit::Database => "app.db",
            StorageUnit::Settings => "settings.json",
            StorageUnit::Images => "images/",
            StorageUnit::Documents => "documents/",
        }
    }

    /// 归档条目名（文件单元）或条目前缀（目录单元）
    pub fn archive_name(&self) -> &'static str {
        // 归档内布局与活动目录布局一致
        self.relative_path_pattern()
    }

    /// 日志与恢复日志中使用的单元键
    pub fn key(&self) -> &'static str {
        match self {
            StorageUnit::Database => "database",
            StorageUnit::Settings => "settings",
            StorageUnit::Images => "images",
            StorageUnit::Documents => "documents",
        }
    }

    /// 按键反查单元，用于读取恢复日志
    pub fn from_key(key: &str) -> Option<StorageUnit> {
        Self::ALL.iter().copied().find(|u| u.key() == key)
    }

    pub fn is_directory(&self) -> bool {
        self.relative_path_pattern().ends_with('/')
    }

    /// 必备单元缺失会导致清单校验失败
    pub fn is_required(&self) -> bool {
        matches!(self, StorageUnit::Database)
    }

    /// 活动根目录下的绝对位置
    pub fn live_path(&self, live_root: &Path) -> PathBuf {
        live_root.join(self.relative_path_pattern().trim_end_matches('/'))
    }

    /// 检查归档条目路径是否属于此存储单元
    pub fn matches_entry(&self, entry_name: &str) -> bool {
        let pattern = self.archive_name();
        if pattern.ends_with('/') {
            entry_name.starts_with(pattern)
                || entry_name == &pattern[..pattern.len() - 1]
        } else {
            entry_name == pattern
        }
    }

    /// 归档条目所属的存储单元；不属于任何单元的条目视为 extra
    pub fn classify_entry(entry_name: &str) -> Option<StorageUnit> {
        Self::ALL
            .iter()
            .copied()
            .find(|u| u.matches_entry(entry_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_database_entry() {
        assert_eq!(
            StorageUnit::classify_entry("app.db"),
            Some(StorageUnit::Database)
        );
    }

    #[test]
    fn test_classify_media_entries() {
        assert_eq!(
            StorageUnit::classify_entry("images/2026/photo.png"),
            Some(StorageUnit::Images)
        );
        assert_eq!(
            StorageUnit::classify_entry("documents/report.pdf"),
            Some(StorageUnit::Documents)
        );
    }

    #[test]
    fn test_unknown_entry_is_extra() {
        assert_eq!(StorageUnit::classify_entry("lance/vectors.bin"), None);
        assert_eq!(StorageUnit::classify_entry("app.db-wal"), None, "辅助文件不属于任何单元");
    }

    #[test]
    fn test_key_roundtrip() {
        for unit in StorageUnit::ALL {
            assert_eq!(StorageUnit::from_key(unit.key()), Some(*unit));
        }
    }

    #[test]
    fn test_only_database_is_required() {
        let required: Vec<_> = StorageUnit::ALL
            .iter()
            .filter(|u| u.is_required())
            .collect();
        assert_eq!(required, vec![&StorageUnit::Database]);
    }
}
