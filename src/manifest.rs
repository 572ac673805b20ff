//! 备份清单（backup_manifest.json）
//!
//! 每次导出写入一次、每次导入消费一次的归档内元数据。
//! 它是归档中**最后**写入的条目：清单存在即意味着归档完整，
//! 导出中途崩溃产生的截断归档必然缺少清单，读取方可以直接判为无效。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::EngineConfig;
use crate::storage::StorageUnit;

/// 归档内清单条目的固定名称
pub const MANIFEST_FILE: &str = "backup_manifest.json";

/// 构建变体，仅作参考信息，不参与校验
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildVariant {
    Debug,
    Release,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    /// 拥有方应用身份，导入时要求与运行中应用精确匹配
    pub application_id: String,
    pub build_variant: BuildVariant,
    pub app_version: String,
    /// 数据格式版本，要求精确匹配，不做前后兼容
    pub schema_version: u32,
    /// RFC3339 导出时间戳
    pub timestamp: String,
    /// 归档条目路径 -> SHA256 小写十六进制摘要（比较时忽略大小写）
    #[serde(default)]
    pub file_checksums: HashMap<String, String>,
}

impl BackupManifest {
    /// 以当前应用身份创建空清单，校验和在打包过程中填充
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            application_id: config.application_id.clone(),
            build_variant: config.build_variant,
            app_version: config.app_version.clone(),
            schema_version: config.schema_version,
            timestamp: Utc::now().to_rfc3339(),
            file_checksums: HashMap::new(),
        }
    }

    pub fn add_checksum(&mut self, entry_path: impl Into<String>, digest: impl Into<String>) {
        self.file_checksums.insert(entry_path.into(), digest.into());
    }

    /// 清单是否覆盖了某个存储单元（目录单元按条目前缀匹配）
    pub fn covers_unit(&self, unit: StorageUnit) -> bool {
        self.file_checksums
            .keys()
            .any(|entry| unit.matches_entry(entry))
    }
}
