//! 引擎配置
//!
//! 持有应用身份信息（applicationId / buildVariant / appVersion / schemaVersion）
//! 与文件系统布局：活动根目录、工作根目录及由其派生的
//! 暂存目录、旧数据备份目录、导出目录和恢复日志路径。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::manifest::BuildVariant;

/// 工作根目录下的暂存目录名（解压落点，导入中途之外随时可删）
pub const STAGING_DIR_NAME: &str = "staging";
/// 工作根目录下的旧数据备份目录名（SWAPPING 阶段中断前有意义）
pub const BACKUP_OLD_DIR_NAME: &str = "backup_old";
/// 工作根目录下的导出目录名
pub const EXPORTS_DIR_NAME: &str = "exports";
/// 恢复日志文件名，位于工作根目录下、上述目录之外
pub const JOURNAL_FILE_NAME: &str = "restore_journal.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// 拥有方应用的字符串身份，导入时必须精确匹配
    pub application_id: String,
    /// 构建变体，仅作参考信息
    pub build_variant: BuildVariant,
    pub app_version: String,
    /// 数据格式版本，导入时要求精确匹配（不做前后兼容）
    pub schema_version: u32,
    /// 活动数据根目录（app.db、settings.json、媒体目录所在处）
    pub live_root: PathBuf,
    /// 工作根目录（暂存/旧数据备份/导出/恢复日志所在处），不得位于活动根内
    pub work_root: PathBuf,
}

impl EngineConfig {
    pub fn new(
        application_id: impl Into<String>,
        build_variant: BuildVariant,
        app_version: impl Into<String>,
        schema_version: u32,
        live_root: impl Into<PathBuf>,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            application_id: application_id.into(),
            build_variant,
            app_version: app_version.into(),
            schema_version,
            live_root: live_root.into(),
            work_root: work_root.into(),
        }
    }

    pub fn staging_root(&self) -> PathBuf {
        self.work_root.join(STAGING_DIR_NAME)
    }

    pub fn backup_old_root(&self) -> PathBuf {
        self.work_root.join(BACKUP_OLD_DIR_NAME)
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.work_root.join(EXPORTS_DIR_NAME)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.work_root.join(JOURNAL_FILE_NAME)
    }

    pub fn live_database_path(&self) -> PathBuf {
        crate::storage::StorageUnit::Database.live_path(&self.live_root)
    }
}

/// 确保目录存在，返回其路径
pub(crate) fn ensure_dir(dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    Ok(dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> EngineConfig {
        EngineConfig::new(
            "com.example.notebook",
            BuildVariant::Release,
            "1.4.2",
            7,
            "/data/live",
            "/data/work",
        )
    }

    #[test]
    fn test_derived_paths() {
        let cfg = sample_config();
        assert_eq!(cfg.staging_root(), PathBuf::from("/data/work/staging"));
        assert_eq!(cfg.backup_old_root(), PathBuf::from("/data/work/backup_old"));
        assert_eq!(
            cfg.journal_path(),
            PathBuf::from("/data/work/restore_journal.json")
        );
        assert_eq!(cfg.live_database_path(), PathBuf::from("/data/live/app.db"));
    }

    #[test]
    fn test_camel_case_serialization() {
        let cfg = sample_config();
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"applicationId\""), "应使用 camelCase 字段名");
        assert!(json.contains("\"schemaVersion\""));
    }
}
