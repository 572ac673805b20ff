//! 启动恢复
//!
//! 必须在任何其他存储访问之前调用一次。读取恢复日志；日志不存在即无事可做。
//! 否则按阶段收尾，保证无论上一次崩溃发生在哪个瞬间，活动数据都回到一致状态。
//! 恢复是幂等的：连续运行两次、第二次必然是安全的空操作。

use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::errors::BackupError;
use crate::fsops::remove_path_if_exists;
use crate::journal::{RestoreJournal, RestorePhase};
use crate::storage::StorageUnit;
use crate::swap::rollback_from_backup;

type Result<T> = std::result::Result<T, BackupError>;

pub struct RecoveryRunner<'a> {
    config: &'a EngineConfig,
}

impl<'a> RecoveryRunner<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// 检查并收尾未完成的恢复
    pub fn recover(&self) -> Result<()> {
        let journal_path = self.config.journal_path();
        let journal = match RestoreJournal::read(&journal_path)? {
            Some(j) => j,
            None => {
                debug!("[Recovery] 无恢复日志，跳过");
                return Ok(());
            }
        };

        info!(
            "[Recovery] 检测到未完成的恢复 phase={:?} timestamp={}",
            journal.phase, journal.timestamp
        );

        match journal.phase {
            RestorePhase::Extracting => {
                // 活动位置尚未被覆盖。但崩溃可能发生在活动数据移入 backup_old
                // 的过程中（SWAPPING 日志尚未落盘），此时按固定布局扫描
                // backup_old 并把找到的单元移回活动位置。
                let scanned = self.scan_backup_old_layout();
                if !scanned.is_empty() {
                    warn!(
                        "[Recovery] EXTRACTING 阶段检测到 backup_old 残留 ({} 个单元)，回滚",
                        scanned.len()
                    );
                    rollback_from_backup(&self.config.live_root, &scanned)?;
                }
                self.clear_artifacts()?;
                RestoreJournal::delete(&journal_path)?;
                info!("[Recovery] EXTRACTING 收尾完成，暂存已丢弃");
            }
            RestorePhase::Swapping => {
                // 活动数据可能已被部分替换；从日志（或扫描 backup_old）回滚
                let backup_paths = if journal.backup_paths.is_empty() {
                    warn!("[Recovery] 日志缺少 backupPaths，按固定布局扫描 backup_old");
                    self.scan_backup_old_layout()
                } else {
                    journal.backup_paths.clone()
                };
                rollback_from_backup(&self.config.live_root, &backup_paths)?;
                self.clear_artifacts()?;
                RestoreJournal::delete(&journal_path)?;
                info!("[Recovery] SWAPPING 收尾完成，活动数据已回滚到导入前快照");
            }
            RestorePhase::Completed => {
                // 活动数据已完整替换，只剩清理
                self.clear_artifacts()?;
                RestoreJournal::delete(&journal_path)?;
                info!("[Recovery] COMPLETED 收尾完成，残留已清理");
            }
            RestorePhase::RollbackAttempted => {
                // 不再重试回滚，避免在两个不一致快照之间摆动
                warn!("[Recovery] 上次恢复已尝试过回滚，仅清理簿记，不再重试");
                self.clear_artifacts()?;
                RestoreJournal::delete(&journal_path)?;
            }
        }

        Ok(())
    }

    /// 按固定布局扫描 backup_old 根，重建 backupPaths
    fn scan_backup_old_layout(&self) -> HashMap<String, PathBuf> {
        let backup_old = self.config.backup_old_root();
        let mut found = HashMap::new();
        for unit in StorageUnit::ALL {
            let path = unit.live_path(&backup_old);
            if path.exists() {
                found.insert(unit.key().to_string(), path);
            }
        }
        found
    }

    /// 删除暂存目录与 backup_old 根
    fn clear_artifacts(&self) -> Result<()> {
        remove_path_if_exists(&self.config.staging_root())
            .map_err(|e| BackupError::file_system(format!("清理暂存目录失败: {}", e)))?;
        remove_path_if_exists(&self.config.backup_old_root())
            .map_err(|e| BackupError::file_system(format!("清理 backup_old 失败: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::BuildVariant;
    use std::fs;
    use tempfile::TempDir;

    fn test_config(live: &std::path::Path, work: &std::path::Path) -> EngineConfig {
        EngineConfig::new(
            "com.example.notebook",
            BuildVariant::Debug,
            "1.0.0",
            1,
            live,
            work,
        )
    }

    #[test]
    fn test_recover_no_journal_is_noop() {
        let live = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        fs::write(live.path().join("app.db"), b"live db").unwrap();
        let config = test_config(live.path(), work.path());

        RecoveryRunner::new(&config).recover().unwrap();

        // 无日志时不得有任何文件系统变更
        assert_eq!(fs::read(live.path().join("app.db")).unwrap(), b"live db");
        assert!(!config.staging_root().exists());
    }

    #[test]
    fn test_recover_extracting_discards_staging() {
        let live = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let config = test_config(live.path(), work.path());

        fs::write(live.path().join("app.db"), b"live db").unwrap();
        fs::create_dir_all(config.staging_root()).unwrap();
        fs::write(config.staging_root().join("app.db"), b"staged db").unwrap();
        RestoreJournal::new(RestorePhase::Extracting)
            .write(&config.journal_path())
            .unwrap();

        RecoveryRunner::new(&config).recover().unwrap();

        assert_eq!(fs::read(live.path().join("app.db")).unwrap(), b"live db", "活动数据不应被改动");
        assert!(!config.staging_root().exists(), "暂存目录应被丢弃");
        assert!(!config.journal_path().exists(), "日志应被删除");
    }

    #[test]
    fn test_recover_extracting_rolls_back_backup_old_leftovers() {
        let live = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let config = test_config(live.path(), work.path());

        // 模拟崩溃发生在活动数据移入 backup_old 途中、SWAPPING 日志落盘之前
        let backup_old = config.backup_old_root();
        fs::create_dir_all(&backup_old).unwrap();
        fs::write(backup_old.join("app.db"), b"moved live db").unwrap();
        RestoreJournal::new(RestorePhase::Extracting)
            .write(&config.journal_path())
            .unwrap();

        RecoveryRunner::new(&config).recover().unwrap();

        assert_eq!(
            fs::read(live.path().join("app.db")).unwrap(),
            b"moved live db",
            "backup_old 中的单元应被移回活动位置"
        );
        assert!(!backup_old.exists());
    }

    #[test]
    fn test_recover_completed_clears_artifacts() {
        let live = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let config = test_config(live.path(), work.path());

        fs::write(live.path().join("app.db"), b"imported db").unwrap();
        fs::create_dir_all(config.staging_root()).unwrap();
        fs::create_dir_all(config.backup_old_root()).unwrap();
        fs::write(config.backup_old_root().join("app.db"), b"old db").unwrap();
        RestoreJournal::new(RestorePhase::Completed)
            .write(&config.journal_path())
            .unwrap();

        RecoveryRunner::new(&config).recover().unwrap();

        assert_eq!(
            fs::read(live.path().join("app.db")).unwrap(),
            b"imported db",
            "COMPLETED 后活动数据应保持导入后的内容"
        );
        assert!(!config.staging_root().exists());
        assert!(!config.backup_old_root().exists());
        assert!(!config.journal_path().exists());
    }

    #[test]
    fn test_recover_rollback_attempted_does_not_retry() {
        let live = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let config = test_config(live.path(), work.path());

        // 活动位置是上次回滚产出的状态；backup_old 中留有内容
        fs::write(live.path().join("app.db"), b"after rollback").unwrap();
        fs::create_dir_all(config.backup_old_root()).unwrap();
        fs::write(config.backup_old_root().join("app.db"), b"stale backup").unwrap();

        let mut journal = RestoreJournal::new(RestorePhase::RollbackAttempted);
        journal.backup_paths.insert(
            "database".to_string(),
            config.backup_old_root().join("app.db"),
        );
        journal.write(&config.journal_path()).unwrap();

        RecoveryRunner::new(&config).recover().unwrap();

        assert_eq!(
            fs::read(live.path().join("app.db")).unwrap(),
            b"after rollback",
            "ROLLBACK_ATTEMPTED 不得再次回滚"
        );
        assert!(!config.backup_old_root().exists(), "簿记应被清理");
        assert!(!config.journal_path().exists());
    }

    #[test]
    fn test_recover_is_idempotent() {
        let live = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let config = test_config(live.path(), work.path());

        RestoreJournal::new(RestorePhase::Completed)
            .write(&config.journal_path())
            .unwrap();

        let runner = RecoveryRunner::new(&config);
        runner.recover().unwrap();
        runner.recover().unwrap();
        runner.recover().unwrap();
    }
}
