//! 备份引擎门面
//!
//! 对外的唯一入口：导出、导入、启动恢复。内部用一把互斥锁把三类操作
//! 串行化，同一引擎上不允许并发的备份/恢复（并发会破坏交换协议的
//! 日志假设）。

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

use crate::config::EngineConfig;
use crate::database::DatabaseHandle;
use crate::errors::BackupError;
use crate::export::ArchiveWriter;
use crate::recovery::RecoveryRunner;
use crate::swap::SwapCoordinator;

type Result<T> = std::result::Result<T, BackupError>;

pub struct BackupEngine {
    config: EngineConfig,
    // 全局操作锁：导出/导入/恢复互斥
    op_lock: Mutex<()>,
}

impl BackupEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            op_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 导出完整快照归档，返回归档路径
    pub fn export_backup(&self, db: &dyn DatabaseHandle) -> Result<PathBuf> {
        let _guard = self.lock_ops();
        info!("[Engine] 开始导出备份");
        let path = ArchiveWriter::new(&self.config).export(db)?;
        info!("[Engine] 导出完成: {:?}", path);
        Ok(path)
    }

    /// 从归档导入完整快照，替换全部活动数据
    pub fn import_backup(&self, db: &dyn DatabaseHandle, archive: &Path) -> Result<()> {
        let _guard = self.lock_ops();
        info!("[Engine] 开始导入备份: {:?}", archive);
        SwapCoordinator::new(&self.config).import_backup(db, archive)?;
        info!("[Engine] 导入完成");
        Ok(())
    }

    /// 启动时收尾上一次被打断的恢复；必须先于所有其他存储访问调用
    pub fn recover_interrupted_restore(&self) -> Result<()> {
        let _guard = self.lock_ops();
        RecoveryRunner::new(&self.config).recover()
    }

    fn lock_ops(&self) -> std::sync::MutexGuard<'_, ()> {
        // 持锁方没有可观察的中间状态，锁中毒时继续即可
        self.op_lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::BuildVariant;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_recover_on_clean_state_is_noop() {
        let live = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        fs::write(live.path().join("app.db"), b"db").unwrap();
        let engine = BackupEngine::new(EngineConfig::new(
            "com.example.notebook",
            BuildVariant::Debug,
            "1.0.0",
            1,
            live.path(),
            work.path(),
        ));

        engine.recover_interrupted_restore().unwrap();
        assert_eq!(fs::read(live.path().join("app.db")).unwrap(), b"db");
    }
}
