//! 导入的破坏性阶段：日志化的交换
//!
//! 顺序严格为：解压校验（纯读取）→ 写日志 EXTRACTING → 静默数据库 →
//! 活动数据移入 backup_old → 写日志 SWAPPING → 暂存数据移入活动位置 →
//! 写日志 COMPLETED → 清理 → 重新打开数据库。
//!
//! 静默之后的任何失败都会触发尽力而为的回滚（把 backupPaths 中的路径移回
//! 活动位置），随后写入 ROLLBACK_ATTEMPTED。调用方拿到的永远是最初的失败
//! 原因；回滚自身的失败只记录日志，由下一次启动恢复收尾。

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::database::{DatabaseHandle, QuiesceGuard};
use crate::errors::BackupError;
use crate::fsops::{move_path, remove_path_if_exists, resilient_remove_dir_all};
use crate::journal::{RestoreJournal, RestorePhase};
use crate::reader::{ArchiveReader, ExtractedBackup};
use crate::storage::StorageUnit;

type Result<T> = std::result::Result<T, BackupError>;

pub struct SwapCoordinator<'a> {
    config: &'a EngineConfig,
}

impl<'a> SwapCoordinator<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// 从归档恢复活动存储
    pub fn import_backup(&self, db: &dyn DatabaseHandle, archive: &Path) -> Result<()> {
        // 阶段一：纯读取。失败时系统与调用前完全一致。
        let reader = ArchiveReader::new(self.config);
        let extracted = reader.extract(archive)?;
        if let Err(err) = reader.validate(&extracted) {
            let _ = resilient_remove_dir_all(&extracted.staging_root);
            return Err(err);
        }

        let journal_path = self.config.journal_path();
        let staged_paths = self.collect_staged_paths(&extracted);

        // 日志必须先于任何破坏性动作落盘
        let mut journal = RestoreJournal::new(RestorePhase::Extracting);
        journal.staged_paths = staged_paths.clone();
        journal.write(&journal_path)?;

        // 阶段二：静默数据库。失败即终止——热文件不能被替换。
        let guard = match QuiesceGuard::quiesce(db) {
            Ok(g) => g,
            Err(err) => {
                self.record_rollback_attempted(&staged_paths, &HashMap::new());
                return Err(err);
            }
        };

        let mut backup_paths: HashMap<String, PathBuf> = HashMap::new();
        let swap_result = self.do_swap(&staged_paths, &mut backup_paths, &journal_path);

        match swap_result {
            Ok(()) => {
                // 成功路径显式重开以传播错误
                guard.reopen()?;
                info!("[Swap] 导入完成，活动数据已替换");
                Ok(())
            }
            Err(err) => {
                error!("[Swap] 交换失败，触发回滚: {}", err);
                if let Err(rollback_err) = rollback_from_backup(&self.config.live_root, &backup_paths)
                {
                    // 回滚失败只记录，不覆盖根因
                    error!(
                        "[Swap] 回滚失败: {}。旧数据保存在 {:?}，可手动恢复",
                        rollback_err,
                        self.config.backup_old_root()
                    );
                }
                self.record_rollback_attempted(&staged_paths, &backup_paths);
                // guard Drop 重新打开数据库
                drop(guard);
                Err(err)
            }
        }
    }

    /// 步骤 4-8：移动活动数据、写日志、移入暂存数据、清理
    fn do_swap(
        &self,
        staged_paths: &HashMap<String, PathBuf>,
        backup_paths: &mut HashMap<String, PathBuf>,
        journal_path: &Path,
    ) -> Result<()> {
        let live_root = &self.config.live_root;
        let backup_old = self.config.backup_old_root();

        // 全新的 backup_old 根
        remove_path_if_exists(&backup_old)
            .map_err(|e| BackupError::file_system(format!("清理 backup_old 失败: {}", e)))?;
        fs::create_dir_all(&backup_old)
            .map_err(|e| BackupError::file_system(format!("创建 backup_old 失败: {}", e)))?;

        // 活动数据整体移入 backup_old（原子 rename，跨文件系统时复制后删除）
        for unit in StorageUnit::ALL {
            let live = unit.live_path(live_root);
            if !live.exists() {
                continue;
            }
            let dst = unit.live_path(&backup_old);
            if *unit == StorageUnit::Database {
                move_sqlite_family(&live, &dst)?;
            } else {
                move_path(&live, &dst).map_err(|e| {
                    BackupError::file_system(format!("移动 {:?} 到备份位置失败: {}", live, e))
                })?;
            }
            backup_paths.insert(unit.key().to_string(), dst);
        }
        info!("[Swap] 活动数据已移入 backup_old ({} 个单元)", backup_paths.len());

        // SWAPPING 落盘后才开始覆盖活动位置
        let mut journal = RestoreJournal::new(RestorePhase::Swapping);
        journal.staged_paths = staged_paths.clone();
        journal.backup_paths = backup_paths.clone();
        journal.write(journal_path)?;

        // 暂存数据移入活动位置
        fs::create_dir_all(live_root)
            .map_err(|e| BackupError::file_system(format!("创建活动根目录失败: {}", e)))?;
        for (key, staged) in staged_paths {
            let unit = StorageUnit::from_key(key).ok_or_else(|| {
                BackupError::file_system(format!("日志中出现未知存储单元键: {}", key))
            })?;
            let live = unit.live_path(live_root);
            move_path(staged, &live).map_err(|e| {
                BackupError::file_system(format!("移动暂存数据 {:?} 到活动位置失败: {}", staged, e))
            })?;
        }
        info!("[Swap] 暂存数据已移入活动位置 ({} 个单元)", staged_paths.len());

        let mut journal = RestoreJournal::new(RestorePhase::Completed);
        journal.staged_paths = staged_paths.clone();
        journal.backup_paths = backup_paths.clone();
        journal.write(journal_path)?;

        // 清理：backup_old、暂存目录、日志
        let mut cleanup_ok = true;
        if let Err(e) = resilient_remove_dir_all(&backup_old) {
            warn!("[Swap] 清理 backup_old 失败: {}", e);
            cleanup_ok = false;
        }
        if let Err(e) = resilient_remove_dir_all(&self.config.staging_root()) {
            warn!("[Swap] 清理暂存目录失败: {}", e);
            cleanup_ok = false;
        }
        // 清理未完成时保留 COMPLETED 日志，下次启动恢复接手收尾
        if cleanup_ok {
            RestoreJournal::delete(journal_path)?;
        } else {
            warn!("[Swap] 清理未完成，保留 COMPLETED 日志，由下次启动恢复收尾");
        }

        Ok(())
    }

    fn collect_staged_paths(&self, extracted: &ExtractedBackup) -> HashMap<String, PathBuf> {
        let mut staged = HashMap::new();
        for unit in StorageUnit::ALL {
            if let Some(path) = extracted.staged_unit_path(*unit) {
                staged.insert(unit.key().to_string(), path);
            }
        }
        staged
    }

    /// 写入 ROLLBACK_ATTEMPTED；日志与残留目录由下一次启动恢复收尾
    fn record_rollback_attempted(
        &self,
        staged_paths: &HashMap<String, PathBuf>,
        backup_paths: &HashMap<String, PathBuf>,
    ) {
        let mut journal = RestoreJournal::new(RestorePhase::RollbackAttempted);
        journal.staged_paths = staged_paths.clone();
        journal.backup_paths = backup_paths.clone();
        if let Err(e) = journal.write(&self.config.journal_path()) {
            error!("[Swap] 写入 ROLLBACK_ATTEMPTED 日志失败: {}", e);
        }
    }
}

/// 把 backupPaths 中的路径移回活动位置（尽力而为）
///
/// backupPaths 中缺失的单元保持原样不动。供交换失败路径与启动恢复共用。
pub(crate) fn rollback_from_backup(
    live_root: &Path,
    backup_paths: &HashMap<String, PathBuf>,
) -> Result<()> {
    let mut first_err: Option<BackupError> = None;
    let mut restored = 0usize;

    for (key, backup) in backup_paths {
        let unit = match StorageUnit::from_key(key) {
            Some(u) => u,
            None => {
                warn!("[Rollback] 跳过未知存储单元键: {}", key);
                continue;
            }
        };
        if !backup.exists() {
            warn!("[Rollback] 备份位置不存在，跳过: {:?}", backup);
            continue;
        }

        let live = unit.live_path(live_root);
        // 先清掉交换中途留下的新数据残留
        if let Err(e) = remove_path_if_exists(&live) {
            warn!("[Rollback] 清理残留 {:?} 失败: {}", live, e);
        }

        let move_result = if unit == StorageUnit::Database {
            move_sqlite_family(backup, &live)
        } else {
            move_path(backup, &live)
                .map_err(|e| BackupError::file_system(format!("回滚 {:?} 失败: {}", backup, e)))
        };

        match move_result {
            Ok(()) => {
                restored += 1;
                info!("[Rollback] 已回滚: {} -> {:?}", key, live);
            }
            Err(e) => {
                error!("[Rollback] 回滚 {} 失败: {}", key, e);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }

    info!("[Rollback] 回滚完成: {} 个单元已恢复", restored);
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// 移动 SQLite 主库文件及其 -wal/-shm 辅助文件
///
/// 正常流程里静默（checkpoint + close）之后辅助文件已不存在；
/// 这里是对异常残留的防护，保证主库与 WAL 永远一起移动。
pub(crate) fn move_sqlite_family(src_db: &Path, dst_db: &Path) -> Result<()> {
    move_path(src_db, dst_db)
        .map_err(|e| BackupError::file_system(format!("移动数据库 {:?} 失败: {}", src_db, e)))?;

    for suffix in ["-wal", "-shm"] {
        let aux_src = aux_path(src_db, suffix);
        if aux_src.exists() {
            let aux_dst = aux_path(dst_db, suffix);
            warn!("[Swap] 检测到数据库辅助文件残留，随主库一起移动: {:?}", aux_src);
            move_path(&aux_src, &aux_dst).map_err(|e| {
                BackupError::file_system(format!("移动辅助文件 {:?} 失败: {}", aux_src, e))
            })?;
        }
    }
    Ok(())
}

fn aux_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    db_path.with_file_name(name)
}
