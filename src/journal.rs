//! 恢复日志（restore_journal.json）
//!
//! 单一文件，记录进行中恢复到达的阶段与涉及的路径。
//! 文件不存在即是"没有恢复在进行中"的标准信号；文件存在本身
//! 就意味着上一次恢复没有干净地结束。
//!
//! 每次写入都必须在它所描述的破坏性动作**开始之前**完整落盘
//! （临时文件 + fsync + rename + 父目录 fsync），这样崩溃永远不会留下
//! "声称到达了某阶段、对应动作却尚未开始"的日志。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::errors::BackupError;
type Result<T> = std::result::Result<T, BackupError>;

/// 恢复生命周期阶段
///
/// 状态机: NO_RESTORE(无日志) → EXTRACTING → SWAPPING → COMPLETED → NO_RESTORE；
/// EXTRACTING/SWAPPING 出错时 → ROLLBACK_ATTEMPTED → NO_RESTORE（下次恢复清理）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestorePhase {
    /// 已解压到暂存目录，活动数据尚未被触碰
    Extracting,
    /// 活动数据已移入 backup_old，正在将暂存数据移入活动位置
    Swapping,
    /// 活动数据已完整替换，仅剩清理工作
    Completed,
    /// 已尝试过一次回滚，不再重试（避免在两个不一致快照间摆动）
    RollbackAttempted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreJournal {
    pub phase: RestorePhase,
    /// RFC3339 写入时间戳
    pub timestamp: String,
    /// 存储单元键 -> 暂存目录内的位置
    #[serde(default)]
    pub staged_paths: HashMap<String, PathBuf>,
    /// 存储单元键 -> backup_old 目录内的位置
    #[serde(default)]
    pub backup_paths: HashMap<String, PathBuf>,
}

impl RestoreJournal {
    pub fn new(phase: RestorePhase) -> Self {
        Self {
            phase,
            timestamp: Utc::now().to_rfc3339(),
            staged_paths: HashMap::new(),
            backup_paths: HashMap::new(),
        }
    }

    /// 将日志完整持久化到 `path`
    ///
    /// 先写临时文件并 fsync，再 rename 替换，最后 fsync 父目录，
    /// 防止崩溃/断电留下半个日志文件。
    pub fn write(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| BackupError::file_system(format!("序列化恢复日志失败: {}", e)))?;

        let tmp = path.with_extension("json.tmp");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| BackupError::file_system(format!("创建日志目录失败: {}", e)))?;
        }

        {
            let mut file = fs::File::create(&tmp)
                .map_err(|e| BackupError::file_system(format!("创建日志临时文件失败: {}", e)))?;
            file.write_all(content.as_bytes())
                .map_err(|e| BackupError::file_system(format!("写入日志失败: {}", e)))?;
            file.sync_all()
                .map_err(|e| BackupError::file_system(format!("日志 fsync 失败: {}", e)))?;
        }

        fs::rename(&tmp, path)
            .map_err(|e| BackupError::file_system(format!("替换日志文件失败: {}", e)))?;

        // fsync 父目录，确保目录条目更新持久化
        #[cfg(unix)]
        {
            if let Some(parent) = path.parent() {
                if let Ok(dir) = fs::File::open(parent) {
                    let _ = dir.sync_all();
                }
            }
        }

        info!("[Journal] 已写入恢复日志 phase={:?}", self.phase);
        Ok(())
    }

    /// 读取日志；文件不存在返回 `None`（无恢复在进行中）
    pub fn read(path: &Path) -> Result<Option<RestoreJournal>> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BackupError::file_system(format!("读取恢复日志失败: {}", e)));
            }
        };

        let journal: RestoreJournal = serde_json::from_str(&content)
            .map_err(|e| BackupError::file_system(format!("恢复日志内容损坏: {}", e)))?;
        Ok(Some(journal))
    }

    /// 删除日志文件及可能残留的临时文件；不存在时视为成功
    pub fn delete(path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        if tmp.exists() {
            if let Err(e) = fs::remove_file(&tmp) {
                warn!("[Journal] 清理日志临时文件失败: {}", e);
            }
        }
        match fs::remove_file(path) {
            Ok(_) => {
                info!("[Journal] 恢复日志已删除");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackupError::file_system(format!("删除恢复日志失败: {}", e))),
        }
    }
}
