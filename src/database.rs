//! 数据库句柄
//!
//! 备份引擎不直接持有任何全局数据库状态；宿主应用传入一个实现了
//! [`DatabaseHandle`] 的句柄对象。引擎只在两个时刻使用它：
//! 复制/替换数据库文件前静默（checkpoint + close，使磁盘文件自洽），
//! 以及每条退出路径上重新打开（成功、校验失败、交换失败、回滚后都一样）。

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::errors::BackupError;

/// 活动数据库的显式句柄
///
/// 方法都取 `&self`：实现方负责内部可变性，句柄通常以 `Arc` 共享。
pub trait DatabaseHandle: Send + Sync {
    /// 重新打开底层连接
    fn open(&self) -> Result<()>;

    /// 将 WAL 合并进主库，使磁盘文件自洽
    fn checkpoint(&self) -> Result<()>;

    /// 完全关闭底层连接，释放对磁盘文件的占用
    fn close(&self) -> Result<()>;
}

/// 基于 rusqlite 的默认实现
pub struct SqliteHandle {
    conn: Mutex<Option<Connection>>,
    db_path: PathBuf,
}

impl SqliteHandle {
    /// 打开（或创建）数据库文件并返回句柄
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("创建数据库目录失败: {:?}", parent))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("打开数据库连接失败: {:?}", db_path))?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// 在当前连接上执行 SQL（主要供测试写入样例数据）
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let guard = self.conn.lock().unwrap();
        let conn = guard.as_ref().context("数据库连接已关闭")?;
        conn.execute_batch(sql).context("执行 SQL 失败")?;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().unwrap().is_some()
    }
}

impl DatabaseHandle for SqliteHandle {
    fn open(&self) -> Result<()> {
        let mut guard = self.conn.lock().unwrap();
        if guard.is_some() {
            // 已打开则视为成功，保证恢复路径幂等
            return Ok(());
        }
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("重新打开数据库失败: {:?}", self.db_path))?;
        *guard = Some(conn);
        Ok(())
    }

    fn checkpoint(&self) -> Result<()> {
        let guard = self.conn.lock().unwrap();
        let conn = guard.as_ref().context("数据库连接已关闭，无法 checkpoint")?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            .context("PRAGMA wal_checkpoint 失败")?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().unwrap();
        match guard.take() {
            Some(conn) => conn.close().map_err(|(conn, e)| {
                // 关闭失败时放回连接，句柄保持可用
                *guard = Some(conn);
                anyhow::anyhow!("关闭数据库连接失败: {}", e)
            }),
            None => Ok(()),
        }
    }
}

/// 数据库静默守卫
///
/// 构造时执行 checkpoint + close；Drop 时无条件重新打开。
/// 任何触碰数据库文件的移动操作都必须在此守卫的生命周期内进行。
pub struct QuiesceGuard<'a> {
    handle: &'a dyn DatabaseHandle,
    reopened: bool,
}

impl<'a> QuiesceGuard<'a> {
    /// 静默数据库（checkpoint + close）
    ///
    /// 失败即为 `DatabaseQuiesce` 错误：热的数据库文件既不能安全复制也不能安全替换。
    pub fn quiesce(handle: &'a dyn DatabaseHandle) -> Result<Self, BackupError> {
        handle
            .checkpoint()
            .map_err(|e| BackupError::quiesce(format!("数据库 checkpoint 失败: {}", e)))?;
        handle
            .close()
            .map_err(|e| BackupError::quiesce(format!("关闭数据库失败: {}", e)))?;

        info!("[QuiesceGuard] 数据库已静默 (checkpoint + close)");
        Ok(Self {
            handle,
            reopened: false,
        })
    }

    /// 手动重新打开并传播错误；之后 Drop 不再重复打开
    pub fn reopen(mut self) -> Result<(), BackupError> {
        self.reopened = true;
        self.handle
            .open()
            .map_err(|e| BackupError::quiesce(format!("重新打开数据库失败: {}", e)))?;
        info!("[QuiesceGuard] 数据库已重新打开");
        Ok(())
    }
}

impl Drop for QuiesceGuard<'_> {
    fn drop(&mut self) {
        if self.reopened {
            return;
        }
        // Drop 中无法传播错误，只能记录；活动系统必须尽力保持可用
        match self.handle.open() {
            Ok(()) => info!("[QuiesceGuard] Drop 时数据库已重新打开"),
            Err(e) => {
                error!("[QuiesceGuard] Drop 时重新打开数据库失败: {}", e);
                warn!("[QuiesceGuard] 数据库句柄可能不可用，建议重启应用");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_handle(dir: &TempDir) -> SqliteHandle {
        let handle = SqliteHandle::new(&dir.path().join("app.db")).unwrap();
        handle
            .execute_batch("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT);")
            .unwrap();
        handle
    }

    #[test]
    fn test_quiesce_closes_and_drop_reopens() {
        let dir = TempDir::new().unwrap();
        let handle = new_handle(&dir);

        {
            let _guard = QuiesceGuard::quiesce(&handle).unwrap();
            assert!(!handle.is_open(), "静默期间连接应已关闭");
        }
        assert!(handle.is_open(), "守卫 Drop 后连接应已重新打开");
    }

    #[test]
    fn test_explicit_reopen() {
        let dir = TempDir::new().unwrap();
        let handle = new_handle(&dir);

        let guard = QuiesceGuard::quiesce(&handle).unwrap();
        guard.reopen().unwrap();
        assert!(handle.is_open());

        // 重新打开后仍可写入
        handle
            .execute_batch("INSERT INTO notes (body) VALUES ('after reopen');")
            .unwrap();
    }

    #[test]
    fn test_open_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let handle = new_handle(&dir);
        handle.open().unwrap();
        handle.open().unwrap();
        assert!(handle.is_open());
    }

    #[test]
    fn test_checkpoint_on_closed_handle_fails() {
        let dir = TempDir::new().unwrap();
        let handle = new_handle(&dir);
        handle.close().unwrap();
        assert!(handle.checkpoint().is_err(), "已关闭的句柄 checkpoint 应失败");
        handle.open().unwrap();
    }
}
