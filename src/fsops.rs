//! 文件系统操作工具
//!
//! - 符号链接检测: 防止目录遍历攻击
//! - 带重试的删除/复制: 应对 Windows 上短暂的文件占用
//! - 跨文件系统安全的移动: 优先 rename，失败时回退为复制后删除

use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// 重试次数
pub const RESILIENT_RETRY_COUNT: u32 = 5;

/// 重试延迟(毫秒)
pub const RESILIENT_RETRY_DELAY_MS: u64 = 150;

/// 记录并跳过迭代中的错误，避免 `.flatten()` 静默丢弃
pub fn log_and_skip_entry_err<T, E: std::fmt::Display>(
    result: std::result::Result<T, E>,
) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("[FsOps] 目录项读取失败（已跳过）: {}", e);
            None
        }
    }
}

/// 检查路径是否为符号链接
///
/// 使用 symlink_metadata 而非 metadata，避免跟随符号链接。
/// 权限不足无法读取元数据时返回 `true`（视为符号链接），安全优先。
pub fn is_symlink(path: &Path) -> bool {
    match fs::symlink_metadata(path) {
        Ok(meta) => meta.file_type().is_symlink(),
        Err(e) => {
            warn!(
                "[FsOps] 无法读取路径元数据 {:?}: {}。安全优先：视为符号链接并跳过。",
                path, e
            );
            true
        }
    }
}

/// 带重试的文件删除，先清除只读属性
pub fn resilient_remove_file(path: &Path) -> std::io::Result<()> {
    let mut last_err: Option<std::io::Error> = None;
    for _ in 0..RESILIENT_RETRY_COUNT {
        if let Ok(md) = fs::metadata(path) {
            let mut perms = md.permissions();
            if perms.readonly() {
                perms.set_readonly(false);
                let _ = fs::set_permissions(path, perms);
            }
        }
        match fs::remove_file(path) {
            Ok(_) => return Ok(()),
            Err(e) => {
                last_err = Some(e);
                std::thread::sleep(Duration::from_millis(RESILIENT_RETRY_DELAY_MS));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "unknown error")))
}

/// 带重试的目录递归删除，先递归清除只读属性
pub fn resilient_remove_dir_all(path: &Path) -> std::io::Result<()> {
    let mut last_err: Option<std::io::Error> = None;
    for _ in 0..RESILIENT_RETRY_COUNT {
        if path.exists() {
            for entry in WalkDir::new(path)
                .into_iter()
                .filter_map(log_and_skip_entry_err)
            {
                let p = entry.path();
                if p.is_file() {
                    if let Ok(md) = fs::metadata(p) {
                        if md.permissions().readonly() {
                            let mut perms = md.permissions();
                            perms.set_readonly(false);
                            let _ = fs::set_permissions(p, perms);
                        }
                    }
                }
            }
        }
        match fs::remove_dir_all(path) {
            Ok(_) => return Ok(()),
            Err(e) => {
                last_err = Some(e);
                std::thread::sleep(Duration::from_millis(RESILIENT_RETRY_DELAY_MS + 50));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "unknown error")))
}

/// 删除路径（文件或目录），不存在时视为成功
pub fn remove_path_if_exists(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if path.is_dir() {
        resilient_remove_dir_all(path)
    } else {
        resilient_remove_file(path)
    }
}

/// 带重试的文件复制
pub fn resilient_copy_file(src: &Path, dst: &Path) -> std::io::Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut last_err: Option<std::io::Error> = None;
    for _ in 0..RESILIENT_RETRY_COUNT {
        match fs::copy(src, dst) {
            Ok(n) => return Ok(n),
            Err(e) => {
                last_err = Some(e);
                std::thread::sleep(Duration::from_millis(RESILIENT_RETRY_DELAY_MS));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "unknown error")))
}

/// 递归复制目录内容到目标目录，跳过符号链接
pub fn copy_dir_contents(src_dir: &Path, dst_dir: &Path) -> std::io::Result<u64> {
    fs::create_dir_all(dst_dir)?;
    let mut total_bytes = 0u64;

    for entry in fs::read_dir(src_dir)?.filter_map(log_and_skip_entry_err) {
        let src = entry.path();
        let dst = dst_dir.join(entry.file_name());

        // 安全检查: 跳过符号链接防止目录遍历攻击
        if is_symlink(&src) {
            warn!("[FsOps] 跳过符号链接: {:?}", src);
            continue;
        }

        if src.is_file() {
            total_bytes += resilient_copy_file(&src, &dst)?;
        } else if src.is_dir() {
            total_bytes += copy_dir_contents(&src, &dst)?;
        }
    }
    Ok(total_bytes)
}

/// 移动文件或目录
///
/// 优先使用原子 rename；跨文件系统时回退为复制后删除。
pub fn move_path(src: &Path, dst: &Path) -> std::io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    match fs::rename(src, dst) {
        Ok(_) => {
            debug!("[FsOps] rename 成功: {:?} -> {:?}", src, dst);
            Ok(())
        }
        Err(rename_err) => {
            // 跨文件系统时 rename 失败，回退为复制后删除
            debug!(
                "[FsOps] rename 失败 ({})，回退为复制后删除: {:?} -> {:?}",
                rename_err, src, dst
            );
            if src.is_dir() {
                copy_dir_contents(src, dst)?;
                resilient_remove_dir_all(src)
            } else {
                resilient_copy_file(src, dst)?;
                resilient_remove_file(src)
            }
        }
    }
}
