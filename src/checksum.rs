//! 校验和计算与归档预检
//!
//! - SHA256 流式计算: 导出与导入共用，文件大小无关（含零长度文件）
//! - ZIP 预检: 解压前检测 ZIP 炸弹特征（总大小、单文件大小、压缩比、条目数）

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::errors::BackupError;
type Result<T> = std::result::Result<T, BackupError>;

// ============================================================================
// 安全常量 - 防止 ZIP 炸弹和资源耗尽攻击
// ============================================================================

/// 最大允许解压总大小: 10GB
pub const MAX_UNCOMPRESSED_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// 最大允许单文件大小: 2GB
pub const MAX_SINGLE_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// 压缩比警告阈值（解压后大小 / 压缩大小）
pub const MAX_COMPRESSION_RATIO: u64 = 100;

/// 极端压缩比阈值 — 超过此值视为 ZIP 炸弹并拒绝解压
pub const EXTREME_COMPRESSION_RATIO: u64 = 1000;

/// 最大允许条目数量
pub const MAX_FILE_COUNT: usize = 500_000;

/// 计算文件的SHA256哈希值
///
/// 使用8KB缓冲区分块读取，适合处理大文件而不会占用过多内存。
/// 返回小写十六进制摘要；空文件返回空内容的标准摘要。
pub fn compute_file_digest(path: &Path) -> Result<String> {
    let file = File::open(path)
        .map_err(|e| BackupError::file_system(format!("打开文件计算哈希失败 {:?}: {}", path, e)))?;

    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| BackupError::file_system(format!("读取文件失败 {:?}: {}", path, e)))?;

        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// 计算字节数组的SHA256哈希值
pub fn compute_bytes_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// ZIP 炸弹检测
// ============================================================================

/// ZIP 安全预检结果
#[derive(Debug)]
pub struct ZipSecurityCheck {
    pub total_uncompressed_size: u64,
    pub total_compressed_size: u64,
    pub file_count: usize,
    pub compression_ratio: f64,
    pub largest_file_size: u64,
    pub largest_file_name: String,
}

impl ZipSecurityCheck {
    /// 验证归档是否安全可解压
    pub fn validate(&self) -> Result<()> {
        if self.total_uncompressed_size > MAX_UNCOMPRESSED_SIZE {
            return Err(BackupError::archive_read(format!(
                "ZIP 解压后大小 ({:.2} GB) 超过最大限制 ({:.2} GB)，可能是 ZIP 炸弹",
                self.total_uncompressed_size as f64 / 1024.0 / 1024.0 / 1024.0,
                MAX_UNCOMPRESSED_SIZE as f64 / 1024.0 / 1024.0 / 1024.0
            )));
        }

        if self.largest_file_size > MAX_SINGLE_FILE_SIZE {
            return Err(BackupError::archive_read(format!(
                "ZIP 中条目 '{}' 大小 ({:.2} GB) 超过单文件限制 ({:.2} GB)",
                self.largest_file_name,
                self.largest_file_size as f64 / 1024.0 / 1024.0 / 1024.0,
                MAX_SINGLE_FILE_SIZE as f64 / 1024.0 / 1024.0 / 1024.0
            )));
        }

        // 正常备份压缩比通常在 2-20 之间；较高但不极端时仅告警
        if self.compression_ratio > EXTREME_COMPRESSION_RATIO as f64 {
            return Err(BackupError::archive_read(format!(
                "ZIP 炸弹检测：压缩比 {:.1} 超过极限阈值 {}",
                self.compression_ratio, EXTREME_COMPRESSION_RATIO
            )));
        } else if self.compression_ratio > MAX_COMPRESSION_RATIO as f64 {
            tracing::warn!(
                "[Checksum] ZIP 压缩比较高 ({:.1} > {})，可能是重复数据，也可能是潜在威胁",
                self.compression_ratio,
                MAX_COMPRESSION_RATIO
            );
        }

        if self.file_count > MAX_FILE_COUNT {
            return Err(BackupError::archive_read(format!(
                "ZIP 包含 {} 个条目，超过最大限制 {}",
                self.file_count, MAX_FILE_COUNT
            )));
        }

        Ok(())
    }
}

/// 对归档文件进行安全预检（只读中央目录，不解压）
pub fn check_zip_security(zip_path: &Path) -> Result<ZipSecurityCheck> {
    let file = File::open(zip_path)
        .map_err(|e| BackupError::archive_read(format!("打开备份文件失败: {}", e)))?;

    let compressed_size = file.metadata().map(|m| m.len()).unwrap_or(0);

    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| BackupError::archive_read(format!("解析 ZIP 文件失败: {}", e)))?;

    let file_count = archive.len();
    let mut total_uncompressed = 0u64;
    let mut largest_size = 0u64;
    let mut largest_name = String::new();

    for i in 0..file_count {
        let entry = archive
            .by_index(i)
            .map_err(|e| BackupError::archive_read(format!("读取 ZIP 条目失败: {}", e)))?;

        let size = entry.size();
        // 头部声明的大小不可信，饱和相加防止恶意归档触发溢出
        total_uncompressed = total_uncompressed.saturating_add(size);

        if size > largest_size {
            largest_size = size;
            largest_name = entry.name().to_string();
        }
    }

    let compression_ratio = if compressed_size > 0 {
        total_uncompressed as f64 / compressed_size as f64
    } else {
        0.0
    };

    Ok(ZipSecurityCheck {
        total_uncompressed_size: total_uncompressed,
        total_compressed_size: compressed_size,
        file_count,
        compression_ratio,
        largest_file_size: largest_size,
        largest_file_name: largest_name,
    })
}
