//! 备份引擎的结构化错误类型
//!
//! 调用方最终只会收到一个 `BackupError`：成功时数据完整地处于目标状态，
//! 失败时错误描述的永远是最初的失败原因（回滚自身的失败只记录日志，不覆盖根因）。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 清单校验失败的具体原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationFailure {
    /// applicationId 与当前应用不一致
    IdentityMismatch,
    /// schemaVersion 与当前支持版本不一致（要求精确匹配）
    UnsupportedSchema,
    /// 清单记录的校验和与解压后重新计算的不一致
    ChecksumMismatch,
    /// 清单引用的条目在解压结果中不存在
    MissingEntry,
    /// 清单缺少必备条目（数据库）
    MissingRequiredEntry,
}

/// 错误大类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupErrorKind {
    /// ZIP 流损坏或不可读
    ArchiveRead,
    /// 清单校验失败（细分原因见 `ValidationFailure`）
    ManifestValidation,
    /// 文件系统操作失败（移动/复制/删除、危险路径）
    FileSystem,
    /// 数据库 checkpoint 或关闭失败——整次导出/导入直接终止
    DatabaseQuiesce,
    /// 目标不存在（如备份文件路径无效）
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupError {
    pub kind: BackupErrorKind,
    /// 仅 `ManifestValidation` 类错误携带
    pub failure: Option<ValidationFailure>,
    pub message: String,
}

impl BackupError {
    pub fn new(kind: BackupErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            failure: None,
            message: message.into(),
        }
    }

    pub fn archive_read(message: impl Into<String>) -> Self {
        Self::new(BackupErrorKind::ArchiveRead, message)
    }

    pub fn file_system(message: impl Into<String>) -> Self {
        Self::new(BackupErrorKind::FileSystem, message)
    }

    pub fn quiesce(message: impl Into<String>) -> Self {
        Self::new(BackupErrorKind::DatabaseQuiesce, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(BackupErrorKind::NotFound, message)
    }

    pub fn validation(failure: ValidationFailure, message: impl Into<String>) -> Self {
        Self {
            kind: BackupErrorKind::ManifestValidation,
            failure: Some(failure),
            message: message.into(),
        }
    }

    /// 清单校验失败的细分原因；非校验类错误返回 None
    pub fn validation_failure(&self) -> Option<ValidationFailure> {
        self.failure
    }
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for BackupError {}

impl From<std::io::Error> for BackupError {
    fn from(err: std::io::Error) -> Self {
        BackupError::file_system(format!("文件系统错误: {}", err))
    }
}

impl From<zip::result::ZipError> for BackupError {
    fn from(err: zip::result::ZipError) -> Self {
        BackupError::archive_read(format!("ZIP操作错误: {}", err))
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        BackupError::archive_read(format!("JSON解析错误: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_carries_failure() {
        let err = BackupError::validation(ValidationFailure::IdentityMismatch, "身份不匹配");
        assert_eq!(err.kind, BackupErrorKind::ManifestValidation);
        assert_eq!(
            err.validation_failure(),
            Some(ValidationFailure::IdentityMismatch)
        );
    }

    #[test]
    fn test_plain_error_has_no_failure() {
        let err = BackupError::file_system("移动失败");
        assert_eq!(err.validation_failure(), None, "非校验错误不应携带细分原因");
    }

    #[test]
    fn test_io_error_maps_to_file_system() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: BackupError = io.into();
        assert_eq!(err.kind, BackupErrorKind::FileSystem);
    }
}
