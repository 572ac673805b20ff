//! appvault — 应用数据的完整快照备份与恢复引擎
//!
//! 导出：静默数据库 → 流式打包各存储单元（边写边算 SHA-256）→
//! 清单最后写入归档。
//! 导入：解压到暂存区 → 校验身份/版本/校验和 → 日志化交换
//! （EXTRACTING → SWAPPING → COMPLETED）。
//! 恢复：启动时读取恢复日志，按阶段收尾，保证任意时刻崩溃后
//! 活动数据要么是导入前快照、要么是归档内容，绝无混合状态。

pub mod checksum;
pub mod config;
pub mod database;
pub mod engine;
pub mod errors;
pub mod export;
pub mod fsops;
pub mod journal;
pub mod manifest;
pub mod reader;
pub mod recovery;
pub mod storage;
pub mod swap;

pub use config::EngineConfig;
pub use database::{DatabaseHandle, SqliteHandle};
pub use engine::BackupEngine;
pub use errors::{BackupError, BackupErrorKind, ValidationFailure};
pub use export::ArchiveWriter;
pub use journal::{RestoreJournal, RestorePhase};
pub use manifest::{BackupManifest, BuildVariant, MANIFEST_FILE};
pub use reader::{ArchiveReader, ExtractedBackup};
pub use recovery::RecoveryRunner;
pub use storage::StorageUnit;
pub use swap::SwapCoordinator;
