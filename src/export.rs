//! 导出：把活动存储打包为可携带归档
//!
//! 导出只读取活动数据，绝不修改它。流程：
//! 1. 静默活动数据库（checkpoint + close），使磁盘文件自洽可复制
//! 2. 将每个存储单元流式写入 ZIP，边写边计算 SHA256
//! 3. **最后**写入清单——清单完整即归档完整
//! 4. 无论成败都重新打开数据库句柄；失败时删除写了一半的归档文件

use chrono::Utc;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;
use zip::write::FileOptions;

use crate::config::{ensure_dir, EngineConfig};
use crate::database::{DatabaseHandle, QuiesceGuard};
use crate::errors::BackupError;
use crate::fsops::{is_symlink, log_and_skip_entry_err, resilient_remove_file};
use crate::manifest::{BackupManifest, MANIFEST_FILE};
use crate::storage::StorageUnit;

type Result<T> = std::result::Result<T, BackupError>;

/// 流式写入的缓冲区大小
const CHUNK_SIZE: usize = 64 * 1024;

pub struct ArchiveWriter<'a> {
    config: &'a EngineConfig,
}

impl<'a> ArchiveWriter<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// 导出全量备份，返回归档位置
    ///
    /// 导出期间要求对活动存储的独占访问，由调用方（引擎级互斥）保证。
    pub fn export(&self, db: &dyn DatabaseHandle) -> Result<PathBuf> {
        let exports_dir = ensure_dir(&self.config.exports_dir())
            .map_err(|e| BackupError::file_system(format!("创建导出目录失败: {}", e)))?;
        let target_zip =
            exports_dir.join(format!("backup_{}.zip", Utc::now().format("%Y%m%d_%H%M%S")));

        info!("[Export] 开始导出备份: {:?}", target_zip);

        let guard = QuiesceGuard::quiesce(db)?;

        let result = self.build_archive(&target_zip);

        if result.is_err() {
            // 失败时不留下半成品归档
            if target_zip.exists() {
                if let Err(e) = resilient_remove_file(&target_zip) {
                    warn!("[Export] 清理失败的归档文件失败 {:?}: {}", target_zip, e);
                }
            }
        }

        // 活动系统必须在返回前恢复可用
        let reopen_result = guard.reopen();

        result?;
        reopen_result?;

        info!("[Export] 导出完成: {:?}", target_zip);
        Ok(target_zip)
    }

    fn build_archive(&self, target_zip: &Path) -> Result<()> {
        let file = File::create(target_zip)
            .map_err(|e| BackupError::file_system(format!("创建备份文件失败: {}", e)))?;
        let mut zip = zip::ZipWriter::new(file);
        let file_options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        let dir_options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);

        let mut manifest = BackupManifest::new(self.config);

        for unit in StorageUnit::ALL {
            let live_path = unit.live_path(&self.config.live_root);

            if !live_path.exists() {
                if unit.is_required() {
                    return Err(BackupError::not_found(format!(
                        "必备存储单元缺失: {:?}",
                        live_path
                    )));
                }
                info!("[Export] 跳过不存在的存储单元: {}", unit.key());
                continue;
            }

            if unit.is_directory() {
                zip.add_directory(unit.archive_name().trim_end_matches('/'), dir_options.clone())
                    .map_err(|e| {
                        BackupError::file_system(format!(
                            "写入 Zip 目录失败 {}: {}",
                            unit.archive_name(),
                            e
                        ))
                    })?;
                self.write_directory_unit(&mut zip, &file_options, *unit, &live_path, &mut manifest)?;
            } else {
                let digest =
                    write_entry(&mut zip, &file_options, unit.archive_name(), &live_path)?;
                manifest.add_checksum(unit.archive_name(), digest);
            }
        }

        // 最后写入清单（包含完整的 fileChecksums）
        info!(
            "[Export] 写入备份清单: {} ({} 个校验和)",
            MANIFEST_FILE,
            manifest.file_checksums.len()
        );
        zip.start_file(MANIFEST_FILE, file_options)
            .map_err(|e| BackupError::file_system(format!("写入清单条目失败: {}", e)))?;
        let manifest_json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| BackupError::file_system(format!("序列化清单失败: {}", e)))?;
        zip.write_all(manifest_json.as_bytes())
            .map_err(|e| BackupError::file_system(format!("写入清单内容失败: {}", e)))?;

        zip.finish()
            .map_err(|e| BackupError::file_system(format!("完成 Zip 写入失败: {}", e)))?;
        Ok(())
    }

    /// 将目录单元下的所有文件写入归档，保留相对路径
    fn write_directory_unit(
        &self,
        zip: &mut zip::ZipWriter<File>,
        file_options: &FileOptions,
        unit: StorageUnit,
        live_path: &Path,
        manifest: &mut BackupManifest,
    ) -> Result<()> {
        for entry in WalkDir::new(live_path)
            .into_iter()
            .filter_map(log_and_skip_entry_err)
        {
            let path = entry.path();

            // 安全检查: 跳过符号链接
            if is_symlink(path) {
                warn!("[Export] 跳过符号链接: {:?}", path);
                continue;
            }
            if !path.is_file() {
                continue;
            }

            let rel = path
                .strip_prefix(live_path)
                .map_err(|e| BackupError::file_system(format!("计算相对路径失败: {}", e)))?;
            let entry_name = format!(
                "{}{}",
                unit.archive_name(),
                normalize_rel_path(rel)
            );

            let digest = write_entry(zip, file_options, &entry_name, path)?;
            manifest.add_checksum(entry_name, digest);
        }
        Ok(())
    }
}

/// 统一使用 `/` 作为归档内路径分隔符
fn normalize_rel_path(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// 写入单个文件条目并计算哈希（流式处理，避免大文件 OOM）
///
/// 返回条目内容的 SHA256 摘要。
fn write_entry(
    zip: &mut zip::ZipWriter<File>,
    file_options: &FileOptions,
    entry_name: &str,
    abs_path: &Path,
) -> Result<String> {
    use sha2::{Digest, Sha256};

    let file = File::open(abs_path)
        .map_err(|e| BackupError::file_system(format!("打开文件失败 {:?}: {}", abs_path, e)))?;
    let mut reader = BufReader::with_capacity(CHUNK_SIZE, file);
    let mut hasher = Sha256::new();

    zip.start_file(entry_name, file_options.clone())
        .map_err(|e| BackupError::file_system(format!("写入 Zip 条目失败 {}: {}", entry_name, e)))?;

    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| BackupError::file_system(format!("读取文件失败 {:?}: {}", abs_path, e)))?;

        if bytes_read == 0 {
            break;
        }

        let chunk = &buffer[..bytes_read];
        hasher.update(chunk);
        zip.write_all(chunk).map_err(|e| {
            BackupError::file_system(format!("写入 Zip 内容失败 {}: {}", entry_name, e))
        })?;
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum;
    use crate::database::SqliteHandle;
    use std::fs;
    use crate::manifest::BuildVariant;
    use std::io::Read as _;
    use tempfile::TempDir;

    fn test_config(live: &Path, work: &Path) -> EngineConfig {
        EngineConfig::new(
            "com.example.notebook",
            BuildVariant::Debug,
            "1.0.0",
            1,
            live,
            work,
        )
    }

    fn seed_live(live: &Path) -> SqliteHandle {
        let handle = SqliteHandle::new(&live.join("app.db")).unwrap();
        handle
            .execute_batch(
                "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT);
                 INSERT INTO notes (body) VALUES ('第一条');",
            )
            .unwrap();
        fs::write(live.join("settings.json"), b"{\"theme\":\"dark\"}").unwrap();
        fs::create_dir_all(live.join("images/2026")).unwrap();
        fs::write(live.join("images/2026/a.png"), b"png-bytes").unwrap();
        handle
    }

    #[test]
    fn test_export_writes_manifest_last() {
        let live = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let config = test_config(live.path(), work.path());
        let handle = seed_live(live.path());

        let archive = ArchiveWriter::new(&config).export(&handle).unwrap();
        assert!(archive.exists());
        assert!(handle.is_open(), "导出结束后数据库应已重新打开");

        let file = File::open(&archive).unwrap();
        let mut zip = zip::ZipArchive::new(file).unwrap();

        // 清单必须是最后一个条目
        let last_index = zip.len() - 1;
        let last_name = zip.by_index(last_index).unwrap().name().to_string();
        assert_eq!(last_name, MANIFEST_FILE, "清单应是归档的最后一个条目");
    }

    #[test]
    fn test_export_manifest_checksums_match_content() {
        let live = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let config = test_config(live.path(), work.path());
        let handle = seed_live(live.path());

        let archive = ArchiveWriter::new(&config).export(&handle).unwrap();

        let file = File::open(&archive).unwrap();
        let mut zip = zip::ZipArchive::new(file).unwrap();
        let manifest: BackupManifest = {
            let mut entry = zip.by_name(MANIFEST_FILE).unwrap();
            let mut content = String::new();
            entry.read_to_string(&mut content).unwrap();
            serde_json::from_str(&content).unwrap()
        };

        assert!(manifest.covers_unit(StorageUnit::Database), "清单必须覆盖数据库条目");
        assert_eq!(manifest.application_id, "com.example.notebook");

        // settings.json 的摘要应与原始内容一致
        let expected = checksum::compute_bytes_digest(b"{\"theme\":\"dark\"}");
        assert_eq!(manifest.file_checksums.get("settings.json"), Some(&expected));
        assert!(manifest.file_checksums.contains_key("images/2026/a.png"));
    }

    #[test]
    fn test_export_missing_database_fails_and_reopens() {
        let live = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let config = test_config(live.path(), work.path());

        // 数据库句柄指向一个单独目录，活动根中没有 app.db
        let db_dir = TempDir::new().unwrap();
        let handle = SqliteHandle::new(&db_dir.path().join("elsewhere.db")).unwrap();

        let result = ArchiveWriter::new(&config).export(&handle);
        assert!(result.is_err(), "缺少必备数据库单元应导出失败");
        assert!(handle.is_open(), "失败路径也必须重新打开数据库");

        // 不应留下半成品归档
        let leftovers: Vec<_> = fs::read_dir(config.exports_dir())
            .map(|it| it.filter_map(|e| e.ok()).collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty(), "失败后不应留下归档文件");
    }
}
