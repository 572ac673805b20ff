//! 导入第一阶段：解压与校验（纯读取，不触碰活动数据）
//!
//! 归档解压到一个全新的隔离暂存目录。每个条目的目标路径都会被规范化并
//! 验证位于暂存根之下；任何逃逸暂存根的条目（绝对路径、`..` 穿越）直接
//! 中止解压。条目分类为: 清单 / 可识别的存储单元 / 未识别（跳过并记录为
//! extra）。清单校验失败时系统与调用 `import_backup` 之前完全一致。

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::checksum::{check_zip_security, compute_file_digest, MAX_UNCOMPRESSED_SIZE};
use crate::config::EngineConfig;
use crate::errors::{BackupError, ValidationFailure};
use crate::fsops::resilient_remove_dir_all;
use crate::manifest::{BackupManifest, MANIFEST_FILE};
use crate::storage::StorageUnit;

type Result<T> = std::result::Result<T, BackupError>;

/// 解压完成、尚未提交的备份
#[derive(Debug)]
pub struct ExtractedBackup {
    pub staging_root: PathBuf,
    pub manifest: BackupManifest,
    /// 归档条目路径 -> 暂存目录内的落盘位置
    pub files: HashMap<String, PathBuf>,
    /// 未识别、被跳过的条目（仅记录，不算失败）
    pub extra_entries: Vec<String>,
}

impl ExtractedBackup {
    /// 某存储单元在暂存目录内的位置（单元未出现在归档中时返回 None）
    pub fn staged_unit_path(&self, unit: StorageUnit) -> Option<PathBuf> {
        let path = unit.live_path(&self.staging_root);
        path.exists().then_some(path)
    }
}

pub struct ArchiveReader<'a> {
    config: &'a EngineConfig,
}

impl<'a> ArchiveReader<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// 解压归档到全新的暂存目录
    pub fn extract(&self, archive: &Path) -> Result<ExtractedBackup> {
        if !archive.exists() {
            return Err(BackupError::not_found(format!(
                "备份文件不存在: {:?}",
                archive
            )));
        }

        // ZIP 炸弹预检
        let security_check = check_zip_security(archive)?;
        security_check.validate()?;
        info!(
            "[Reader] ZIP 安全预检通过: {} 个条目, {:.2} MB 解压后大小, 压缩比 {:.1}:1",
            security_check.file_count,
            security_check.total_uncompressed_size as f64 / 1024.0 / 1024.0,
            security_check.compression_ratio
        );

        let staging_root = self.config.staging_root();
        if staging_root.exists() {
            resilient_remove_dir_all(&staging_root)
                .map_err(|e| BackupError::file_system(format!("清理暂存目录失败: {}", e)))?;
        }
        fs::create_dir_all(&staging_root)
            .map_err(|e| BackupError::file_system(format!("创建暂存目录失败: {}", e)))?;

        let file = File::open(archive)
            .map_err(|e| BackupError::archive_read(format!("打开备份文件失败: {}", e)))?;
        let mut zip = zip::ZipArchive::new(file)
            .map_err(|e| BackupError::archive_read(format!("解析 ZIP 文件失败: {}", e)))?;

        let total_entries = zip.len();
        info!("[Reader] 解压备份，总条目 {}", total_entries);

        let mut manifest: Option<BackupManifest> = None;
        let mut files: HashMap<String, PathBuf> = HashMap::new();
        let mut extra_entries: Vec<String> = Vec::new();
        // 实时大小监控，防止 ZIP 炸弹绕过预检查
        let mut total_bytes_extracted: u64 = 0;

        for i in 0..total_entries {
            let mut entry = zip
                .by_index(i)
                .map_err(|e| BackupError::archive_read(format!("读取 ZIP 条目失败: {}", e)))?;
            let entry_name = entry.name().to_string();

            // 符号链接条目不落盘
            #[cfg(unix)]
            {
                if let Some(mode) = entry.unix_mode() {
                    const S_IFLNK: u32 = 0o120000;
                    if mode & 0o170000 == S_IFLNK {
                        warn!("[Reader] 跳过 ZIP 中的符号链接条目: {}", entry_name);
                        extra_entries.push(entry_name);
                        continue;
                    }
                }
            }

            if entry_name == MANIFEST_FILE {
                let mut content = String::new();
                entry
                    .read_to_string(&mut content)
                    .map_err(|e| BackupError::archive_read(format!("读取清单失败: {}", e)))?;
                manifest = Some(serde_json::from_str(&content).map_err(|e| {
                    BackupError::archive_read(format!("清单格式错误: {}", e))
                })?);
                debug!("[Reader] 清单读取成功，长度 {} 字符", content.len());
                continue;
            }

            if entry_name.ends_with('/') {
                // 目录条目：仅为可识别单元创建目录
                if StorageUnit::classify_entry(&entry_name).is_some() {
                    let rel = sanitize_entry_path(&entry_name)?;
                    fs::create_dir_all(staging_root.join(rel)).map_err(|e| {
                        BackupError::file_system(format!("创建目录失败: {}", e))
                    })?;
                }
                continue;
            }

            if StorageUnit::classify_entry(&entry_name).is_none() {
                debug!("[Reader] 跳过未识别条目: {}", entry_name);
                extra_entries.push(entry_name);
                continue;
            }

            let rel = sanitize_entry_path(&entry_name)?;
            let out_path = staging_root.join(&rel);

            // 最终安全验证: 规范化后仍须位于暂存根之下
            ensure_under_root(&staging_root, &out_path, &entry_name)?;

            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| BackupError::file_system(format!("创建父目录失败: {}", e)))?;
            }
            let mut outfile = File::create(&out_path)
                .map_err(|e| BackupError::file_system(format!("创建文件失败 {:?}: {}", out_path, e)))?;
            let bytes_written = std::io::copy(&mut entry, &mut outfile)
                .map_err(|e| BackupError::file_system(format!("写入文件失败 {:?}: {}", out_path, e)))?;

            total_bytes_extracted += bytes_written;
            if total_bytes_extracted > MAX_UNCOMPRESSED_SIZE {
                let _ = resilient_remove_dir_all(&staging_root);
                return Err(BackupError::archive_read(format!(
                    "ZIP 炸弹检测：解压总大小 {} 超过限制 {}，已中止并清理",
                    total_bytes_extracted, MAX_UNCOMPRESSED_SIZE
                )));
            }

            files.insert(entry_name, out_path);
        }

        if !extra_entries.is_empty() {
            warn!(
                "[Reader] 归档包含 {} 个未识别条目（已忽略）: {:?}",
                extra_entries.len(),
                extra_entries
            );
        }

        // 截断的归档（导出中途崩溃）必然缺少最后写入的清单
        let manifest = manifest.ok_or_else(|| {
            BackupError::archive_read("归档缺少清单条目，可能是不完整的备份文件")
        })?;

        Ok(ExtractedBackup {
            staging_root,
            manifest,
            files,
            extra_entries,
        })
    }

    /// 清单校验：身份、schema 版本、条目存在性、校验和、必备条目
    ///
    /// 校验不修改任何活动数据；失败时调用方只需丢弃暂存目录。
    pub fn validate(&self, extracted: &ExtractedBackup) -> Result<()> {
        let manifest = &extracted.manifest;

        if manifest.application_id != self.config.application_id {
            return Err(BackupError::validation(
                ValidationFailure::IdentityMismatch,
                format!(
                    "备份归属于其他应用: {} (当前: {})",
                    manifest.application_id, self.config.application_id
                ),
            ));
        }

        if manifest.schema_version != self.config.schema_version {
            return Err(BackupError::validation(
                ValidationFailure::UnsupportedSchema,
                format!(
                    "schema 版本不匹配: 归档 {} vs 当前 {}（要求精确匹配）",
                    manifest.schema_version, self.config.schema_version
                ),
            ));
        }

        for (entry_name, expected) in &manifest.file_checksums {
            let extracted_path = extracted.files.get(entry_name).ok_or_else(|| {
                BackupError::validation(
                    ValidationFailure::MissingEntry,
                    format!("清单引用的条目未在归档中找到: {}", entry_name),
                )
            })?;

            let actual = compute_file_digest(extracted_path)?;
            if !actual.eq_ignore_ascii_case(expected) {
                error!(
                    "[Reader] 校验和不匹配 {}: 期望 {}, 实际 {}",
                    entry_name, expected, actual
                );
                return Err(BackupError::validation(
                    ValidationFailure::ChecksumMismatch,
                    format!("条目 {} 校验和不匹配", entry_name),
                ));
            }
        }

        for unit in StorageUnit::ALL {
            if unit.is_required() && !manifest.covers_unit(*unit) {
                return Err(BackupError::validation(
                    ValidationFailure::MissingRequiredEntry,
                    format!("清单缺少必备条目: {}", unit.archive_name()),
                ));
            }
        }

        // 清单未引用的解压文件仅告警
        for entry_name in extracted.files.keys() {
            if !manifest.file_checksums.contains_key(entry_name) {
                warn!("[Reader] 解压文件未被清单引用（容忍）: {}", entry_name);
            }
        }

        info!(
            "[Reader] 清单校验通过: {} 个校验和条目",
            manifest.file_checksums.len()
        );
        Ok(())
    }
}

/// 过滤路径组件，只保留 Normal；绝对路径与 `..` 直接中止解压
fn sanitize_entry_path(entry_name: &str) -> Result<PathBuf> {
    let mut rel = PathBuf::new();
    for comp in Path::new(entry_name).components() {
        match comp {
            Component::Normal(c) => rel.push(c),
            Component::RootDir | Component::Prefix(_) => {
                return Err(BackupError::file_system(format!(
                    "ZIP 包含绝对路径条目，已中止解压: {}",
                    entry_name
                )));
            }
            Component::ParentDir => {
                return Err(BackupError::file_system(format!(
                    "ZIP 包含路径穿越条目 (..)，已中止解压: {}",
                    entry_name
                )));
            }
            Component::CurDir => {}
        }
    }
    Ok(rel)
}

/// 规范化后的落盘路径必须位于暂存根之下
fn ensure_under_root(staging_root: &Path, out_path: &Path, entry_name: &str) -> Result<()> {
    let canonical_root = staging_root
        .canonicalize()
        .unwrap_or_else(|_| staging_root.to_path_buf());

    // out_path 尚未创建，检查其最近的已存在祖先
    let check_target = if out_path.exists() {
        out_path.to_path_buf()
    } else {
        match out_path.parent() {
            Some(parent) if parent.exists() => parent.to_path_buf(),
            _ => return Ok(()),
        }
    };

    if let Ok(canonical) = check_target.canonicalize() {
        if !canonical.starts_with(&canonical_root) {
            return Err(BackupError::file_system(format!(
                "路径穿越检测: {} -> {:?}",
                entry_name, canonical
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sanitize_normal_path() {
        assert_eq!(
            sanitize_entry_path("images/2026/a.png").unwrap(),
            PathBuf::from("images/2026/a.png")
        );
    }

    #[test]
    fn test_sanitize_rejects_parent_dir() {
        assert!(sanitize_entry_path("images/../../etc/passwd").is_err(), "`..` 穿越应中止");
    }

    #[test]
    fn test_sanitize_rejects_absolute() {
        assert!(sanitize_entry_path("/etc/passwd").is_err(), "绝对路径应中止");
    }

    #[test]
    fn test_sanitize_ignores_cur_dir() {
        assert_eq!(
            sanitize_entry_path("./settings.json").unwrap(),
            PathBuf::from("settings.json")
        );
    }

    #[test]
    fn test_extract_rejects_traversal_archive() {
        use crate::manifest::BuildVariant;
        let work = tempfile::TempDir::new().unwrap();
        let live = tempfile::TempDir::new().unwrap();
        let config = EngineConfig::new(
            "com.example.notebook",
            BuildVariant::Debug,
            "1.0.0",
            1,
            live.path(),
            work.path(),
        );

        // 构造包含穿越条目的归档（条目名可被识别为 images 单元）
        let archive_path = work.path().join("evil.zip");
        {
            let file = File::create(&archive_path).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            let options = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            zip.start_file("images/../../evil.txt", options).unwrap();
            zip.write_all(b"evil").unwrap();
            zip.finish().unwrap();
        }

        let result = ArchiveReader::new(&config).extract(&archive_path);
        assert!(result.is_err(), "穿越条目应中止解压");
    }
}
