//! 库文档快照缓存
//!
//! 按（站点，库）内容寻址地缓存文档清单，避免重复的远程枚举。
//! 损坏的条目一律当作未命中；写入尽力而为，失败不影响抓取。

use crate::core::normalize::canonical_relative_path;
use crate::models::DocumentSnapshotItem;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

/// 缓存条目。只会整体替换，从不部分更新
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cached_at: DateTime<Utc>,
    pub site_url: String,
    pub library_title: String,
    /// 库根路径，加载时用它重新计算规范路径
    pub library_root_path: String,
    pub documents: Vec<DocumentSnapshotItem>,
}

/// 快照缓存管理器
pub struct SnapshotCache {
    cache_dir: PathBuf,
}

impl SnapshotCache {
    pub fn new(cache_dir: PathBuf) -> Self {
        // 确保缓存目录存在
        let _ = std::fs::create_dir_all(&cache_dir);
        Self { cache_dir }
    }

    /// 由站点地址和库标题计算定长指纹，大小写不敏感
    fn fingerprint(site_url: &str, library_title: &str) -> String {
        let key = format!("{}|{}", site_url.to_lowercase(), library_title.to_lowercase());
        let hash = blake3::hash(key.as_bytes());
        hash.to_hex()[..16].to_string()
    }

    fn entry_path(&self, site_url: &str, library_title: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}.cache", Self::fingerprint(site_url, library_title)))
    }

    /// 尝试读取缓存的文档清单。
    /// 命中时规范路径一律重新计算，不信任存储里的旧值
    pub fn try_get(
        &self,
        site_url: &str,
        library_title: &str,
        library_root: &str,
        ttl_hours: u32,
    ) -> Option<Vec<DocumentSnapshotItem>> {
        let path = self.entry_path(site_url, library_title);

        if !path.exists() {
            return None;
        }

        let data = match std::fs::read(&path) {
            Ok(d) => d,
            Err(_) => return None,
        };

        let entry: CacheEntry = match serde_json::from_slice(&data) {
            Ok(e) => e,
            Err(_) => {
                // 缓存损坏，删除后当作未命中
                let _ = std::fs::remove_file(&path);
                return None;
            }
        };

        let age = Utc::now().signed_duration_since(entry.cached_at);
        if age >= Duration::hours(ttl_hours as i64) {
            info!(
                "快照缓存已过期 ({})，清除: {} / {}",
                Self::format_age(age.num_seconds().max(0) as u64),
                site_url,
                library_title
            );
            let _ = std::fs::remove_file(&path);
            return None;
        }

        let mut documents = entry.documents;
        for doc in &mut documents {
            doc.canonicalRelativePath =
                canonical_relative_path(&doc.serverRelativePath, library_root);
        }

        info!(
            "从缓存加载 {} 个文档 (缓存于 {}): {} / {}",
            documents.len(),
            Self::format_age(age.num_seconds().max(0) as u64),
            site_url,
            library_title
        );

        Some(documents)
    }

    /// 保存文档清单。写临时文件再改名，保证整文件原子替换；
    /// 失败只记警告，不向上传播
    pub fn put(
        &self,
        site_url: &str,
        library_title: &str,
        library_root: &str,
        documents: &[DocumentSnapshotItem],
    ) {
        let entry = CacheEntry {
            cached_at: Utc::now(),
            site_url: site_url.to_string(),
            library_title: library_title.to_string(),
            library_root_path: library_root.to_string(),
            documents: documents.to_vec(),
        };

        let path = self.entry_path(site_url, library_title);
        let tmp_path = path.with_extension("cache.tmp");

        let write_result = serde_json::to_vec(&entry)
            .map_err(anyhow::Error::from)
            .and_then(|data| std::fs::write(&tmp_path, data).map_err(anyhow::Error::from))
            .and_then(|_| std::fs::rename(&tmp_path, &path).map_err(anyhow::Error::from));

        match write_result {
            Ok(_) => info!(
                "已缓存 {} 个文档: {} / {}",
                documents.len(),
                site_url,
                library_title
            ),
            Err(e) => warn!("写入快照缓存失败（忽略）: {}", e),
        }
    }

    /// 清除指定（站点，库）的缓存
    pub fn clear(&self, site_url: &str, library_title: &str) {
        let _ = std::fs::remove_file(self.entry_path(site_url, library_title));
    }

    /// 清除所有缓存条目
    pub fn clear_all(&self) {
        if let Ok(entries) = std::fs::read_dir(&self.cache_dir) {
            for entry in entries.flatten() {
                if entry.path().extension().map(|e| e == "cache").unwrap_or(false) {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
    }

    /// 格式化缓存年龄
    pub fn format_age(age_seconds: u64) -> String {
        if age_seconds < 60 {
            format!("{}秒前", age_seconds)
        } else if age_seconds < 3600 {
            format!("{}分钟前", age_seconds / 60)
        } else if age_seconds < 86400 {
            format!("{}小时前", age_seconds / 3600)
        } else {
            format!("{}天前", age_seconds / 86400)
        }
    }
}
