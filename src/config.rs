//! 比对任务配置

use crate::models::SitePair;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 默认排除的平台系统库，永远参与合并
pub const DEFAULT_EXCLUDED_LIBRARIES: &[&str] = &[
    "Form Templates",
    "Style Library",
    "Site Assets",
    "Site Pages",
    "Preservation Hold Library",
    "Teams Wiki Data",
];

/// 一次核对任务的配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareConfig {
    /// 任务标识，用于结果文件命名与续传查找
    pub task_id: String,
    pub source_connection_id: String,
    pub target_connection_id: String,
    pub site_pairs: Vec<SitePair>,
    /// 额外排除的库名，可带 * 通配符，与默认排除表合并
    #[serde(default)]
    pub excluded_libraries: Vec<String>,
    #[serde(default)]
    pub include_hidden_libraries: bool,
    #[serde(default)]
    pub include_special_pages: bool,
    /// 精确匹配失败后是否用规范化路径做模糊回退
    #[serde(default = "default_true")]
    pub use_fuzzy_fallback: bool,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: u32,
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl_hours() -> u32 {
    48
}

impl CompareConfig {
    /// 从 JSON 配置文件加载
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("读取任务配置失败: {:?}", path))?;
        let config: Self =
            serde_json::from_str(&content).with_context(|| format!("解析任务配置失败: {:?}", path))?;
        Ok(config)
    }

    /// 保存到 JSON 配置文件
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("写入任务配置失败: {:?}", path))?;
        Ok(())
    }

    /// 构建合并了默认排除表的库名过滤器
    pub fn library_denylist(&self) -> LibraryDenylist {
        let mut names: Vec<String> = DEFAULT_EXCLUDED_LIBRARIES
            .iter()
            .map(|s| s.to_string())
            .collect();
        names.extend(self.excluded_libraries.iter().cloned());
        LibraryDenylist::new(&names)
    }
}

/// 库名排除过滤器，支持 * 通配符，匹配不区分大小写
pub struct LibraryDenylist {
    literals: Vec<String>,
    patterns: Vec<regex::Regex>,
}

impl LibraryDenylist {
    pub fn new(names: &[String]) -> Self {
        let mut literals = Vec::new();
        let mut patterns = Vec::new();

        for name in names {
            if name.contains('*') {
                let escaped = regex::escape(&name.to_lowercase()).replace("\\*", ".*");
                if let Ok(re) = regex::Regex::new(&format!("^{}$", escaped)) {
                    patterns.push(re);
                }
            } else {
                literals.push(name.to_lowercase());
            }
        }

        Self { literals, patterns }
    }

    pub fn is_excluded(&self, library_title: &str) -> bool {
        let lower = library_title.to_lowercase();
        self.literals.iter().any(|l| l == &lower)
            || self.patterns.iter().any(|p| p.is_match(&lower))
    }
}
