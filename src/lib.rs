//! migratecheck - 跨租户文档迁移核对引擎
//!
//! 按站点对核对两个租户之间的文档迁移：逐库抓取文档快照，先精确路径
//! 再规范化路径两阶段匹配，给每个文档一个比对状态，支持中断后续传，
//! 并用快照缓存压住重复的远程枚举成本。

use std::path::PathBuf;

pub mod config;
pub mod core;
pub mod logging;
pub mod models;
pub mod remote;

pub use config::CompareConfig;
pub use crate::core::{run_or_resume, CompareEngine, EngineDeps, SnapshotCache};
pub use models::{
    CompareProgress, ComparisonRecord, ComparisonStatus, RunResult, RunStatus, SitePair,
    SitePairResult,
};
pub use remote::{
    CollectionClient, ConnectionRegistry, CredentialStore, Credentials, ReauthHandler,
    SessionProvider,
};

/// 默认数据目录：缓存和运行结果都放在这里
pub fn default_data_dir() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join("migratecheck"))
        .unwrap_or_else(|| PathBuf::from(".migratecheck"))
}

/// 对外入口：按配置运行一次核对，`continue_from_previous` 为真时续传
pub async fn run(
    config: CompareConfig,
    deps: EngineDeps,
    continue_from_previous: bool,
    progress_tx: Option<tokio::sync::mpsc::Sender<CompareProgress>>,
) -> RunResult {
    let engine = CompareEngine::new(config, deps, default_data_dir());
    run_or_resume(&engine, continue_from_previous, progress_tx).await
}

/// 平台目录解析
pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }
    }

    pub fn cache_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Caches"))
        } else {
            // Linux
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".cache"))
        }
    }
}
