//! 运行结果的汇总与持久化
//!
//! 汇总统计对全部记录做单趟扫描，不维护随插入更新的计数器；
//! 结果文件按「任务标识_启动时间」命名，最近一次结果靠文件名
//! 字典序恢复，不需要额外索引。

use crate::models::{ComparisonStatus, RunResult};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use tracing::{debug, info};

/// 运行级汇总统计
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub found: u32,
    pub size_issue: u32,
    pub source_only: u32,
    pub target_only: u32,
    pub newer_at_source: u32,
    pub total_records: u32,
}

/// 单趟扫描全部比对记录，统计与插入顺序无关
pub fn summarize(result: &RunResult) -> RunSummary {
    let mut summary = RunSummary::default();

    for pair in &result.pairResults {
        for library in &pair.libraries {
            for record in &library.records {
                summary.total_records += 1;
                match record.status {
                    ComparisonStatus::Found => summary.found += 1,
                    ComparisonStatus::SizeIssue => summary.size_issue += 1,
                    ComparisonStatus::SourceOnly => summary.source_only += 1,
                    ComparisonStatus::TargetOnly => summary.target_only += 1,
                }
                if record.isNewerAtSource {
                    summary.newer_at_source += 1;
                }
            }
        }
    }

    summary
}

/// 运行结果存储
pub struct ResultStore {
    result_dir: PathBuf,
}

impl ResultStore {
    pub fn new(result_dir: PathBuf) -> Self {
        let _ = std::fs::create_dir_all(&result_dir);
        Self { result_dir }
    }

    /// 结果文件名：任务标识 + 启动时间，字典序即时间序
    fn file_name(task_id: &str, started_at: &DateTime<Utc>) -> String {
        format!("{}_{}.json", task_id, started_at.format("%Y%m%d%H%M%S"))
    }

    /// 流式写出运行结果，大结果不在内存里整体物化
    pub fn save(&self, result: &RunResult) -> Result<PathBuf> {
        let path = self
            .result_dir
            .join(Self::file_name(&result.taskId, &result.startedAt));

        let file = File::create(&path)
            .with_context(|| format!("创建结果文件失败: {:?}", path))?;
        let writer = BufWriter::new(file);
        serde_json::to_writer(writer, result).context("序列化运行结果失败")?;

        debug!("运行结果已持久化: {:?}", path);
        Ok(path)
    }

    /// 读取指定任务最近一次持久化的运行结果
    pub fn load_latest(&self, task_id: &str) -> Result<Option<RunResult>> {
        let prefix = format!("{}_", task_id);
        let mut latest: Option<String> = None;

        let entries = match std::fs::read_dir(&self.result_dir) {
            Ok(e) => e,
            Err(_) => return Ok(None),
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&prefix) && name.ends_with(".json") {
                if latest.as_deref().map(|cur| name.as_str() > cur).unwrap_or(true) {
                    latest = Some(name);
                }
            }
        }

        let Some(name) = latest else {
            return Ok(None);
        };

        let path = self.result_dir.join(&name);
        let file = File::open(&path)
            .with_context(|| format!("打开结果文件失败: {:?}", path))?;
        let reader = BufReader::new(file);
        let result: RunResult =
            serde_json::from_reader(reader).with_context(|| format!("解析结果文件失败: {:?}", path))?;

        info!("加载历史运行结果: {}", name);
        Ok(Some(result))
    }
}
