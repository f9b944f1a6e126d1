#![allow(non_snake_case)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 站点对：一次核对的最小单位
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SitePair {
    pub sourceUrl: String,
    pub targetUrl: String,
}

/// 条目类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    File,
    Folder,
}

/// 某一侧某个库中的一个文件或文件夹快照
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshotItem {
    pub id: i64,
    pub fileName: String,
    /// 服务器相对路径（原始值，缓存中保存的是这个）
    pub serverRelativePath: String,
    /// 库根相对的规范路径。每次使用前重新计算，不信任缓存里的旧值
    #[serde(default)]
    pub canonicalRelativePath: String,
    pub sizeBytes: u64,
    pub versionCount: u32,
    pub itemKind: ItemKind,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

/// 比对状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ComparisonStatus {
    Found,
    SizeIssue,
    SourceOnly,
    TargetOnly,
}

/// 最终报告中的一行：一个文档在两侧的对照
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonRecord {
    pub canonicalPath: String,
    pub status: ComparisonStatus,
    pub itemKind: ItemKind,
    pub sourceItemId: Option<i64>,
    pub sourceFileName: Option<String>,
    pub sourcePath: Option<String>,
    pub sourceSizeBytes: Option<u64>,
    pub sourceVersionCount: Option<u32>,
    pub sourceModified: Option<DateTime<Utc>>,
    pub targetItemId: Option<i64>,
    pub targetFileName: Option<String>,
    pub targetPath: Option<String>,
    pub targetSizeBytes: Option<u64>,
    pub targetVersionCount: Option<u32>,
    pub targetModified: Option<DateTime<Utc>>,
    pub hasSizeIssue: bool,
    /// 源侧修改时间晚于目标侧超过 24 小时（迁移后源侧又有编辑）
    pub isNewerAtSource: bool,
    /// 是否通过规范化路径匹配（而非精确路径）
    pub fuzzyMatched: bool,
}

/// 一个站点对内单个库的比对结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryReconciliation {
    pub libraryTitle: String,
    pub foundCount: u32,
    pub sizeIssueCount: u32,
    pub sourceOnlyCount: u32,
    pub targetOnlyCount: u32,
    /// 源侧去重时丢弃的重复条目数
    pub duplicateSourceCount: u32,
    pub records: Vec<ComparisonRecord>,
}

impl LibraryReconciliation {
    /// 由比对记录构造，按状态统计计数
    pub fn from_records(
        library_title: String,
        records: Vec<ComparisonRecord>,
        duplicate_source_count: u32,
    ) -> Self {
        let mut result = Self {
            libraryTitle: library_title,
            foundCount: 0,
            sizeIssueCount: 0,
            sourceOnlyCount: 0,
            targetOnlyCount: 0,
            duplicateSourceCount: duplicate_source_count,
            records: Vec::new(),
        };

        for record in &records {
            match record.status {
                ComparisonStatus::Found => result.foundCount += 1,
                ComparisonStatus::SizeIssue => result.sizeIssueCount += 1,
                ComparisonStatus::SourceOnly => result.sourceOnlyCount += 1,
                ComparisonStatus::TargetOnly => result.targetOnlyCount += 1,
            }
        }

        result.records = records;
        result
    }
}

/// 一个站点对的比对结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SitePairResult {
    pub pair: SitePair,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub libraries: Vec<LibraryReconciliation>,
    /// 该站点对处理过程中的日志行
    pub log: Vec<String>,
}

impl SitePairResult {
    pub fn new(pair: SitePair) -> Self {
        Self {
            pair,
            success: false,
            error: None,
            libraries: Vec::new(),
            log: Vec::new(),
        }
    }

    pub fn failed(pair: SitePair, error: String) -> Self {
        Self {
            pair,
            success: false,
            error: Some(error),
            libraries: Vec::new(),
            log: Vec::new(),
        }
    }

    /// 追加一条带时间戳的日志行
    pub fn log_line(&mut self, message: impl Into<String>) {
        self.log
            .push(format!("[{}] {}", Utc::now().format("%Y-%m-%d %H:%M:%S"), message.into()));
    }
}

/// 运行状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// 一次完整运行的顶层产物
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub id: String,
    /// 任务标识，用于结果文件命名与续传查找
    pub taskId: String,
    pub status: RunStatus,
    pub startedAt: DateTime<Utc>,
    pub completedAt: Option<DateTime<Utc>>,
    pub successCount: u32,
    pub failureCount: u32,
    pub pairResults: Vec<SitePairResult>,
    pub executionLog: Vec<String>,
}

impl RunResult {
    pub fn new(task_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            taskId: task_id.to_string(),
            status: RunStatus::Running,
            startedAt: Utc::now(),
            completedAt: None,
            successCount: 0,
            failureCount: 0,
            pairResults: Vec::new(),
            executionLog: Vec::new(),
        }
    }

    /// 追加一条带时间戳的执行日志
    pub fn log(&mut self, message: impl Into<String>) {
        self.executionLog
            .push(format!("[{}] {}", Utc::now().format("%Y-%m-%d %H:%M:%S"), message.into()));
    }

    /// 封存运行结果，设置终态和完成时间
    pub fn seal(&mut self, status: RunStatus) {
        self.status = status;
        self.completedAt = Some(Utc::now());
    }
}

/// 比对进度事件，由展示层消费；发送失败不影响运行
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareProgress {
    pub currentIndex: usize,
    pub totalCount: usize,
    pub currentSiteUrl: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completedPair: Option<SitePairResult>,
}
