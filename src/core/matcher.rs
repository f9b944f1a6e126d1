//! 文档匹配器
//!
//! 对同一个库两侧的文档快照做两阶段匹配：先精确路径，再规范化路径回退，
//! 并给每个文档一个比对状态。

use crate::core::normalize::normalize;
use crate::models::{ComparisonRecord, ComparisonStatus, DocumentSnapshotItem, ItemKind};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// 大小核查的尺寸下限：小于这个值的文件不做比例核查
const SIZE_CHECK_MIN_BYTES: u64 = 50 * 1024;
/// 目标大小低于源大小这个比例视为有疑
const SIZE_RATIO_FLOOR: f64 = 0.30;
/// 源侧比目标侧新超过这个小时数才算"源侧更新"
const STALENESS_MARGIN_HOURS: i64 = 24;

/// 一次库级匹配的产出
#[derive(Debug)]
pub struct MatchOutcome {
    pub records: Vec<ComparisonRecord>,
    /// 源侧去重时丢弃的重复条目数
    pub duplicate_source_count: u32,
}

/// 核对两侧快照，产出逐文档的比对记录。
///
/// 记录顺序：先按源侧顺序输出匹配/仅源侧记录，再按目标侧原始顺序
/// 输出剩余的仅目标侧记录
pub fn reconcile(
    source_docs: &[DocumentSnapshotItem],
    target_docs: &[DocumentSnapshotItem],
    use_fuzzy_fallback: bool,
) -> MatchOutcome {
    // 一、源侧去重：精确规范路径为键，保留首个。
    // 分页竞争可能让远程接口把同一条目返回两次
    let mut seen_keys = HashSet::new();
    let mut deduped: Vec<&DocumentSnapshotItem> = Vec::with_capacity(source_docs.len());
    for item in source_docs {
        if seen_keys.insert(exact_key(item)) {
            deduped.push(item);
        }
    }
    let duplicate_source_count = (source_docs.len() - deduped.len()) as u32;
    if duplicate_source_count > 0 {
        debug!("源侧去重: 丢弃 {} 个重复条目", duplicate_source_count);
    }

    // 二、目标侧索引。目标侧出现重复路径可能是数据质量问题，逐条告警后保留首个
    let mut target_exact: HashMap<String, &DocumentSnapshotItem> = HashMap::new();
    // 规范化键 -> 精确键
    let mut target_fuzzy: HashMap<String, String> = HashMap::new();
    for item in target_docs {
        let key = exact_key(item);
        match target_exact.entry(key.clone()) {
            Entry::Occupied(_) => {
                warn!("目标侧出现重复路径，保留首个: {}", item.canonicalRelativePath);
            }
            Entry::Vacant(slot) => {
                slot.insert(item);
                if use_fuzzy_fallback {
                    target_fuzzy.entry(fuzzy_key(item)).or_insert(key);
                }
            }
        }
    }

    // 三、逐个源条目解析：先精确查找，失败再走规范化回退。
    // 命中的条目要同时从两个索引里摘除，剩下的才能正确代表仅目标侧
    let mut records = Vec::with_capacity(deduped.len());
    for source in deduped {
        let key = exact_key(source);

        let (matched, fuzzy_used) = if let Some(target) = target_exact.remove(&key) {
            if use_fuzzy_fallback {
                let fkey = fuzzy_key(target);
                if target_fuzzy.get(&fkey).map(|k| k == &key).unwrap_or(false) {
                    target_fuzzy.remove(&fkey);
                }
            }
            (Some(target), false)
        } else if use_fuzzy_fallback {
            match target_fuzzy.remove(&fuzzy_key(source)) {
                Some(exact) => (target_exact.remove(&exact), true),
                None => (None, false),
            }
        } else {
            (None, false)
        };

        match matched {
            Some(target) => records.push(matched_record(source, target, fuzzy_used)),
            None => records.push(source_only_record(source)),
        }
    }

    // 四、目标侧剩余条目全部记为仅目标侧，保持原始顺序
    for item in target_docs {
        if let Some(target) = target_exact.remove(&exact_key(item)) {
            records.push(target_only_record(target));
        }
    }

    MatchOutcome {
        records,
        duplicate_source_count,
    }
}

fn exact_key(item: &DocumentSnapshotItem) -> String {
    item.canonicalRelativePath.to_lowercase()
}

fn fuzzy_key(item: &DocumentSnapshotItem) -> String {
    normalize(&item.canonicalRelativePath).to_lowercase()
}

/// 文件的大小核查。文件夹不做这项核查。
/// 比例核查用浮点除法，源大小为 0 时目标也必须为 0，绝不出现除零
fn has_size_issue(source_size: u64, target_size: u64) -> bool {
    if source_size == 0 {
        return target_size != 0;
    }
    if target_size == 0 {
        return true;
    }
    if source_size >= SIZE_CHECK_MIN_BYTES {
        return (target_size as f64) / (source_size as f64) < SIZE_RATIO_FLOOR;
    }
    false
}

fn matched_record(
    source: &DocumentSnapshotItem,
    target: &DocumentSnapshotItem,
    fuzzy_matched: bool,
) -> ComparisonRecord {
    let size_issue = source.itemKind == ItemKind::File
        && has_size_issue(source.sizeBytes, target.sizeBytes);

    let status = if size_issue {
        ComparisonStatus::SizeIssue
    } else {
        ComparisonStatus::Found
    };

    let newer_at_source = match (source.modified, target.modified) {
        (Some(src), Some(dst)) => {
            src.signed_duration_since(dst) > chrono::Duration::hours(STALENESS_MARGIN_HOURS)
        }
        _ => false,
    };

    ComparisonRecord {
        canonicalPath: source.canonicalRelativePath.clone(),
        status,
        itemKind: source.itemKind,
        sourceItemId: Some(source.id),
        sourceFileName: Some(source.fileName.clone()),
        sourcePath: Some(source.serverRelativePath.clone()),
        sourceSizeBytes: Some(source.sizeBytes),
        sourceVersionCount: Some(source.versionCount),
        sourceModified: source.modified,
        targetItemId: Some(target.id),
        targetFileName: Some(target.fileName.clone()),
        targetPath: Some(target.serverRelativePath.clone()),
        targetSizeBytes: Some(target.sizeBytes),
        targetVersionCount: Some(target.versionCount),
        targetModified: target.modified,
        hasSizeIssue: size_issue,
        isNewerAtSource: newer_at_source,
        fuzzyMatched: fuzzy_matched,
    }
}

fn source_only_record(source: &DocumentSnapshotItem) -> ComparisonRecord {
    ComparisonRecord {
        canonicalPath: source.canonicalRelativePath.clone(),
        status: ComparisonStatus::SourceOnly,
        itemKind: source.itemKind,
        sourceItemId: Some(source.id),
        sourceFileName: Some(source.fileName.clone()),
        sourcePath: Some(source.serverRelativePath.clone()),
        sourceSizeBytes: Some(source.sizeBytes),
        sourceVersionCount: Some(source.versionCount),
        sourceModified: source.modified,
        targetItemId: None,
        targetFileName: None,
        targetPath: None,
        targetSizeBytes: None,
        targetVersionCount: None,
        targetModified: None,
        hasSizeIssue: false,
        isNewerAtSource: false,
        fuzzyMatched: false,
    }
}

fn target_only_record(target: &DocumentSnapshotItem) -> ComparisonRecord {
    ComparisonRecord {
        canonicalPath: target.canonicalRelativePath.clone(),
        status: ComparisonStatus::TargetOnly,
        itemKind: target.itemKind,
        sourceItemId: None,
        sourceFileName: None,
        sourcePath: None,
        sourceSizeBytes: None,
        sourceVersionCount: None,
        sourceModified: None,
        targetItemId: Some(target.id),
        targetFileName: Some(target.fileName.clone()),
        targetPath: Some(target.serverRelativePath.clone()),
        targetSizeBytes: Some(target.sizeBytes),
        targetVersionCount: Some(target.versionCount),
        targetModified: target.modified,
        hasSizeIssue: false,
        isNewerAtSource: false,
        fuzzyMatched: false,
    }
}
