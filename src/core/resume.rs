//! 可续传运行控制器
//!
//! 在编排器外面包一层「接着上次跑」的语义：读取最近一次持久化的
//! 运行结果，把其中成功的站点对原样带入新结果，循环里跳过它们。
//! 对已成功的站点对，续传是幂等的；上次失败的站点对会被重试。

use crate::core::orchestrator::CompareEngine;
use crate::models::{CompareProgress, RunResult};
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// 带入的历史日志行的前缀标记
const RESUME_MARKER: &str = "[续传] ";

/// 运行或续传。`continue_from_previous` 为假时等价于一次全新运行；
/// 找不到历史结果（或历史结果损坏）时也退化为全新运行
pub async fn run_or_resume(
    engine: &CompareEngine,
    continue_from_previous: bool,
    progress_tx: Option<mpsc::Sender<CompareProgress>>,
) -> RunResult {
    if !continue_from_previous {
        return engine.run(progress_tx).await;
    }

    let task_id = engine.config().task_id.clone();
    let previous = match engine.store().load_latest(&task_id) {
        Ok(Some(previous)) => previous,
        Ok(None) => {
            info!("任务 {} 没有历史运行结果，按全新运行处理", task_id);
            return engine.run(progress_tx).await;
        }
        Err(e) => {
            warn!("读取历史运行结果失败，按全新运行处理: {}", e);
            return engine.run(progress_tx).await;
        }
    };

    let mut result = RunResult::new(&task_id);
    result.log(format!(
        "续传自运行 {} (启动于 {})",
        previous.id,
        previous.startedAt.format("%Y-%m-%d %H:%M:%S")
    ));

    // 上次成功的站点对原样带入：结果、日志（加续传标记）、成功计数。
    // 失败的站点对不带入，留给本次循环重试
    let mut completed_sources = HashSet::new();
    for mut pair_result in previous.pairResults {
        if !pair_result.success {
            continue;
        }
        completed_sources.insert(pair_result.pair.sourceUrl.clone());
        for line in &mut pair_result.log {
            *line = format!("{}{}", RESUME_MARKER, line);
        }
        result.successCount += 1;
        result.pairResults.push(pair_result);
    }
    result.log(format!(
        "携带 {} 个已完成的站点对，本次不再重新比对",
        completed_sources.len()
    ));
    info!(
        "续传运行: 任务 {}，携带 {} 个已完成站点对",
        task_id,
        completed_sources.len()
    );

    engine
        .run_with_seed(result, completed_sources, progress_tx)
        .await
}
