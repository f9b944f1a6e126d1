//! 任务编排器
//!
//! 驱动站点对循环：按源域复用会话、逐库抓取（可走缓存）、调用匹配器，
//! 并处理运行中途的凭据过期。单个站点对的异常被隔离在对边界内，
//! 配置级错误才终止整个运行。

use crate::config::{CompareConfig, LibraryDenylist};
use crate::core::cache::SnapshotCache;
use crate::core::matcher;
use crate::core::normalize::canonical_relative_path;
use crate::core::report::{self, ResultStore};
use crate::models::{
    CompareProgress, DocumentSnapshotItem, LibraryReconciliation, RunResult, RunStatus, SitePair,
    SitePairResult,
};
use crate::remote::{
    CollectionClient, ConnectionConfig, ConnectionRegistry, CredentialStore, LibraryInfo,
    ReauthHandler, ReauthOutcome, RemoteError, SessionProvider, SiteInfo,
    DOCUMENT_LIBRARY_TEMPLATE,
};
use anyhow::{anyhow, bail, Result};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// 引擎依赖的外部协作方
#[derive(Clone)]
pub struct EngineDeps {
    pub credentials: Arc<dyn CredentialStore>,
    pub connections: Arc<dyn ConnectionRegistry>,
    pub sessions: Arc<dyn SessionProvider>,
    /// 未配置时永不尝试重认证
    pub reauth: Option<Arc<dyn ReauthHandler>>,
}

/// 租户侧别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TenantSide {
    Source,
    Target,
}

impl TenantSide {
    fn label(&self) -> &'static str {
        match self {
            TenantSide::Source => "源",
            TenantSide::Target => "目标",
        }
    }
}

/// 取消信号的标记错误，用于把取消与普通失败区分开
#[derive(Debug, thiserror::Error)]
#[error("运行已取消")]
struct CancelledError;

/// 一次运行的可变上下文：懒建的会话表和每侧的重认证拒绝闩锁。
/// 运行结束时随上下文一起释放，会话只析构一次
struct RunContext {
    source_conn: ConnectionConfig,
    target_conn: ConnectionConfig,
    sessions: HashMap<(TenantSide, String), Arc<dyn CollectionClient>>,
    source_reauth_declined: bool,
    target_reauth_declined: bool,
}

impl RunContext {
    fn new(source_conn: ConnectionConfig, target_conn: ConnectionConfig) -> Self {
        Self {
            source_conn,
            target_conn,
            sessions: HashMap::new(),
            source_reauth_declined: false,
            target_reauth_declined: false,
        }
    }

    fn connection(&self, side: TenantSide) -> &ConnectionConfig {
        match side {
            TenantSide::Source => &self.source_conn,
            TenantSide::Target => &self.target_conn,
        }
    }

    fn declined(&self, side: TenantSide) -> bool {
        match side {
            TenantSide::Source => self.source_reauth_declined,
            TenantSide::Target => self.target_reauth_declined,
        }
    }

    fn set_declined(&mut self, side: TenantSide) {
        match side {
            TenantSide::Source => self.source_reauth_declined = true,
            TenantSide::Target => self.target_reauth_declined = true,
        }
    }

    fn session(&self, side: TenantSide, domain: &str) -> Option<Arc<dyn CollectionClient>> {
        self.sessions.get(&(side, domain.to_string())).cloned()
    }

    fn store_session(&mut self, side: TenantSide, domain: &str, client: Arc<dyn CollectionClient>) {
        // 旧会话（若有）被覆盖后随引用计数归零析构
        self.sessions.insert((side, domain.to_string()), client);
    }
}

/// 取 URL 的主机部分作为域，会话按域复用
pub(crate) fn host_of(url: &str) -> Result<String> {
    let rest = url
        .split("://")
        .nth(1)
        .ok_or_else(|| anyhow!("无效的站点地址: {}", url))?;
    let host = rest.split('/').next().unwrap_or("");
    if host.is_empty() {
        bail!("无效的站点地址: {}", url);
    }
    Ok(host.to_lowercase())
}

/// 跨租户核对引擎
pub struct CompareEngine {
    config: CompareConfig,
    deps: EngineDeps,
    cache: SnapshotCache,
    store: ResultStore,
    cancelled: Arc<AtomicBool>,
}

impl CompareEngine {
    pub fn new(config: CompareConfig, deps: EngineDeps, data_dir: PathBuf) -> Self {
        Self {
            config,
            deps,
            cache: SnapshotCache::new(data_dir.join("cache")),
            store: ResultStore::new(data_dir.join("results")),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 请求协作式取消
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// 取消信号句柄，可交给外层持有
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn config(&self) -> &CompareConfig {
        &self.config
    }

    /// 全新运行
    pub async fn run(&self, progress_tx: Option<mpsc::Sender<CompareProgress>>) -> RunResult {
        let result = RunResult::new(&self.config.task_id);
        self.run_with_seed(result, HashSet::new(), progress_tx).await
    }

    /// 用预置的结果和已完成集合运行，续传控制器以此为入口
    pub(crate) async fn run_with_seed(
        &self,
        mut result: RunResult,
        completed_sources: HashSet<String>,
        progress_tx: Option<mpsc::Sender<CompareProgress>>,
    ) -> RunResult {
        info!("开始核对运行: 任务 {}，运行 {}", self.config.task_id, result.id);
        result.log(format!("运行开始: {}", result.id));

        // 解析连接。失败属于配置错误，整个运行终止，不处理任何站点对
        let source_conn = match self
            .deps
            .connections
            .get_connection(&self.config.source_connection_id)
        {
            Some(conn) => conn,
            None => {
                return self.fail_run(
                    result,
                    format!("无法解析源连接: {}", self.config.source_connection_id),
                )
            }
        };
        let target_conn = match self
            .deps
            .connections
            .get_connection(&self.config.target_connection_id)
        {
            Some(conn) => conn,
            None => {
                return self.fail_run(
                    result,
                    format!("无法解析目标连接: {}", self.config.target_connection_id),
                )
            }
        };

        let mut ctx = RunContext::new(source_conn, target_conn);
        let denylist = self.config.library_denylist();
        let total = self.config.site_pairs.len();

        // 站点对按配置顺序处理；会话按源域和目标域各建一次并复用
        let source_domains: HashSet<String> = self
            .config
            .site_pairs
            .iter()
            .filter_map(|p| host_of(&p.sourceUrl).ok())
            .collect();
        result.log(format!("共 {} 个站点对，涉及 {} 个源域", total, source_domains.len()));

        let mut cancelled_midway = false;

        for (index, pair) in self.config.site_pairs.iter().enumerate() {
            // 站点对循环顶部检查取消
            if self.is_cancelled() {
                cancelled_midway = true;
                break;
            }

            if completed_sources.contains(&pair.sourceUrl) {
                debug!("站点对已在上次运行完成，跳过: {}", pair.sourceUrl);
                self.send_progress(
                    &progress_tx,
                    CompareProgress {
                        currentIndex: index + 1,
                        totalCount: total,
                        currentSiteUrl: pair.sourceUrl.clone(),
                        message: "上次运行已完成，跳过".to_string(),
                        completedPair: None,
                    },
                )
                .await;
                continue;
            }

            self.send_progress(
                &progress_tx,
                CompareProgress {
                    currentIndex: index + 1,
                    totalCount: total,
                    currentSiteUrl: pair.sourceUrl.clone(),
                    message: format!("开始比对 {} -> {}", pair.sourceUrl, pair.targetUrl),
                    completedPair: None,
                },
            )
            .await;

            match self
                .process_pair(pair, &mut ctx, &denylist, index, total, &progress_tx)
                .await
            {
                Ok(pair_result) => {
                    result.successCount += 1;
                    result.log(format!("站点对完成: {}", pair.sourceUrl));
                    self.send_progress(
                        &progress_tx,
                        CompareProgress {
                            currentIndex: index + 1,
                            totalCount: total,
                            currentSiteUrl: pair.sourceUrl.clone(),
                            message: "站点对完成".to_string(),
                            completedPair: Some(pair_result.clone()),
                        },
                    )
                    .await;
                    result.pairResults.push(pair_result);
                }
                Err(e) if e.downcast_ref::<CancelledError>().is_some() => {
                    cancelled_midway = true;
                    break;
                }
                Err(e) => {
                    // 对边界内的异常只记为该对的失败，进行中的比对结果丢弃，循环继续
                    error!("站点对处理失败: {} - {:#}", pair.sourceUrl, e);
                    result.failureCount += 1;
                    result.log(format!("站点对失败: {} - {:#}", pair.sourceUrl, e));
                    result
                        .pairResults
                        .push(SitePairResult::failed(pair.clone(), format!("{:#}", e)));
                }
            }

            // 每个站点对之后增量持久化
            if let Err(e) = self.store.save(&result) {
                warn!("增量持久化失败: {}", e);
            }
        }

        if cancelled_midway {
            result.log("运行被取消，保留已完成的站点对");
            result.seal(RunStatus::Cancelled);
        } else {
            result.seal(RunStatus::Completed);
        }

        let summary = report::summarize(&result);
        result.log(format!(
            "运行结束: 成功 {}，失败 {}；找到 {}，大小存疑 {}，仅源侧 {}，仅目标侧 {}，源侧更新 {}",
            result.successCount,
            result.failureCount,
            summary.found,
            summary.size_issue,
            summary.source_only,
            summary.target_only,
            summary.newer_at_source
        ));

        if let Err(e) = self.store.save(&result) {
            error!("持久化运行结果失败: {}", e);
        }

        info!(
            "核对运行结束: {} ({:?})，成功 {}，失败 {}",
            result.id, result.status, result.successCount, result.failureCount
        );

        result
    }

    /// 配置级错误：整个运行标记失败并持久化
    fn fail_run(&self, mut result: RunResult, message: String) -> RunResult {
        error!("{}", message);
        result.log(message);
        result.seal(RunStatus::Failed);
        if let Err(e) = self.store.save(&result) {
            error!("持久化运行结果失败: {}", e);
        }
        result
    }

    /// 处理一个站点对。返回 Err 表示该对失败（或整个运行被取消）
    async fn process_pair(
        &self,
        pair: &SitePair,
        ctx: &mut RunContext,
        denylist: &LibraryDenylist,
        index: usize,
        total: usize,
        progress_tx: &Option<mpsc::Sender<CompareProgress>>,
    ) -> Result<SitePairResult> {
        let mut pair_result = SitePairResult::new(pair.clone());
        pair_result.log_line(format!("开始比对: {} -> {}", pair.sourceUrl, pair.targetUrl));

        let source_domain = host_of(&pair.sourceUrl)?;
        let target_domain = host_of(&pair.targetUrl)?;

        // 站点元数据与库清单，认证失败时走重认证协议
        let source_site = self
            .site_info_with_reauth(ctx, TenantSide::Source, &source_domain, &pair.sourceUrl)
            .await?;
        let target_site = self
            .site_info_with_reauth(ctx, TenantSide::Target, &target_domain, &pair.targetUrl)
            .await?;
        pair_result.log_line(format!("站点: 「{}」 <-> 「{}」", source_site.title, target_site.title));

        let source_libraries = self
            .libraries_with_reauth(ctx, TenantSide::Source, &source_domain, &pair.sourceUrl)
            .await?;
        let target_libraries = self
            .libraries_with_reauth(ctx, TenantSide::Target, &target_domain, &pair.targetUrl)
            .await?;

        // 源侧参与比对的文档库：模板匹配、未被排除、隐藏库按开关
        let source_libraries: Vec<LibraryInfo> = source_libraries
            .into_iter()
            .filter(|l| l.template == DOCUMENT_LIBRARY_TEMPLATE)
            .filter(|l| self.config.include_hidden_libraries || !l.hidden)
            .filter(|l| {
                let excluded = denylist.is_excluded(&l.title);
                if excluded {
                    debug!("库被排除: {}", l.title);
                }
                !excluded
            })
            .collect();

        let target_index: HashMap<String, LibraryInfo> = target_libraries
            .into_iter()
            .filter(|l| l.template == DOCUMENT_LIBRARY_TEMPLATE)
            .map(|l| (l.title.to_lowercase(), l))
            .collect();

        // 库清单之后不再有重认证点，客户端在整个库循环里复用
        let source_client = self.session_for(ctx, TenantSide::Source, &source_domain).await?;
        let target_client = self.session_for(ctx, TenantSide::Target, &target_domain).await?;

        let library_total = source_libraries.len();
        pair_result.log_line(format!("源站点共 {} 个参与比对的库", library_total));

        for (library_index, library) in source_libraries.iter().enumerate() {
            // 每个库抓取前检查取消
            if self.is_cancelled() {
                return Err(CancelledError.into());
            }

            let target_library = target_index.get(&library.title.to_lowercase());
            if let Some(reconciliation) = self
                .process_library(
                    pair,
                    library,
                    target_library,
                    source_client.clone(),
                    target_client.clone(),
                    &mut pair_result,
                )
                .await
            {
                pair_result.libraries.push(reconciliation);
            }

            // 每个库之后发一次进度；进度只是旁路观察，不影响运行
            self.send_progress(
                progress_tx,
                CompareProgress {
                    currentIndex: index + 1,
                    totalCount: total,
                    currentSiteUrl: pair.sourceUrl.clone(),
                    message: format!(
                        "库 {}/{} 处理完毕: {}",
                        library_index + 1,
                        library_total,
                        library.title
                    ),
                    completedPair: None,
                },
            )
            .await;
        }

        pair_result.success = true;
        pair_result.log_line("站点对比对完成");
        Ok(pair_result)
    }

    /// 处理一个库。返回 None 表示该库被跳过（抓取失败），不影响站点对的其余库
    async fn process_library(
        &self,
        pair: &SitePair,
        library: &LibraryInfo,
        target_library: Option<&LibraryInfo>,
        source_client: Arc<dyn CollectionClient>,
        target_client: Arc<dyn CollectionClient>,
        pair_result: &mut SitePairResult,
    ) -> Option<LibraryReconciliation> {
        let Some(target_library) = target_library else {
            // 目标站点没有同名库：源侧文档全部记为仅源侧，目标侧不发起抓取
            return match self
                .fetch_documents(source_client, &pair.sourceUrl, library)
                .await
            {
                Ok(source_docs) => {
                    let outcome =
                        matcher::reconcile(&source_docs, &[], self.config.use_fuzzy_fallback);
                    pair_result.log_line(format!(
                        "目标站点缺少库「{}」，{} 个文档记为仅源侧",
                        library.title,
                        outcome.records.len()
                    ));
                    Some(LibraryReconciliation::from_records(
                        library.title.clone(),
                        outcome.records,
                        outcome.duplicate_source_count,
                    ))
                }
                Err(e) => {
                    warn!("抓取源库文档失败，跳过该库: {} - {}", library.title, e);
                    pair_result.log_line(format!("库「{}」源侧抓取失败，跳过: {}", library.title, e));
                    None
                }
            };
        };

        // 两侧并发抓取，各自独立地可能命中缓存，汇合后再匹配
        let (source_result, target_result) = tokio::join!(
            self.fetch_documents(source_client, &pair.sourceUrl, library),
            self.fetch_documents(target_client, &pair.targetUrl, target_library)
        );

        let source_docs = match source_result {
            Ok(docs) => docs,
            Err(e) => {
                warn!("抓取源库文档失败，跳过该库: {} - {}", library.title, e);
                pair_result.log_line(format!("库「{}」源侧抓取失败，跳过: {}", library.title, e));
                return None;
            }
        };

        let target_docs = match target_result {
            Ok(docs) => docs,
            Err(RemoteError::LibraryNotFound(_)) => {
                // 枚举和抓取之间目标库被删：按数据结果处理，不算错误
                pair_result.log_line(format!(
                    "目标库「{}」抓取时已不存在，全部记为仅源侧",
                    library.title
                ));
                Vec::new()
            }
            Err(e) => {
                warn!("抓取目标库文档失败，跳过该库: {} - {}", library.title, e);
                pair_result.log_line(format!("库「{}」目标侧抓取失败，跳过: {}", library.title, e));
                return None;
            }
        };

        let outcome = matcher::reconcile(&source_docs, &target_docs, self.config.use_fuzzy_fallback);
        let reconciliation = LibraryReconciliation::from_records(
            library.title.clone(),
            outcome.records,
            outcome.duplicate_source_count,
        );
        if reconciliation.duplicateSourceCount > 0 {
            pair_result.log_line(format!(
                "库「{}」源侧去重 {} 条",
                library.title, reconciliation.duplicateSourceCount
            ));
        }
        pair_result.log_line(format!(
            "库「{}」比对完成: 找到 {}，大小存疑 {}，仅源侧 {}，仅目标侧 {}",
            library.title,
            reconciliation.foundCount,
            reconciliation.sizeIssueCount,
            reconciliation.sourceOnlyCount,
            reconciliation.targetOnlyCount
        ));

        Some(reconciliation)
    }

    /// 抓取一个库的文档清单，优先走快照缓存。
    /// 规范路径在抓取后立即计算；缓存命中时由缓存层重算
    async fn fetch_documents(
        &self,
        client: Arc<dyn CollectionClient>,
        site_url: &str,
        library: &LibraryInfo,
    ) -> Result<Vec<DocumentSnapshotItem>, RemoteError> {
        if self.config.cache_enabled {
            if let Some(documents) = self.cache.try_get(
                site_url,
                &library.title,
                &library.root_path,
                self.config.cache_ttl_hours,
            ) {
                return Ok(documents);
            }
        }

        let mut documents = client
            .documents(
                site_url,
                &library.title,
                self.config.include_special_pages,
                self.cancelled.clone(),
            )
            .await?;

        for doc in &mut documents {
            doc.canonicalRelativePath =
                canonical_relative_path(&doc.serverRelativePath, &library.root_path);
        }

        if self.config.cache_enabled {
            // 尽力而为，写失败不影响本次抓取
            self.cache
                .put(site_url, &library.title, &library.root_path, &documents);
        }

        Ok(documents)
    }

    /// 取（侧，域）的会话，没有就懒建。凭据缺失或过期时直接走重认证协议
    async fn session_for(
        &self,
        ctx: &mut RunContext,
        side: TenantSide,
        domain: &str,
    ) -> Result<Arc<dyn CollectionClient>> {
        if let Some(client) = ctx.session(side, domain) {
            return Ok(client);
        }

        let credentials = self
            .deps
            .credentials
            .get_credentials(domain)
            .filter(|c| c.is_valid());

        match credentials {
            Some(credentials) => {
                let client = self
                    .deps
                    .sessions
                    .open_session(&credentials, domain)
                    .await
                    .map_err(|e| anyhow!("建立{}侧会话失败 ({}): {}", side.label(), domain, e))?;
                ctx.store_session(side, domain, client.clone());
                info!("已建立{}侧会话: {}", side.label(), domain);
                Ok(client)
            }
            None => match self.request_reauth(ctx, side, domain).await {
                ReauthOutcome::Retry(client) => Ok(client),
                ReauthOutcome::Declined => {
                    bail!("{}侧 {} 凭据无效且用户拒绝重新认证", side.label(), domain)
                }
                ReauthOutcome::Unavailable => bail!("{}侧 {} 没有有效凭据", side.label(), domain),
            },
        }
    }

    /// 重认证协议。拒绝闩锁是每运行每侧一次的，防止反复打扰已拒绝的用户
    async fn request_reauth(
        &self,
        ctx: &mut RunContext,
        side: TenantSide,
        domain: &str,
    ) -> ReauthOutcome {
        if ctx.declined(side) {
            debug!("{}侧已拒绝过重认证，不再提示", side.label());
            return ReauthOutcome::Declined;
        }
        let Some(handler) = self.deps.reauth.as_ref() else {
            return ReauthOutcome::Unavailable;
        };

        let conn = ctx.connection(side).clone();
        info!("请求重新认证: {} ({})", conn.tenant_name, conn.tenant_domain);

        // 回调可能弹出交互式登录，挂起多久都正常
        match handler
            .reauthenticate(&conn.tenant_name, &conn.tenant_domain)
            .await
        {
            Some(credentials) => match self.deps.sessions.open_session(&credentials, domain).await {
                Ok(client) => {
                    // 丢弃旧会话，换上新会话
                    ctx.store_session(side, domain, client.clone());
                    info!("{}侧会话已更新: {}", side.label(), domain);
                    ReauthOutcome::Retry(client)
                }
                Err(e) => {
                    warn!("重新认证后建立会话失败: {}", e);
                    ReauthOutcome::Unavailable
                }
            },
            None => {
                info!("{}侧用户拒绝重新认证，本次运行不再提示", side.label());
                ctx.set_declined(side);
                ReauthOutcome::Declined
            }
        }
    }

    /// 带重认证重试的站点元数据抓取。重试恰好一次
    async fn site_info_with_reauth(
        &self,
        ctx: &mut RunContext,
        side: TenantSide,
        domain: &str,
        site_url: &str,
    ) -> Result<SiteInfo> {
        let client = self.session_for(ctx, side, domain).await?;
        match client.site_info(site_url).await {
            Ok(info) => Ok(info),
            Err(e) if e.is_auth_failure() => {
                warn!("{}侧认证失败: {}", side.label(), e);
                match self.request_reauth(ctx, side, domain).await {
                    ReauthOutcome::Retry(new_client) => Ok(new_client.site_info(site_url).await?),
                    ReauthOutcome::Declined | ReauthOutcome::Unavailable => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 带重认证重试的库清单抓取。重试恰好一次
    async fn libraries_with_reauth(
        &self,
        ctx: &mut RunContext,
        side: TenantSide,
        domain: &str,
        site_url: &str,
    ) -> Result<Vec<LibraryInfo>> {
        let include_hidden = self.config.include_hidden_libraries;
        let client = self.session_for(ctx, side, domain).await?;
        match client.libraries(site_url, include_hidden).await {
            Ok(libraries) => Ok(libraries),
            Err(e) if e.is_auth_failure() => {
                warn!("{}侧认证失败: {}", side.label(), e);
                match self.request_reauth(ctx, side, domain).await {
                    ReauthOutcome::Retry(new_client) => {
                        Ok(new_client.libraries(site_url, include_hidden).await?)
                    }
                    ReauthOutcome::Declined | ReauthOutcome::Unavailable => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 发送进度事件。进度是旁路观察，发送失败不阻塞运行
    async fn send_progress(
        &self,
        tx: &Option<mpsc::Sender<CompareProgress>>,
        progress: CompareProgress,
    ) {
        if let Some(tx) = tx {
            let _ = tx.send(progress).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{
        doc_at, library, CountingReauth, TestEnv,
    };
    use crate::models::{ComparisonStatus, ItemKind};
    use chrono::Utc;

    fn data_dir() -> PathBuf {
        std::env::temp_dir().join(format!("migratecheck-engine-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_host_of() {
        assert_eq!(
            host_of("https://Src.Example.com/sites/a").unwrap(),
            "src.example.com"
        );
        assert!(host_of("not a url").is_err());
    }

    #[tokio::test]
    async fn test_end_to_end_size_issue() {
        let env = TestEnv::new();
        env.add_site("https://src.example.com/sites/a", "源站点");
        env.add_site("https://dst.example.com/sites/a", "目标站点");
        env.add_library("https://src.example.com/sites/a", library("Docs", "/sites/a/Docs"));
        env.add_library("https://dst.example.com/sites/a", library("Docs", "/sites/a/Docs"));
        let t0 = Utc::now();
        env.add_document(
            "https://src.example.com/sites/a",
            "Docs",
            doc_at(1, "/sites/a/Docs/x.txt", 1000, Some(t0)),
        );
        env.add_document(
            "https://dst.example.com/sites/a",
            "Docs",
            doc_at(2, "/sites/a/Docs/x.txt", 0, Some(t0)),
        );

        let engine = CompareEngine::new(env.config(), env.deps(), data_dir());
        let result = engine.run(None).await;

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.successCount, 1);
        assert_eq!(result.failureCount, 0);

        let records = &result.pairResults[0].libraries[0].records;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ComparisonStatus::SizeIssue);
        assert!(records[0].hasSizeIssue);
        assert!(!records[0].isNewerAtSource);
        assert_eq!(records[0].itemKind, ItemKind::File);
    }

    #[tokio::test]
    async fn test_missing_target_library_is_source_only_without_fetch() {
        let env = TestEnv::new();
        env.add_site("https://src.example.com/sites/a", "源站点");
        env.add_site("https://dst.example.com/sites/a", "目标站点");
        env.add_library("https://src.example.com/sites/a", library("Docs", "/sites/a/Docs"));
        // 目标站点没有 Docs 库
        env.add_document(
            "https://src.example.com/sites/a",
            "Docs",
            doc_at(1, "/sites/a/Docs/x.txt", 100, None),
        );

        let engine = CompareEngine::new(env.config(), env.deps(), data_dir());
        let result = engine.run(None).await;

        assert_eq!(result.status, RunStatus::Completed);
        let records = &result.pairResults[0].libraries[0].records;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ComparisonStatus::SourceOnly);
        // 目标侧从未发起文档抓取
        assert_eq!(env.fetch_count("https://dst.example.com/sites/a", "Docs"), 0);
    }

    #[tokio::test]
    async fn test_excluded_library_not_fetched() {
        let env = TestEnv::new();
        env.add_site("https://src.example.com/sites/a", "源站点");
        env.add_site("https://dst.example.com/sites/a", "目标站点");
        env.add_library(
            "https://src.example.com/sites/a",
            library("Style Library", "/sites/a/Style Library"),
        );
        env.add_library(
            "https://dst.example.com/sites/a",
            library("Style Library", "/sites/a/Style Library"),
        );

        let engine = CompareEngine::new(env.config(), env.deps(), data_dir());
        let result = engine.run(None).await;

        assert_eq!(result.status, RunStatus::Completed);
        assert!(result.pairResults[0].libraries.is_empty());
        assert_eq!(env.fetch_count("https://src.example.com/sites/a", "Style Library"), 0);
    }

    #[tokio::test]
    async fn test_pair_failure_is_isolated() {
        let env = TestEnv::new();
        // 第一个站点对的源站点不存在，第二个正常
        env.add_site("https://src.example.com/sites/b", "源B");
        env.add_site("https://dst.example.com/sites/b", "目标B");
        env.add_library("https://src.example.com/sites/b", library("Docs", "/sites/b/Docs"));
        env.add_library("https://dst.example.com/sites/b", library("Docs", "/sites/b/Docs"));

        let mut config = env.config();
        config.site_pairs = vec![
            crate::models::SitePair {
                sourceUrl: "https://src.example.com/sites/missing".to_string(),
                targetUrl: "https://dst.example.com/sites/missing".to_string(),
            },
            crate::models::SitePair {
                sourceUrl: "https://src.example.com/sites/b".to_string(),
                targetUrl: "https://dst.example.com/sites/b".to_string(),
            },
        ];

        let engine = CompareEngine::new(config, env.deps(), data_dir());
        let result = engine.run(None).await;

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.failureCount, 1);
        assert_eq!(result.successCount, 1);
        assert!(!result.pairResults[0].success);
        assert!(result.pairResults[0].error.is_some());
        assert!(result.pairResults[1].success);
    }

    #[tokio::test]
    async fn test_unresolvable_connection_fails_run() {
        let env = TestEnv::new();
        let mut config = env.config();
        config.source_connection_id = "不存在的连接".to_string();

        let engine = CompareEngine::new(config, env.deps(), data_dir());
        let result = engine.run(None).await;

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.pairResults.is_empty());
        assert!(result.completedAt.is_some());
    }

    #[tokio::test]
    async fn test_cancellation_preserves_partial_result() {
        let env = TestEnv::new();
        env.add_site("https://src.example.com/sites/a", "源站点");
        env.add_site("https://dst.example.com/sites/a", "目标站点");

        let dir = data_dir();
        let engine = CompareEngine::new(env.config(), env.deps(), dir.clone());
        engine.cancel();
        let result = engine.run(None).await;

        assert_eq!(result.status, RunStatus::Cancelled);
        assert!(result.pairResults.is_empty());
        assert!(result.completedAt.is_some());
        // 取消的运行同样被持久化
        let loaded = engine.store().load_latest(&result.taskId).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_reauth_retries_failed_call_once() {
        let env = TestEnv::new();
        env.add_site("https://src.example.com/sites/a", "源站点");
        env.add_site("https://dst.example.com/sites/a", "目标站点");
        env.add_library("https://src.example.com/sites/a", library("Docs", "/sites/a/Docs"));
        env.add_library("https://dst.example.com/sites/a", library("Docs", "/sites/a/Docs"));

        // 源域的已存凭据对应的 cookie 已在服务端失效；重认证给出新 cookie
        env.invalidate_cookie("cookie-src.example.com");
        let reauth = Arc::new(CountingReauth::granting(env.fresh_credentials("src.example.com")));
        let mut deps = env.deps();
        deps.reauth = Some(reauth.clone());

        let engine = CompareEngine::new(env.config(), deps, data_dir());
        let result = engine.run(None).await;

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.successCount, 1);
        assert_eq!(reauth.calls(), 1);
    }

    #[tokio::test]
    async fn test_reauth_declined_latch_prompts_once_per_side() {
        let env = TestEnv::new();
        env.add_site("https://src.example.com/sites/a", "源站点");
        env.add_site("https://dst.example.com/sites/a", "目标站点");
        env.add_site("https://src.example.com/sites/b", "源B");
        env.add_site("https://dst.example.com/sites/b", "目标B");

        env.invalidate_cookie("cookie-src.example.com");
        let reauth = Arc::new(CountingReauth::declining());
        let mut deps = env.deps();
        deps.reauth = Some(reauth.clone());

        let mut config = env.config();
        config.site_pairs.push(crate::models::SitePair {
            sourceUrl: "https://src.example.com/sites/b".to_string(),
            targetUrl: "https://dst.example.com/sites/b".to_string(),
        });

        let engine = CompareEngine::new(config, deps, data_dir());
        let result = engine.run(None).await;

        // 两个站点对都因源侧认证失败而失败，但只提示了一次
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.failureCount, 2);
        assert_eq!(reauth.calls(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_cache_avoids_second_fetch() {
        let env = TestEnv::new();
        env.add_site("https://src.example.com/sites/a", "源站点");
        env.add_site("https://dst.example.com/sites/a", "目标站点");
        env.add_library("https://src.example.com/sites/a", library("Docs", "/sites/a/Docs"));
        env.add_library("https://dst.example.com/sites/a", library("Docs", "/sites/a/Docs"));
        env.add_document(
            "https://src.example.com/sites/a",
            "Docs",
            doc_at(1, "/sites/a/Docs/x.txt", 100, None),
        );
        env.add_document(
            "https://dst.example.com/sites/a",
            "Docs",
            doc_at(2, "/sites/a/Docs/x.txt", 100, None),
        );

        let dir = data_dir();
        let engine = CompareEngine::new(env.config(), env.deps(), dir.clone());
        engine.run(None).await;
        assert_eq!(env.fetch_count("https://src.example.com/sites/a", "Docs"), 1);

        // 第二次运行命中缓存，不再发起远程枚举
        let engine = CompareEngine::new(env.config(), env.deps(), dir);
        let result = engine.run(None).await;
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(env.fetch_count("https://src.example.com/sites/a", "Docs"), 1);
        assert_eq!(env.fetch_count("https://dst.example.com/sites/a", "Docs"), 1);
    }

    #[tokio::test]
    async fn test_newer_at_source_end_to_end() {
        let env = TestEnv::new();
        env.add_site("https://src.example.com/sites/a", "源站点");
        env.add_site("https://dst.example.com/sites/a", "目标站点");
        env.add_library("https://src.example.com/sites/a", library("Docs", "/sites/a/Docs"));
        env.add_library("https://dst.example.com/sites/a", library("Docs", "/sites/a/Docs"));
        let t0 = Utc::now();
        env.add_document(
            "https://src.example.com/sites/a",
            "Docs",
            doc_at(1, "/sites/a/Docs/old.txt", 100, Some(t0)),
        );
        env.add_document(
            "https://dst.example.com/sites/a",
            "Docs",
            doc_at(2, "/sites/a/Docs/old.txt", 100, Some(t0 - chrono::Duration::hours(30))),
        );

        let engine = CompareEngine::new(env.config(), env.deps(), data_dir());
        let result = engine.run(None).await;

        let records = &result.pairResults[0].libraries[0].records;
        assert_eq!(records[0].status, ComparisonStatus::Found);
        assert!(records[0].isNewerAtSource);
    }
}
