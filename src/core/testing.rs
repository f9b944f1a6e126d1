//! 编排器与续传测试共用的内存协作方替身

use crate::config::CompareConfig;
use crate::core::orchestrator::EngineDeps;
use crate::models::{DocumentSnapshotItem, ItemKind, SitePair};
use crate::remote::{
    CollectionClient, ConnectionConfig, ConnectionRegistry, CredentialStore, Credentials,
    LibraryInfo, ReauthHandler, RemoteError, SessionProvider, SiteInfo,
    DOCUMENT_LIBRARY_TEMPLATE,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// 构造一个参与比对的标准文档库
pub fn library(title: &str, root_path: &str) -> LibraryInfo {
    LibraryInfo {
        title: title.to_string(),
        root_path: root_path.to_string(),
        template: DOCUMENT_LIBRARY_TEMPLATE,
        hidden: false,
        item_count: 0,
    }
}

/// 构造一个文件快照条目。规范路径留空，由引擎在抓取后计算
pub fn doc_at(
    id: i64,
    server_relative: &str,
    size: u64,
    modified: Option<DateTime<Utc>>,
) -> DocumentSnapshotItem {
    DocumentSnapshotItem {
        id,
        fileName: server_relative
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string(),
        serverRelativePath: server_relative.to_string(),
        canonicalRelativePath: String::new(),
        sizeBytes: size,
        versionCount: 1,
        itemKind: ItemKind::File,
        created: None,
        modified,
    }
}

/// 内存中的远程世界：站点、库、文档，以及被服务端吊销的 cookie
#[derive(Default)]
struct RemoteState {
    /// 站点地址 -> 站点标题
    sites: HashMap<String, String>,
    /// 站点地址 -> 库清单
    libraries: HashMap<String, Vec<LibraryInfo>>,
    /// （站点地址，库标题）-> 文档清单
    documents: HashMap<(String, String), Vec<DocumentSnapshotItem>>,
    /// 每个（站点地址，库标题）被远程枚举的次数
    fetch_counts: HashMap<(String, String), usize>,
    /// 已失效的会话 cookie，带着它们的调用一律返回认证失败
    dead_cookies: HashSet<String>,
}

/// 测试环境：一套共享内存状态加上从它构造的全部协作方替身
pub struct TestEnv {
    state: Arc<Mutex<RemoteState>>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RemoteState::default())),
        }
    }

    pub fn add_site(&self, url: &str, title: &str) {
        self.state
            .lock()
            .unwrap()
            .sites
            .insert(url.to_string(), title.to_string());
    }

    pub fn add_library(&self, site_url: &str, library: LibraryInfo) {
        self.state
            .lock()
            .unwrap()
            .libraries
            .entry(site_url.to_string())
            .or_default()
            .push(library);
    }

    pub fn add_document(&self, site_url: &str, library_title: &str, doc: DocumentSnapshotItem) {
        self.state
            .lock()
            .unwrap()
            .documents
            .entry((site_url.to_string(), library_title.to_string()))
            .or_default()
            .push(doc);
    }

    /// 某个库被远程枚举过几次（缓存命中不计入）
    pub fn fetch_count(&self, site_url: &str, library_title: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .fetch_counts
            .get(&(site_url.to_string(), library_title.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// 把一个会话 cookie 标记为已在服务端失效
    pub fn invalidate_cookie(&self, cookie: &str) {
        self.state
            .lock()
            .unwrap()
            .dead_cookies
            .insert(cookie.to_string());
    }

    /// 一份服务端认可的新凭据，重认证测试用
    pub fn fresh_credentials(&self, domain: &str) -> Credentials {
        Credentials {
            domain: domain.to_string(),
            auth_cookie: format!("fresh-{}", domain),
            expires_at: None,
        }
    }

    /// 默认配置：一个站点对，模糊回退和缓存都开
    pub fn config(&self) -> CompareConfig {
        CompareConfig {
            task_id: "task-1".to_string(),
            source_connection_id: "src-conn".to_string(),
            target_connection_id: "dst-conn".to_string(),
            site_pairs: vec![SitePair {
                sourceUrl: "https://src.example.com/sites/a".to_string(),
                targetUrl: "https://dst.example.com/sites/a".to_string(),
            }],
            excluded_libraries: vec![],
            include_hidden_libraries: false,
            include_special_pages: false,
            use_fuzzy_fallback: true,
            cache_enabled: true,
            cache_ttl_hours: 48,
        }
    }

    pub fn deps(&self) -> EngineDeps {
        EngineDeps {
            credentials: Arc::new(FakeCredentialStore),
            connections: Arc::new(FakeRegistry),
            sessions: Arc::new(FakeSessionProvider {
                state: self.state.clone(),
            }),
            reauth: None,
        }
    }
}

/// 凭据库替身：每个域都有一份形如 `cookie-{域}` 的已存凭据
struct FakeCredentialStore;

impl CredentialStore for FakeCredentialStore {
    fn get_credentials(&self, domain: &str) -> Option<Credentials> {
        Some(Credentials {
            domain: domain.to_string(),
            auth_cookie: format!("cookie-{}", domain),
            expires_at: None,
        })
    }

    fn domains(&self) -> Vec<String> {
        vec!["src.example.com".to_string(), "dst.example.com".to_string()]
    }
}

/// 连接注册表替身，只认识两个固定连接
struct FakeRegistry;

impl ConnectionRegistry for FakeRegistry {
    fn get_connection(&self, connection_id: &str) -> Option<ConnectionConfig> {
        match connection_id {
            "src-conn" => Some(ConnectionConfig {
                id: "src-conn".to_string(),
                tenant_name: "源租户".to_string(),
                tenant_domain: "src.example.com".to_string(),
            }),
            "dst-conn" => Some(ConnectionConfig {
                id: "dst-conn".to_string(),
                tenant_name: "目标租户".to_string(),
                tenant_domain: "dst.example.com".to_string(),
            }),
            _ => None,
        }
    }
}

struct FakeSessionProvider {
    state: Arc<Mutex<RemoteState>>,
}

#[async_trait]
impl SessionProvider for FakeSessionProvider {
    async fn open_session(
        &self,
        credentials: &Credentials,
        _domain: &str,
    ) -> Result<Arc<dyn CollectionClient>, RemoteError> {
        Ok(Arc::new(FakeClient {
            state: self.state.clone(),
            cookie: credentials.auth_cookie.clone(),
        }))
    }
}

/// 远程客户端替身。持有会话 cookie，每次调用时检查它是否已被吊销，
/// 模拟运行中途的凭据过期
struct FakeClient {
    state: Arc<Mutex<RemoteState>>,
    cookie: String,
}

impl FakeClient {
    fn check_auth(&self, state: &RemoteState) -> Result<(), RemoteError> {
        if state.dead_cookies.contains(&self.cookie) {
            Err(RemoteError::Unauthorized(format!(
                "会话已失效: {}",
                self.cookie
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CollectionClient for FakeClient {
    async fn site_info(&self, site_url: &str) -> Result<SiteInfo, RemoteError> {
        let state = self.state.lock().unwrap();
        self.check_auth(&state)?;
        match state.sites.get(site_url) {
            Some(title) => Ok(SiteInfo {
                url: site_url.to_string(),
                title: title.clone(),
            }),
            None => Err(RemoteError::SiteNotFound(site_url.to_string())),
        }
    }

    async fn libraries(
        &self,
        site_url: &str,
        include_hidden: bool,
    ) -> Result<Vec<LibraryInfo>, RemoteError> {
        let state = self.state.lock().unwrap();
        self.check_auth(&state)?;
        if !state.sites.contains_key(site_url) {
            return Err(RemoteError::SiteNotFound(site_url.to_string()));
        }
        let libraries = state
            .libraries
            .get(site_url)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|l| include_hidden || !l.hidden)
            .collect();
        Ok(libraries)
    }

    async fn documents(
        &self,
        site_url: &str,
        library_title: &str,
        _include_special_pages: bool,
        _cancelled: Arc<AtomicBool>,
    ) -> Result<Vec<DocumentSnapshotItem>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        self.check_auth(&state)?;

        let key = (site_url.to_string(), library_title.to_string());
        *state.fetch_counts.entry(key.clone()).or_insert(0) += 1;

        let has_library = state
            .libraries
            .get(site_url)
            .map(|libs| libs.iter().any(|l| l.title == library_title))
            .unwrap_or(false);
        if !has_library {
            return Err(RemoteError::LibraryNotFound(library_title.to_string()));
        }

        Ok(state.documents.get(&key).cloned().unwrap_or_default())
    }
}

/// 重认证回调替身：记录被调用的次数，按构造方式给出或拒绝新凭据
pub struct CountingReauth {
    grant: Option<Credentials>,
    calls: AtomicUsize,
}

impl CountingReauth {
    pub fn granting(credentials: Credentials) -> Self {
        Self {
            grant: Some(credentials),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn declining() -> Self {
        Self {
            grant: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReauthHandler for CountingReauth {
    async fn reauthenticate(&self, _tenant_name: &str, _tenant_domain: &str) -> Option<Credentials> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.grant.clone()
    }
}
