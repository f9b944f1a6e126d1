//! 远程协作方契约
//!
//! 凭据库、连接注册表、远程集合客户端、重认证回调都是外部实现，
//! 核对引擎只消费这里定义的接口。

use crate::models::DocumentSnapshotItem;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use thiserror::Error;

/// 文档库的平台模板标记，只有这种模板的容器才参与核对
pub const DOCUMENT_LIBRARY_TEMPLATE: u32 = 101;

/// 某个域的会话凭据
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub domain: String,
    pub auth_cookie: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    /// 凭据是否仍然有效（非空且未过期）
    pub fn is_valid(&self) -> bool {
        if self.auth_cookie.is_empty() {
            return false;
        }
        match self.expires_at {
            Some(expires) => expires > Utc::now(),
            None => true,
        }
    }
}

/// 逻辑租户连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub id: String,
    pub tenant_name: String,
    pub tenant_domain: String,
}

/// 站点元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteInfo {
    pub url: String,
    pub title: String,
}

/// 文档库元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryInfo {
    pub title: String,
    /// 库根目录的服务器相对路径，规范路径以此为基准
    pub root_path: String,
    pub template: u32,
    pub hidden: bool,
    pub item_count: u32,
}

/// 远程调用错误
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("凭据无效或已过期: {0}")]
    Unauthorized(String),
    #[error("站点不存在: {0}")]
    SiteNotFound(String),
    #[error("库不存在: {0}")]
    LibraryNotFound(String),
    #[error("操作已取消")]
    Cancelled,
    #[error("远程调用失败: {0}")]
    Other(String),
}

impl RemoteError {
    /// 是否属于认证失败，用于触发重认证协议。
    /// 除了类型化的 Unauthorized，还对消息做关键字识别，
    /// 因为部分后端只在错误文本里体现凭据过期。
    pub fn is_auth_failure(&self) -> bool {
        match self {
            RemoteError::Unauthorized(_) => true,
            RemoteError::Other(message) => {
                let lower = message.to_lowercase();
                lower.contains("401")
                    || lower.contains("unauthorized")
                    || lower.contains("expired")
                    || lower.contains("invalid credentials")
            }
            _ => false,
        }
    }
}

/// 凭据库：按域查询已保存的凭据
pub trait CredentialStore: Send + Sync {
    fn get_credentials(&self, domain: &str) -> Option<Credentials>;
    fn domains(&self) -> Vec<String>;
}

/// 连接注册表：把逻辑连接标识解析为租户配置
pub trait ConnectionRegistry: Send + Sync {
    fn get_connection(&self, connection_id: &str) -> Option<ConnectionConfig>;
}

/// 远程集合客户端，按（凭据，域）构造
#[async_trait]
pub trait CollectionClient: Send + Sync {
    async fn site_info(&self, site_url: &str) -> Result<SiteInfo, RemoteError>;

    async fn libraries(
        &self,
        site_url: &str,
        include_hidden: bool,
    ) -> Result<Vec<LibraryInfo>, RemoteError>;

    /// 枚举一个库的全部文档。枚举可能很长，需要响应取消信号
    async fn documents(
        &self,
        site_url: &str,
        library_title: &str,
        include_special_pages: bool,
        cancelled: Arc<AtomicBool>,
    ) -> Result<Vec<DocumentSnapshotItem>, RemoteError>;
}

/// 会话提供方：用凭据换取远程客户端
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn open_session(
        &self,
        credentials: &Credentials,
        domain: &str,
    ) -> Result<Arc<dyn CollectionClient>, RemoteError>;
}

/// 重认证回调。可能弹出交互式登录，挂起时间不可预期；
/// 返回 None 表示用户拒绝
#[async_trait]
pub trait ReauthHandler: Send + Sync {
    async fn reauthenticate(&self, tenant_name: &str, tenant_domain: &str) -> Option<Credentials>;
}

/// 重认证协议的结果，由编排器的状态机消费
pub enum ReauthOutcome {
    /// 拿到了新会话，失败的那一次调用可以重试一次
    Retry(Arc<dyn CollectionClient>),
    /// 用户拒绝，本侧本次运行不再提示
    Declined,
    /// 没有配置重认证回调，或换取会话失败
    Unavailable,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_credentials_validity() {
        let valid = Credentials {
            domain: "contoso.example.com".to_string(),
            auth_cookie: "cookie".to_string(),
            expires_at: Some(Utc::now() + Duration::hours(1)),
        };
        assert!(valid.is_valid());

        let expired = Credentials {
            expires_at: Some(Utc::now() - Duration::hours(1)),
            ..valid.clone()
        };
        assert!(!expired.is_valid());

        let empty = Credentials {
            auth_cookie: String::new(),
            ..valid
        };
        assert!(!empty.is_valid());
    }

    #[test]
    fn test_auth_failure_classification() {
        assert!(RemoteError::Unauthorized("x".into()).is_auth_failure());
        assert!(RemoteError::Other("HTTP 401 Unauthorized".into()).is_auth_failure());
        assert!(RemoteError::Other("token expired".into()).is_auth_failure());
        assert!(!RemoteError::Other("connection reset".into()).is_auth_failure());
        assert!(!RemoteError::LibraryNotFound("Docs".into()).is_auth_failure());
    }
}
