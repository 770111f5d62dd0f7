// 对象存储接口
//
// 上传引擎只依赖这一层窄接口：
// - put_object：上传单个对象（分片暂存或小文件直传），同一 key 重复上传即覆盖
// - finalize_multipart：所有分片完成后提升到最终路径
// - delete_objects：清理暂存分片 / 取消后的回滚
// - public_url / create_signed_url：生成访问地址

pub mod http;
pub mod local;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use http::SupabaseStorage;
pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;

/// 上传错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 网络错误（可重试）
    Network,
    /// 超时（可重试）
    Timeout,
    /// 服务器错误（可重试）
    ServerError,
    /// 限流（可重试，需要更长等待时间）
    RateLimited,
    /// 对象不存在（不可重试）
    FileNotFound,
    /// 权限不足（不可重试）
    Forbidden,
    /// 参数错误（不可重试）
    BadRequest,
    /// 空间不足（不可重试）
    QuotaExceeded,
    /// 请求体过大（不可重试）
    PayloadTooLarge,
    /// 未知错误
    Unknown,
}

impl ErrorKind {
    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::ServerError | ErrorKind::RateLimited
        )
    }

    /// 从 HTTP 状态码转换
    pub fn from_status(status: u16) -> Self {
        match status {
            408 | 504 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimited,
            401 | 403 => ErrorKind::Forbidden,
            404 => ErrorKind::FileNotFound,
            413 => ErrorKind::PayloadTooLarge,
            507 => ErrorKind::QuotaExceeded,
            400..=499 => ErrorKind::BadRequest,
            500..=599 => ErrorKind::ServerError,
            _ => ErrorKind::Unknown,
        }
    }
}

/// 对象存储错误
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct StoreError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FileNotFound, message)
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::Forbidden,
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            std::io::ErrorKind::InvalidInput => ErrorKind::BadRequest,
            _ => ErrorKind::ServerError,
        };
        Self::new(kind, e.to_string())
    }
}

/// 存储操作结果
pub type StoreResult<T> = Result<T, StoreError>;

/// 暂存分片的 key 前缀
pub const STAGING_PREFIX: &str = ".staging/";

/// 上传选项
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
}

impl PutOptions {
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            cache_control: None,
        }
    }
}

/// 上传回执
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutReceipt {
    /// etag / 提交令牌（存储不返回时为 None）
    pub etag: Option<String>,
}

/// 已提交的分片（用于合并）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedPart {
    pub index: usize,
    pub staging_key: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// 对象存储
///
/// 实现方必须保证 `put_object` 对同一 key 是覆盖语义，分片重试才是幂等的。
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        options: &PutOptions,
    ) -> StoreResult<PutReceipt>;

    /// 合并分片到最终 key
    ///
    /// `parts` 按分片索引升序传入
    async fn finalize_multipart(
        &self,
        bucket: &str,
        key: &str,
        parts: &[CommittedPart],
        options: &PutOptions,
    ) -> StoreResult<()>;

    /// 删除对象
    ///
    /// 删除合并后的对象时，它引用的暂存分片（如果存储保留了分片）必须一并删除
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> StoreResult<()>;

    fn public_url(&self, bucket: &str, key: &str) -> String;

    async fn create_signed_url(&self, bucket: &str, key: &str, ttl: Duration)
        -> StoreResult<String>;
}

/// 对象路径编码（保留 `/` 分隔符）
pub(crate) fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
