// 配置管理模块

pub mod buckets;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

pub use buckets::{BucketConfig, BucketRegistry};

use crate::uploader::UploadSettings;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 图片压缩配置
    #[serde(default)]
    pub compression: CompressionConfig,
    /// 存储后端配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 逻辑存储桶 -> 物理桶
    #[serde(default = "buckets::default_buckets")]
    pub buckets: BTreeMap<String, BucketConfig>,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            upload: UploadConfig::default(),
            compression: CompressionConfig::default(),
            storage: StorageConfig::default(),
            buckets: buckets::default_buckets(),
            log: LogConfig::default(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadConfig {
    /// 分片大小（字节，默认 5MB）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// 最大文件大小（字节，默认 50MB）
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// 最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 初始退避延迟（毫秒）
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// 最大退避延迟（毫秒）
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// 单个文件最大并发分片数
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
    /// 单次请求超时下限（秒）
    #[serde(default = "default_attempt_timeout_floor_secs")]
    pub attempt_timeout_floor_secs: u64,
    /// 估算超时用的带宽下限（KB/s）
    #[serde(default = "default_bandwidth_floor_kbps")]
    pub bandwidth_floor_kbps: u64,
    /// 超时倍数
    #[serde(default = "default_timeout_multiplier")]
    pub timeout_multiplier: u32,
    /// 进度事件节流间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// 签名地址有效期（秒）
    #[serde(default = "default_signed_url_ttl_secs")]
    pub signed_url_ttl_secs: u64,
    #[serde(default = "crate::uploader::default_image_types")]
    pub allowed_image_types: Vec<String>,
    #[serde(default = "crate::uploader::default_video_types")]
    pub allowed_video_types: Vec<String>,
}

fn default_chunk_size() -> u64 {
    crate::uploader::DEFAULT_CHUNK_SIZE
}
fn default_max_file_size() -> u64 {
    crate::uploader::DEFAULT_MAX_FILE_SIZE
}
fn default_max_retries() -> u32 {
    crate::uploader::retry::DEFAULT_MAX_RETRIES
}
fn default_retry_base_delay_ms() -> u64 {
    crate::uploader::retry::DEFAULT_BASE_DELAY_MS
}
fn default_retry_max_delay_ms() -> u64 {
    crate::uploader::retry::DEFAULT_MAX_DELAY_MS
}
fn default_max_concurrent_uploads() -> usize {
    crate::uploader::DEFAULT_MAX_CONCURRENT_UPLOADS
}
fn default_attempt_timeout_floor_secs() -> u64 {
    10
}
fn default_bandwidth_floor_kbps() -> u64 {
    crate::uploader::DEFAULT_BANDWIDTH_FLOOR / 1024
}
fn default_timeout_multiplier() -> u32 {
    3
}
fn default_progress_interval_ms() -> u64 {
    crate::uploader::progress::DEFAULT_THROTTLE_INTERVAL_MS
}
fn default_signed_url_ttl_secs() -> u64 {
    3600
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_file_size: default_max_file_size(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
            attempt_timeout_floor_secs: default_attempt_timeout_floor_secs(),
            bandwidth_floor_kbps: default_bandwidth_floor_kbps(),
            timeout_multiplier: default_timeout_multiplier(),
            progress_interval_ms: default_progress_interval_ms(),
            signed_url_ttl_secs: default_signed_url_ttl_secs(),
            allowed_image_types: crate::uploader::default_image_types(),
            allowed_video_types: crate::uploader::default_video_types(),
        }
    }
}

/// 图片压缩配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressionConfig {
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    #[serde(default = "default_max_height")]
    pub max_height: u32,
    /// 压缩质量 (0, 1]
    #[serde(default = "default_quality")]
    pub quality: f32,
    /// 缩略图最长边（像素）
    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,
    #[serde(default = "default_thumbnail_quality")]
    pub thumbnail_quality: f32,
}

fn default_max_width() -> u32 {
    1920
}
fn default_max_height() -> u32 {
    1080
}
fn default_quality() -> f32 {
    0.85
}
fn default_thumbnail_size() -> u32 {
    400
}
fn default_thumbnail_quality() -> f32 {
    0.7
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_width: default_max_width(),
            max_height: default_max_height(),
            quality: default_quality(),
            thumbnail_size: default_thumbnail_size(),
            thumbnail_quality: default_thumbnail_quality(),
        }
    }
}

/// 存储后端
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// 本地文件系统
    #[default]
    Local,
    /// Supabase Storage REST API
    Supabase,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// 本地存储根目录
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,
    /// 本地存储的公开地址前缀
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_base_url: Option<String>,
    /// 可被 SUPABASE_URL 覆盖
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supabase_url: Option<String>,
    /// 可被 SUPABASE_ANON_KEY 覆盖
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supabase_key: Option<String>,
}

fn default_local_root() -> PathBuf {
    PathBuf::from("storage")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            local_root: default_local_root(),
            public_base_url: None,
            supabase_url: None,
            supabase_key: None,
        }
    }
}

impl AppConfig {
    /// 从文件加载配置（应用环境变量覆盖并校验）
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let mut config: AppConfig =
            toml::from_str(&content).context("Failed to parse config file")?;
        config.apply_env_overrides();
        config.validate().context("配置校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let mut default_config = Self::default();

                // 首次启动：写出默认配置
                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config.apply_env_overrides();
                default_config
            }
        }
    }

    /// 环境变量覆盖存储凭据
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(url) = non_empty("SUPABASE_URL") {
            self.storage.supabase_url = Some(url);
        }
        if let Some(key) = non_empty("SUPABASE_ANON_KEY") {
            self.storage.supabase_key = Some(key);
        }
    }

    /// 校验各项限制
    pub fn validate(&self) -> Result<()> {
        let upload = &self.upload;
        anyhow::ensure!(upload.chunk_size > 0, "chunk_size 必须大于 0");
        anyhow::ensure!(
            upload.max_file_size >= upload.chunk_size,
            "max_file_size ({}) 不能小于 chunk_size ({})",
            upload.max_file_size,
            upload.chunk_size
        );
        anyhow::ensure!(
            upload.max_concurrent_uploads >= 1,
            "max_concurrent_uploads 至少为 1"
        );
        anyhow::ensure!(upload.bandwidth_floor_kbps > 0, "bandwidth_floor_kbps 必须大于 0");

        let compression = &self.compression;
        for (name, quality) in [
            ("quality", compression.quality),
            ("thumbnail_quality", compression.thumbnail_quality),
        ] {
            anyhow::ensure!(
                quality > 0.0 && quality <= 1.0,
                "{} 必须在 (0, 1] 范围内: {}",
                name,
                quality
            );
        }
        anyhow::ensure!(
            compression.max_width > 0 && compression.max_height > 0 && compression.thumbnail_size > 0,
            "压缩尺寸必须大于 0"
        );

        for (key, bucket) in &self.buckets {
            anyhow::ensure!(!bucket.name.trim().is_empty(), "存储桶 {} 的名称为空", key);
        }

        if self.storage.backend == StorageBackend::Supabase {
            anyhow::ensure!(
                self.storage.supabase_url.is_some() && self.storage.supabase_key.is_some(),
                "supabase 后端需要 supabase_url 和 supabase_key（或 SUPABASE_URL / SUPABASE_ANON_KEY）"
            );
        }
        Ok(())
    }

    /// 生成注入上传服务的参数
    pub fn upload_settings(&self) -> UploadSettings {
        let upload = &self.upload;
        let compression = &self.compression;
        UploadSettings {
            chunk_size: upload.chunk_size,
            max_file_size: upload.max_file_size,
            max_retries: upload.max_retries,
            retry_base_delay: Duration::from_millis(upload.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(upload.retry_max_delay_ms),
            max_concurrent_uploads: upload.max_concurrent_uploads,
            max_width: compression.max_width,
            max_height: compression.max_height,
            quality: compression.quality,
            thumbnail_size: compression.thumbnail_size,
            thumbnail_quality: compression.thumbnail_quality,
            allowed_image_types: normalize_types(&upload.allowed_image_types),
            allowed_video_types: normalize_types(&upload.allowed_video_types),
            attempt_timeout_floor: Duration::from_secs(upload.attempt_timeout_floor_secs),
            bandwidth_floor: upload.bandwidth_floor_kbps * 1024,
            timeout_multiplier: upload.timeout_multiplier,
            progress_interval: Duration::from_millis(upload.progress_interval_ms),
            signed_url_ttl: Duration::from_secs(upload.signed_url_ttl_secs),
        }
    }

    /// 存储桶注册表（应用 STORAGE_BUCKET_<KEY> 覆盖）
    pub fn bucket_registry(&self) -> BucketRegistry {
        BucketRegistry::from_env(self.buckets.clone())
    }
}

fn normalize_types(types: &[String]) -> Vec<String> {
    types.iter().map(|t| t.trim().to_ascii_lowercase()).collect()
}
