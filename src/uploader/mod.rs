// 上传引擎模块
//
// 自底向上：
// - compressor: 图片压缩与缩略图
// - chunk: 分片切分与完成情况跟踪
// - retry: 指数退避重试
// - scheduler: 单文件传输（单次上传 / 分片并发上传 + 合并）
// - service: 对外门面，校验、压缩、传输、地址解析

pub mod chunk;
pub mod compressor;
pub mod error;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use chunk::{split_into_chunks, ChunkInfo, UploadChunkManager, DEFAULT_CHUNK_SIZE};
pub use compressor::{
    CompressError, CompressionOutput, CompressionRequest, Compressor, ImageCodec, ImageCrateCodec,
    RasterImage,
};
pub use error::{TransferError, UploadError};
pub use progress::{ProgressCallback, ProgressReporter, UploadProgress, UploadStatus};
pub use retry::{RetryError, RetryPolicy};
pub use scheduler::{TransferOutcome, TransferRequest, TransferScheduler};
pub use service::UploadService;
pub use task::{UploadFile, UploadOptions, UploadResult, UploadStage};

use std::time::Duration;

/// 默认最大文件大小: 50MB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// 默认最大并发上传数
pub const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 3;

/// 默认带宽下限: 256KB/s（用于估算单次请求超时）
pub const DEFAULT_BANDWIDTH_FLOOR: u64 = 256 * 1024;

/// 上传参数
///
/// 构造时注入 UploadService，运行期间只读
#[derive(Debug, Clone, PartialEq)]
pub struct UploadSettings {
    pub chunk_size: u64,
    pub max_file_size: u64,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// 单个文件的最大在途分片数
    pub max_concurrent_uploads: usize,
    pub max_width: u32,
    pub max_height: u32,
    /// 压缩质量 (0, 1]
    pub quality: f32,
    pub thumbnail_size: u32,
    pub thumbnail_quality: f32,
    pub allowed_image_types: Vec<String>,
    pub allowed_video_types: Vec<String>,
    /// 单次请求超时下限
    pub attempt_timeout_floor: Duration,
    /// 带宽下限 (bytes/s)
    pub bandwidth_floor: u64,
    /// 超时 = 预计传输时间 × 倍数
    pub timeout_multiplier: u32,
    pub progress_interval: Duration,
    pub signed_url_ttl: Duration,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_retries: retry::DEFAULT_MAX_RETRIES,
            retry_base_delay: Duration::from_millis(retry::DEFAULT_BASE_DELAY_MS),
            retry_max_delay: Duration::from_millis(retry::DEFAULT_MAX_DELAY_MS),
            max_concurrent_uploads: DEFAULT_MAX_CONCURRENT_UPLOADS,
            max_width: 1920,
            max_height: 1080,
            quality: 0.85,
            thumbnail_size: 400,
            thumbnail_quality: 0.7,
            allowed_image_types: default_image_types(),
            allowed_video_types: default_video_types(),
            attempt_timeout_floor: Duration::from_secs(10),
            bandwidth_floor: DEFAULT_BANDWIDTH_FLOOR,
            timeout_multiplier: 3,
            progress_interval: Duration::from_millis(progress::DEFAULT_THROTTLE_INTERVAL_MS),
            signed_url_ttl: Duration::from_secs(3600),
        }
    }
}

pub fn default_image_types() -> Vec<String> {
    ["image/jpeg", "image/jpg", "image/png", "image/webp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub fn default_video_types() -> Vec<String> {
    ["video/mp4", "video/quicktime", "video/webm"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl UploadSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_base_delay).with_max_delay(self.retry_max_delay)
    }

    /// 按带宽下限估算单次请求超时
    ///
    /// # 示例
    /// 5MB 分片, 256KB/s, 3 倍 → 60s；小请求不低于下限 10s
    pub fn attempt_timeout(&self, bytes: u64) -> Duration {
        let expected = bytes as f64 / self.bandwidth_floor.max(1) as f64;
        let timeout = Duration::from_secs_f64(expected * self.timeout_multiplier.max(1) as f64);
        timeout.max(self.attempt_timeout_floor)
    }

    pub fn is_allowed_image(&self, mime: &str) -> bool {
        self.allowed_image_types.iter().any(|t| t == mime)
    }

    pub fn is_allowed_video(&self, mime: &str) -> bool {
        self.allowed_video_types.iter().any(|t| t == mime)
    }

    pub fn is_allowed_media(&self, mime: &str) -> bool {
        self.is_allowed_image(mime) || self.is_allowed_video(mime)
    }
}
