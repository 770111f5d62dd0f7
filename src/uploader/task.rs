// 上传任务定义：输入文件、上传选项、上传结果、阶段状态机

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::uploader::ProgressCallback;

/// 待上传的文件（内存中）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    /// 原始文件名
    pub name: String,
    /// MIME 类型
    pub content_type: String,
    pub data: Bytes,
}

impl UploadFile {
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// 规范化后的 MIME（小写、去空白、去参数）
    pub fn mime(&self) -> String {
        self.content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }
}

/// 上传选项
///
/// 每次调用单独构造，不在调用之间共享
#[derive(Clone)]
pub struct UploadOptions {
    /// 逻辑存储桶（profile / offers / ...），通过 BucketRegistry 解析
    pub bucket: String,
    /// 路径前缀
    pub folder: Option<String>,
    /// 调用方身份，仅用于命名空间
    pub owner_id: Option<String>,
    pub generate_thumbnail: bool,
    pub compress: bool,
    /// 压缩质量 (0, 1]，None 使用配置
    pub compression_quality: Option<f32>,
    /// 最大宽度，None 使用配置
    pub max_width: Option<u32>,
    pub on_progress: Option<ProgressCallback>,
    pub cancel_token: Option<CancellationToken>,
}

impl fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadOptions")
            .field("bucket", &self.bucket)
            .field("folder", &self.folder)
            .field("owner_id", &self.owner_id)
            .field("generate_thumbnail", &self.generate_thumbnail)
            .field("compress", &self.compress)
            .field("compression_quality", &self.compression_quality)
            .field("max_width", &self.max_width)
            .field("on_progress", &self.on_progress.is_some())
            .field("cancellable", &self.cancel_token.is_some())
            .finish()
    }
}

impl UploadOptions {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            folder: None,
            owner_id: None,
            generate_thumbnail: false,
            compress: true,
            compression_quality: None,
            max_width: None,
            on_progress: None,
            cancel_token: None,
        }
    }

    pub fn folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    pub fn owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn thumbnail(mut self, enabled: bool) -> Self {
        self.generate_thumbnail = enabled;
        self
    }

    pub fn compress(mut self, enabled: bool) -> Self {
        self.compress = enabled;
        self
    }

    pub fn quality(mut self, quality: f32) -> Self {
        self.compression_quality = Some(quality);
        self
    }

    pub fn max_width(mut self, max_width: u32) -> Self {
        self.max_width = Some(max_width);
        self
    }

    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    /// 是否需要按媒体文件处理（触发 MIME 白名单校验）
    ///
    /// 只有缩略图要求输入必须是媒体文件；压缩对非图片类型原样透传
    pub fn implies_media(&self) -> bool {
        self.generate_thumbnail
    }
}

/// 上传结果
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UploadResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    /// 存储路径（校验失败时为空）
    pub storage_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<String>,
    /// 原始大小
    pub file_size: u64,
    /// 处理（压缩）后大小
    pub processed_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 用户取消（success 同样为 false）
    #[serde(default)]
    pub cancelled: bool,
}

impl UploadResult {
    pub fn failure(file_size: u64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            file_size,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn cancelled(file_size: u64) -> Self {
        Self {
            cancelled: true,
            ..Self::failure(file_size, "上传已取消")
        }
    }
}

/// 单次上传的阶段
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadStage {
    Pending,
    Validating,
    Compressing,
    Uploading,
    /// 缩略图上传与地址解析
    Finalizing,
    Complete,
    Error,
    Cancelled,
}

impl UploadStage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStage::Complete | UploadStage::Error | UploadStage::Cancelled
        )
    }

    /// 状态转换是否合法
    ///
    /// pending → validating → (compressing)? → uploading → (finalizing)? → complete，
    /// 任意非终态可进入 error / cancelled
    pub fn can_transition_to(&self, next: UploadStage) -> bool {
        use UploadStage::*;
        if self.is_terminal() {
            return false;
        }
        match next {
            Error | Cancelled => true,
            Validating => *self == Pending,
            Compressing => *self == Validating,
            Uploading => matches!(self, Validating | Compressing),
            Finalizing => *self == Uploading,
            Complete => matches!(self, Uploading | Finalizing),
            Pending => false,
        }
    }
}

/// 阶段跟踪（拒绝非法转换）
#[derive(Debug)]
pub struct StageTracker {
    file_name: String,
    stage: UploadStage,
}

impl StageTracker {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            stage: UploadStage::Pending,
        }
    }

    pub fn stage(&self) -> UploadStage {
        self.stage
    }

    /// 转换到下一阶段，非法转换返回 false 且状态不变
    pub fn advance(&mut self, next: UploadStage) -> bool {
        if !self.stage.can_transition_to(next) {
            warn!(
                "[{}] 非法的阶段转换: {:?} -> {:?}",
                self.file_name, self.stage, next
            );
            return false;
        }
        debug!("[{}] 阶段: {:?} -> {:?}", self.file_name, self.stage, next);
        self.stage = next;
        true
    }
}
