//! 上传服务（对外门面）
//!
//! 一次 `upload` 调用的流程：
//! 1. 校验大小（不发起任何网络请求）、存储桶、MIME 类型
//! 2. 图片压缩 + 缩略图（解码失败时回退为原图）
//! 3. 生成存储 key：`[folder/][owner/]<时间戳毫秒>_<uuid8>_<文件名>`
//! 4. 调度器传输主文件，进度转发给调用方
//! 5. 缩略图独立上传，失败只影响 `thumbnail_url`
//! 6. 公开桶返回公开地址，私有桶返回签名地址
//!
//! 所有失败都转换为 `UploadResult`，不会向调用方返回错误或 panic。

use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::buckets::{BucketConfig, BucketRegistry};
use crate::storage::ObjectStore;
use crate::uploader::compressor::{
    CompressError, CompressionRequest, Compressor, ImageCodec, ImageCrateCodec,
};
use crate::uploader::error::UploadError;
use crate::uploader::progress::{ProgressReporter, UploadStatus};
use crate::uploader::scheduler::{TransferRequest, TransferScheduler};
use crate::uploader::task::{StageTracker, UploadFile, UploadOptions, UploadResult, UploadStage};
use crate::uploader::UploadSettings;

/// 文件名最大长度（不含前缀）
const MAX_FILE_NAME_LEN: usize = 100;

/// 文件名只保留字母数字和 `.-_`
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or_default();
    let mut out = String::with_capacity(base.len());
    let mut last_underscore = false;
    for c in base.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
            out.push(c);
            last_underscore = c == '_';
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    let trimmed = out.trim_matches(|c: char| c == '.' || c == '_');
    let mut result: String = trimmed.chars().take(MAX_FILE_NAME_LEN).collect();
    if result.is_empty() {
        result = "file".to_string();
    }
    result
}

/// 替换扩展名
fn with_extension(name: &str, ext: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    format!("{}.{}", stem, ext)
}

/// 路径前缀：逐段清理，去掉空段和 `.`/`..`
fn sanitize_prefix(prefix: &str) -> Vec<String> {
    prefix
        .split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .map(sanitize_file_name)
        .collect()
}

/// 生成存储 key
pub fn build_storage_key(
    folder: Option<&str>,
    owner_id: Option<&str>,
    file_name: &str,
    timestamp_ms: i64,
    unique: &str,
) -> String {
    let mut segments = Vec::new();
    if let Some(folder) = folder {
        segments.extend(sanitize_prefix(folder));
    }
    if let Some(owner) = owner_id {
        segments.extend(sanitize_prefix(owner));
    }
    segments.push(format!(
        "{}_{}_{}",
        timestamp_ms,
        unique,
        sanitize_file_name(file_name)
    ));
    segments.join("/")
}

/// 缩略图 key：`<目录>/thumbnails/<文件名>.jpg`
pub fn thumbnail_key(storage_key: &str) -> String {
    let (dir, name) = match storage_key.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, storage_key),
    };
    let thumb = with_extension(name, "jpg");
    match dir {
        Some(dir) => format!("{}/thumbnails/{}", dir, thumb),
        None => format!("thumbnails/{}", thumb),
    }
}

/// 失败时仍需带回给调用方的信息
#[derive(Debug, Default)]
struct UploadContext {
    storage_path: String,
    processed_size: u64,
}

/// 上传服务
#[derive(Clone)]
pub struct UploadService {
    settings: Arc<UploadSettings>,
    store: Arc<dyn ObjectStore>,
    buckets: Arc<BucketRegistry>,
    compressor: Compressor,
    scheduler: TransferScheduler,
}

impl std::fmt::Debug for UploadService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadService")
            .field("settings", &self.settings)
            .field("buckets", &self.buckets)
            .finish()
    }
}

impl UploadService {
    pub fn new(
        settings: UploadSettings,
        store: Arc<dyn ObjectStore>,
        buckets: BucketRegistry,
    ) -> Self {
        Self::with_codec(settings, store, buckets, Arc::new(ImageCrateCodec))
    }

    pub fn with_codec(
        settings: UploadSettings,
        store: Arc<dyn ObjectStore>,
        buckets: BucketRegistry,
        codec: Arc<dyn ImageCodec>,
    ) -> Self {
        let settings = Arc::new(settings);
        let compressor = Compressor::new(codec, settings.allowed_image_types.clone());
        let scheduler = TransferScheduler::new(store.clone(), settings.clone());
        Self {
            settings,
            store,
            buckets: Arc::new(buckets),
            compressor,
            scheduler,
        }
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    /// 上传单个文件
    pub async fn upload(&self, file: UploadFile, options: UploadOptions) -> UploadResult {
        let file_size = file.size();
        let cancel = options.cancel_token.clone().unwrap_or_default();
        let reporter = ProgressReporter::new(
            file.name.clone(),
            file_size,
            options.on_progress.clone(),
            self.settings.progress_interval,
        );
        let mut stage = StageTracker::new(file.name.clone());
        let mut ctx = UploadContext {
            storage_path: String::new(),
            processed_size: file_size,
        };

        match self
            .run(&file, &options, &reporter, &mut stage, &mut ctx, &cancel)
            .await
        {
            Ok(result) => {
                stage.advance(UploadStage::Complete);
                reporter.complete();
                result
            }
            Err(e) if e.is_cancelled() => {
                info!("[{}] 上传已取消", file.name);
                stage.advance(UploadStage::Cancelled);
                reporter.fail(e.to_string());
                UploadResult {
                    storage_path: ctx.storage_path,
                    processed_size: ctx.processed_size,
                    ..UploadResult::cancelled(file_size)
                }
            }
            Err(e) => {
                if e.is_validation() {
                    warn!("[{}] 校验失败: {}", file.name, e);
                } else {
                    error!("[{}] 上传失败: {}", file.name, e);
                }
                stage.advance(UploadStage::Error);
                reporter.fail(e.to_string());
                UploadResult {
                    storage_path: ctx.storage_path,
                    processed_size: ctx.processed_size,
                    ..UploadResult::failure(file_size, e.to_string())
                }
            }
        }
    }

    async fn run(
        &self,
        file: &UploadFile,
        options: &UploadOptions,
        reporter: &ProgressReporter,
        stage: &mut StageTracker,
        ctx: &mut UploadContext,
        cancel: &CancellationToken,
    ) -> Result<UploadResult, UploadError> {
        let file_size = file.size();
        let mime = file.mime();

        // 1. 校验（无网络请求）
        stage.advance(UploadStage::Validating);
        if file_size > self.settings.max_file_size {
            return Err(UploadError::FileTooLarge {
                size: file_size,
                limit: self.settings.max_file_size,
            });
        }
        let bucket = self
            .buckets
            .resolve(&options.bucket)
            .cloned()
            .ok_or_else(|| UploadError::UnknownBucket(options.bucket.clone()))?;
        if options.implies_media() && !self.settings.is_allowed_media(&mime) {
            return Err(UploadError::DisallowedMimeType(mime));
        }
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        info!(
            "[{}] 开始上传: {} bytes, 类型 {}, 存储桶 {} ({})",
            file.name, file_size, mime, options.bucket, bucket.name
        );

        // 2. 压缩 + 缩略图
        let mut data = file.data.clone();
        let mut content_type = mime.clone();
        let mut thumbnail = None;
        let mut reencoded = false;

        let is_image = self.settings.is_allowed_image(&mime);
        if is_image && (options.compress || options.generate_thumbnail) {
            stage.advance(UploadStage::Compressing);
            reporter.set_status(UploadStatus::Processing);

            let request = self.compression_request(options);
            let compressed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                result = self.compressor.compress(file.data.clone(), &mime, &request) => result,
            };

            match compressed {
                Ok(output) => {
                    if options.compress {
                        reencoded = output.reencoded;
                        data = output.main;
                        content_type = output.content_type;
                    }
                    thumbnail = output.thumbnail;
                }
                Err(CompressError::Decode(e)) => {
                    warn!("[{}] 图片无法解码，按原图上传: {}", file.name, e);
                }
                Err(e) => {
                    warn!("[{}] 图片压缩失败，按原图上传: {}", file.name, e);
                }
            }
        }

        let processed_size = data.len() as u64;
        ctx.processed_size = processed_size;
        reporter.set_total(processed_size);

        // 3. 存储 key
        let name = if reencoded {
            with_extension(&file.name, "jpg")
        } else {
            file.name.clone()
        };
        let unique = uuid::Uuid::new_v4().simple().to_string();
        let key = build_storage_key(
            options.folder.as_deref(),
            options.owner_id.as_deref(),
            &name,
            chrono::Utc::now().timestamp_millis(),
            &unique[..8],
        );

        // 4. 主文件传输
        stage.advance(UploadStage::Uploading);
        reporter.set_status(UploadStatus::Uploading);
        let request = TransferRequest {
            bucket: bucket.name.clone(),
            key: key.clone(),
            data,
            content_type,
        };
        let outcome = self.scheduler.transfer(&request, reporter, cancel).await?;
        ctx.storage_path = key.clone();
        debug!(
            "[{}] 主文件已写入 {}/{} ({} 个分片)",
            file.name, bucket.name, key, outcome.chunk_count
        );

        // 5. 缩略图（独立传输，失败不影响主文件）
        stage.advance(UploadStage::Finalizing);
        reporter.set_status(UploadStatus::Processing);
        let mut promoted = vec![key.clone()];
        let mut thumbnail_path = None;
        if let Some(thumb) = thumbnail {
            let thumb_key = thumbnail_key(&key);
            let thumb_request = TransferRequest {
                bucket: bucket.name.clone(),
                key: thumb_key.clone(),
                data: thumb,
                content_type: crate::uploader::compressor::COMPRESSED_CONTENT_TYPE.to_string(),
            };
            let thumb_reporter =
                ProgressReporter::silent(thumb_key.clone(), thumb_request.data.len() as u64);
            match self
                .scheduler
                .transfer(&thumb_request, &thumb_reporter, cancel)
                .await
            {
                Ok(_) => {
                    promoted.push(thumb_key.clone());
                    thumbnail_path = Some(thumb_key);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("[{}] 缩略图上传失败，忽略: {}", file.name, e),
            }
        }

        if cancel.is_cancelled() {
            self.discard(&bucket.name, &promoted).await;
            return Err(UploadError::Cancelled);
        }

        // 6. 访问地址
        let url = self.resolve_url(&bucket, &key).await?;
        let thumbnail_url = match &thumbnail_path {
            Some(path) => match self.resolve_url(&bucket, path).await {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!("[{}] 缩略图地址获取失败，忽略: {}", file.name, e);
                    None
                }
            },
            None => None,
        };

        // 返回前被取消：撤销已写入的对象
        if cancel.is_cancelled() {
            self.discard(&bucket.name, &promoted).await;
            return Err(UploadError::Cancelled);
        }

        info!(
            "[{}] 上传成功: {}/{} ({} -> {} bytes, 缩略图={})",
            file.name,
            bucket.name,
            key,
            file_size,
            processed_size,
            thumbnail_path.is_some()
        );

        Ok(UploadResult {
            success: true,
            url: Some(url),
            thumbnail_url,
            storage_path: key,
            thumbnail_path,
            file_size,
            processed_size,
            error: None,
            cancelled: false,
        })
    }

    fn compression_request(&self, options: &UploadOptions) -> CompressionRequest {
        CompressionRequest {
            max_width: options.max_width.unwrap_or(self.settings.max_width),
            max_height: self.settings.max_height,
            quality: options
                .compression_quality
                .filter(|q| *q > 0.0 && *q <= 1.0)
                .unwrap_or(self.settings.quality),
            generate_thumbnail: options.generate_thumbnail,
            thumbnail_size: self.settings.thumbnail_size,
            thumbnail_quality: self.settings.thumbnail_quality,
        }
    }

    async fn resolve_url(&self, bucket: &BucketConfig, key: &str) -> Result<String, UploadError> {
        if bucket.public {
            return Ok(self.store.public_url(&bucket.name, key));
        }
        self.store
            .create_signed_url(&bucket.name, key, self.settings.signed_url_ttl)
            .await
            .map_err(UploadError::UrlResolution)
    }

    /// 尽力删除已写入的对象
    async fn discard(&self, bucket: &str, keys: &[String]) {
        match self.store.delete_objects(bucket, keys).await {
            Ok(()) => info!("已撤销 {} 个已上传对象", keys.len()),
            Err(e) => warn!("撤销已上传对象失败（忽略）: {}", e),
        }
    }

    /// 批量上传
    ///
    /// 同时进行的文件数不超过 max_concurrent_uploads，结果与输入顺序一致
    pub async fn upload_batch(&self, items: Vec<(UploadFile, UploadOptions)>) -> Vec<UploadResult> {
        let limit = self.settings.max_concurrent_uploads.max(1);
        info!("批量上传 {} 个文件，并发数 {}", items.len(), limit);
        stream::iter(items)
            .map(|(file, options)| self.upload(file, options))
            .buffered(limit)
            .collect()
            .await
    }

    /// 删除已上传的对象（替换图片时使用）
    pub async fn delete(&self, bucket: &str, paths: &[String]) -> Result<(), UploadError> {
        let resolved = self
            .buckets
            .resolve(bucket)
            .ok_or_else(|| UploadError::UnknownBucket(bucket.to_string()))?;
        if paths.is_empty() {
            return Ok(());
        }
        self.store
            .delete_objects(&resolved.name, paths)
            .await
            .map_err(UploadError::Delete)?;
        info!("已删除 {} 个对象: bucket={}", paths.len(), resolved.name);
        Ok(())
    }
}
