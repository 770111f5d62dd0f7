// 测试辅助：可注入故障的存储、只让缩略图失败的编解码器、测试图片生成

use crate::storage::{
    CommittedPart, ErrorKind, MemoryObjectStore, ObjectStore, PutOptions, PutReceipt, StoreError,
    StoreResult,
};
use crate::uploader::compressor::{CompressError, ImageCodec, ImageCrateCodec, RasterImage};
use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, RgbImage};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 生成带纹理的 JPEG（避免纯色图压缩得过小）
pub fn jpeg_bytes(width: u32, height: u32, quality: u8) -> Bytes {
    let image = RgbImage::from_fn(width, height, |x, y| {
        let v = (x.wrapping_mul(31) ^ y.wrapping_mul(17)).wrapping_add(x * y) as u8;
        image::Rgb([v, (x % 256) as u8, (y % 256) as u8])
    });
    let mut buffer = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
        encoder
            .encode(image.as_raw(), width, height, ColorType::Rgb8)
            .unwrap();
    }
    Bytes::from(buffer)
}

/// 缩略图质量下编码失败的编解码器
pub struct ThumbnailFailingCodec {
    inner: ImageCrateCodec,
    thumbnail_quality: f32,
}

impl ThumbnailFailingCodec {
    pub fn new(thumbnail_quality: f32) -> Self {
        Self {
            inner: ImageCrateCodec,
            thumbnail_quality,
        }
    }
}

impl ImageCodec for ThumbnailFailingCodec {
    fn decode(&self, bytes: &[u8]) -> Result<RasterImage, CompressError> {
        self.inner.decode(bytes)
    }

    fn resize(
        &self,
        image: &RasterImage,
        width: u32,
        height: u32,
    ) -> Result<RasterImage, CompressError> {
        self.inner.resize(image, width, height)
    }

    fn encode(&self, image: &RasterImage, quality: f32) -> Result<Vec<u8>, CompressError> {
        if (quality - self.thumbnail_quality).abs() < f32::EPSILON {
            return Err(CompressError::Decode("模拟缩略图失败".into()));
        }
        self.inner.encode(image, quality)
    }
}

/// 故障规则
#[derive(Debug, Clone)]
pub struct FailureRule {
    /// key 包含该片段时生效
    pub key_contains: String,
    pub kind: ErrorKind,
    /// 失败次数（None 表示永远失败）
    pub times: Option<usize>,
}

/// 包装 MemoryObjectStore：注入故障、模拟延迟、统计并发
pub struct FlakyStore {
    pub inner: MemoryObjectStore,
    rules: Mutex<Vec<FailureRule>>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    pub put_keys: Mutex<Vec<String>>,
    pub deleted_keys: Mutex<Vec<String>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            inner: MemoryObjectStore::new(),
            rules: Mutex::new(Vec::new()),
            latency,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            put_keys: Mutex::new(Vec::new()),
            deleted_keys: Mutex::new(Vec::new()),
        }
    }

    pub fn fail(self, key_contains: &str, kind: ErrorKind, times: Option<usize>) -> Self {
        self.rules.lock().push(FailureRule {
            key_contains: key_contains.to_string(),
            kind,
            times,
        });
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// 某个 key 片段被 put 的次数
    pub fn put_attempts(&self, key_contains: &str) -> usize {
        self.put_keys
            .lock()
            .iter()
            .filter(|k| k.contains(key_contains))
            .count()
    }

    fn check_rules(&self, key: &str) -> StoreResult<()> {
        let mut rules = self.rules.lock();
        for rule in rules.iter_mut() {
            if !key.contains(&rule.key_contains) {
                continue;
            }
            match rule.times {
                None => return Err(StoreError::new(rule.kind, format!("注入故障: {}", key))),
                Some(0) => continue,
                Some(n) => {
                    rule.times = Some(n - 1);
                    return Err(StoreError::new(rule.kind, format!("注入故障: {}", key)));
                }
            }
        }
        Ok(())
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        options: &PutOptions,
    ) -> StoreResult<PutReceipt> {
        self.put_keys.lock().push(key.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.check_rules(key)?;
        self.inner.put_object(bucket, key, data, options).await
    }

    async fn finalize_multipart(
        &self,
        bucket: &str,
        key: &str,
        parts: &[CommittedPart],
        options: &PutOptions,
    ) -> StoreResult<()> {
        self.inner
            .finalize_multipart(bucket, key, parts, options)
            .await
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> StoreResult<()> {
        self.deleted_keys.lock().extend(keys.iter().cloned());
        self.inner.delete_objects(bucket, keys).await
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        self.inner.public_url(bucket, key)
    }

    async fn create_signed_url(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> StoreResult<String> {
        self.inner.create_signed_url(bucket, key, ttl).await
    }
}

/// 记录进度事件
pub fn progress_sink() -> (
    crate::uploader::ProgressCallback,
    Arc<Mutex<Vec<crate::uploader::UploadProgress>>>,
) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let callback: crate::uploader::ProgressCallback = Arc::new(move |p| sink.lock().push(p));
    (callback, events)
}
