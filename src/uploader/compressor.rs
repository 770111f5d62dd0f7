// 图片压缩
//
// 功能：
// 1. 超出目标尺寸时等比缩小（从不放大），重新编码为指定质量的 JPEG
// 2. 独立生成缩略图，缩略图失败不影响主图
// 3. 非图片（视频等）或不在白名单中的类型原样透传
//
// 解码 / 缩放 / 编码通过 ImageCodec 抽象，默认实现基于 image crate

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, RgbImage};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// 压缩后的 Content-Type
pub const COMPRESSED_CONTENT_TYPE: &str = "image/jpeg";

/// 压缩错误
#[derive(Debug, Error)]
pub enum CompressError {
    /// 图片无法解码（损坏或格式不支持），调用方应回退为原图上传
    #[error("图片解码失败: {0}")]
    Decode(String),
    #[error("图片编码失败: {0}")]
    Encode(String),
    #[error("压缩任务异常: {0}")]
    Task(String),
}

/// 解码后的图片（RGB8 像素）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    pub width: u32,
    pub height: u32,
    /// 行优先 RGB8，长度 = width * height * 3
    pub pixels: Vec<u8>,
}

/// 图片编解码能力
pub trait ImageCodec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<RasterImage, CompressError>;

    fn resize(
        &self,
        image: &RasterImage,
        width: u32,
        height: u32,
    ) -> Result<RasterImage, CompressError>;

    /// 按质量编码，quality 取值 (0, 1]
    fn encode(&self, image: &RasterImage, quality: f32) -> Result<Vec<u8>, CompressError>;
}

/// 基于 image crate 的编解码器（输出 JPEG）
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCrateCodec;

impl ImageCrateCodec {
    fn to_rgb(image: &RasterImage) -> Result<RgbImage, CompressError> {
        RgbImage::from_raw(image.width, image.height, image.pixels.clone()).ok_or_else(|| {
            CompressError::Encode(format!(
                "像素数据长度与尺寸不符: {}x{}, {} bytes",
                image.width,
                image.height,
                image.pixels.len()
            ))
        })
    }
}

impl ImageCodec for ImageCrateCodec {
    fn decode(&self, bytes: &[u8]) -> Result<RasterImage, CompressError> {
        let decoded =
            image::load_from_memory(bytes).map_err(|e| CompressError::Decode(e.to_string()))?;
        if decoded.color().has_alpha() {
            let rgba = decoded.to_rgba8();
            return Ok(RasterImage {
                width: rgba.width(),
                height: rgba.height(),
                pixels: flatten_onto_white(rgba.as_raw()),
            });
        }
        let rgb = decoded.to_rgb8();
        Ok(RasterImage {
            width: rgb.width(),
            height: rgb.height(),
            pixels: rgb.into_raw(),
        })
    }

    fn resize(
        &self,
        image: &RasterImage,
        width: u32,
        height: u32,
    ) -> Result<RasterImage, CompressError> {
        let rgb = Self::to_rgb(image)?;
        let resized = image::imageops::resize(&rgb, width, height, FilterType::Lanczos3);
        Ok(RasterImage {
            width: resized.width(),
            height: resized.height(),
            pixels: resized.into_raw(),
        })
    }

    fn encode(&self, image: &RasterImage, quality: f32) -> Result<Vec<u8>, CompressError> {
        let mut buffer = Vec::new();
        {
            let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality_to_jpeg(quality));
            encoder
                .encode(&image.pixels, image.width, image.height, ColorType::Rgb8)
                .map_err(|e| CompressError::Encode(e.to_string()))?;
        }
        Ok(buffer)
    }
}

/// 透明像素合成到白色背景上（JPEG 没有 alpha 通道）
///
/// 输入 RGBA8，输出 RGB8
fn flatten_onto_white(rgba: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rgba.len() / 4 * 3);
    for px in rgba.chunks_exact(4) {
        let alpha = px[3] as u32;
        for &channel in &px[..3] {
            let blended = (channel as u32 * alpha + 255 * (255 - alpha) + 127) / 255;
            out.push(blended as u8);
        }
    }
    out
}

/// 0-1 的质量映射到 JPEG 的 1-100
fn quality_to_jpeg(quality: f32) -> u8 {
    (quality.clamp(0.01, 1.0) * 100.0).round() as u8
}

/// 等比缩放到目标框内，不放大
///
/// # 返回
/// 缩放后的 (宽, 高)，每个维度至少为 1
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (width, height);
    }
    if width <= max_width && height <= max_height {
        return (width, height);
    }

    let scale = f64::min(
        max_width as f64 / width as f64,
        max_height as f64 / height as f64,
    );
    let new_width = ((width as f64 * scale).round() as u32).clamp(1, max_width.max(1));
    let new_height = ((height as f64 * scale).round() as u32).clamp(1, max_height.max(1));
    (new_width, new_height)
}

/// 单次压缩参数
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionRequest {
    pub max_width: u32,
    pub max_height: u32,
    pub quality: f32,
    pub generate_thumbnail: bool,
    pub thumbnail_size: u32,
    pub thumbnail_quality: f32,
}

/// 压缩结果
#[derive(Debug, Clone)]
pub struct CompressionOutput {
    /// 主图数据（可能是原始数据）
    pub main: Bytes,
    /// 主图 Content-Type
    pub content_type: String,
    /// 主图是否被重新编码
    pub reencoded: bool,
    pub thumbnail: Option<Bytes>,
    pub processed_size: u64,
    /// 输出尺寸（透传时为 None）
    pub dimensions: Option<(u32, u32)>,
}

impl CompressionOutput {
    fn passthrough(data: Bytes, content_type: &str) -> Self {
        Self {
            processed_size: data.len() as u64,
            main: data,
            content_type: content_type.to_string(),
            reencoded: false,
            thumbnail: None,
            dimensions: None,
        }
    }
}

/// 图片压缩器
#[derive(Clone)]
pub struct Compressor {
    codec: Arc<dyn ImageCodec>,
    allowed_types: Vec<String>,
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("allowed_types", &self.allowed_types)
            .finish()
    }
}

impl Compressor {
    pub fn new(codec: Arc<dyn ImageCodec>, allowed_types: Vec<String>) -> Self {
        Self {
            codec,
            allowed_types,
        }
    }

    /// MIME 是否允许压缩
    pub fn accepts(&self, content_type: &str) -> bool {
        let content_type = content_type.trim().to_ascii_lowercase();
        self.allowed_types.iter().any(|t| *t == content_type)
    }

    /// 压缩（在阻塞线程池中执行）
    pub async fn compress(
        &self,
        data: Bytes,
        content_type: &str,
        request: &CompressionRequest,
    ) -> Result<CompressionOutput, CompressError> {
        if !self.accepts(content_type) {
            debug!("类型 {} 不在压缩白名单中，原样透传", content_type);
            return Ok(CompressionOutput::passthrough(data, content_type));
        }

        let codec = self.codec.clone();
        let request = request.clone();
        let content_type = content_type.to_string();
        tokio::task::spawn_blocking(move || {
            compress_blocking(codec.as_ref(), data, &content_type, &request)
        })
        .await
        .map_err(|e| CompressError::Task(e.to_string()))?
    }
}

/// 压缩主流程（同步）
pub fn compress_blocking(
    codec: &dyn ImageCodec,
    data: Bytes,
    content_type: &str,
    request: &CompressionRequest,
) -> Result<CompressionOutput, CompressError> {
    let original_size = data.len() as u64;
    let image = codec.decode(&data)?;

    let (width, height) = fit_within(
        image.width,
        image.height,
        request.max_width,
        request.max_height,
    );
    let resized = (width, height) != (image.width, image.height);

    let main_image = if resized {
        codec.resize(&image, width, height)?
    } else {
        image.clone()
    };
    let encoded = codec.encode(&main_image, request.quality)?;

    // 未缩放且重新编码后反而更大时保留原图
    let (main, out_type, reencoded, dimensions) =
        if !resized && encoded.len() as u64 >= original_size {
            debug!(
                "重新编码后体积未减小 ({} -> {} bytes)，保留原图",
                original_size,
                encoded.len()
            );
            (data, content_type.to_string(), false, (image.width, image.height))
        } else {
            (
                Bytes::from(encoded),
                COMPRESSED_CONTENT_TYPE.to_string(),
                true,
                (main_image.width, main_image.height),
            )
        };

    let thumbnail = if request.generate_thumbnail {
        match make_thumbnail(codec, &image, request) {
            Ok(thumb) => Some(thumb),
            Err(e) => {
                warn!("缩略图生成失败，忽略: {}", e);
                None
            }
        }
    } else {
        None
    };

    info!(
        "图片压缩完成: {}x{} -> {}x{}, {} -> {} bytes, 缩略图={}",
        image.width,
        image.height,
        dimensions.0,
        dimensions.1,
        original_size,
        main.len(),
        thumbnail.as_ref().map(|t| t.len()).unwrap_or(0)
    );

    Ok(CompressionOutput {
        processed_size: main.len() as u64,
        main,
        content_type: out_type,
        reencoded,
        thumbnail,
        dimensions: Some(dimensions),
    })
}

fn make_thumbnail(
    codec: &dyn ImageCodec,
    image: &RasterImage,
    request: &CompressionRequest,
) -> Result<Bytes, CompressError> {
    let (width, height) = fit_within(
        image.width,
        image.height,
        request.thumbnail_size,
        request.thumbnail_size,
    );
    let thumb = if (width, height) != (image.width, image.height) {
        codec.resize(image, width, height)?
    } else {
        image.clone()
    };
    let encoded = codec.encode(&thumb, request.thumbnail_quality)?;
    Ok(Bytes::from(encoded))
}
