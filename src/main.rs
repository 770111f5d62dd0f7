use anyhow::{bail, Context, Result};
use media_upload_engine::{
    config::{AppConfig, StorageBackend},
    logging, LocalObjectStore, ObjectStore, SupabaseStorage, UploadFile, UploadOptions,
    UploadProgress, UploadService,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 默认配置文件路径
const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

const USAGE: &str = "用法: media-upload [--config <path>] --bucket <key> [--folder <dir>] \
[--owner <id>] [--no-compress] [--thumbnail] <file>...";

/// 命令行参数
#[derive(Debug, Default)]
struct CliArgs {
    config: Option<String>,
    bucket: String,
    folder: Option<String>,
    owner: Option<String>,
    compress: bool,
    thumbnail: bool,
    files: Vec<PathBuf>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliArgs> {
    let mut parsed = CliArgs {
        compress: true,
        ..Default::default()
    };
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next()
                .with_context(|| format!("{} 缺少参数值\n{}", name, USAGE))
        };
        match arg.as_str() {
            "--config" => parsed.config = Some(value("--config")?),
            "--bucket" => parsed.bucket = value("--bucket")?,
            "--folder" => parsed.folder = Some(value("--folder")?),
            "--owner" => parsed.owner = Some(value("--owner")?),
            "--no-compress" => parsed.compress = false,
            "--thumbnail" => parsed.thumbnail = true,
            "-h" | "--help" => bail!("{}", USAGE),
            flag if flag.starts_with("--") => bail!("未知参数: {}\n{}", flag, USAGE),
            file => parsed.files.push(PathBuf::from(file)),
        }
    }

    if parsed.bucket.is_empty() {
        bail!("缺少 --bucket\n{}", USAGE);
    }
    if parsed.files.is_empty() {
        bail!("没有指定要上传的文件\n{}", USAGE);
    }
    Ok(parsed)
}

/// 按扩展名推断 MIME
fn guess_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn build_store(config: &AppConfig) -> Result<Arc<dyn ObjectStore>> {
    let storage = &config.storage;
    match storage.backend {
        StorageBackend::Local => {
            let mut store = LocalObjectStore::new(storage.local_root.clone());
            if let Some(base_url) = &storage.public_base_url {
                store = store.with_public_base_url(base_url.clone());
            }
            info!("使用本地存储: {:?}", storage.local_root);
            Ok(Arc::new(store))
        }
        StorageBackend::Supabase => {
            let url = storage
                .supabase_url
                .clone()
                .context("缺少 SUPABASE_URL")?;
            let key = storage
                .supabase_key
                .clone()
                .context("缺少 SUPABASE_ANON_KEY")?;
            info!("使用 Supabase 存储: {}", url);
            Ok(Arc::new(SupabaseStorage::new(url, key)?))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;

    let config_path = args
        .config
        .clone()
        .or_else(|| std::env::var("MEDIA_UPLOAD_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = AppConfig::load_or_default(&config_path).await;
    config.validate().context("配置无效")?;

    // 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log);
    info!("Media Upload v{} 启动", env!("CARGO_PKG_VERSION"));

    let store = build_store(&config)?;
    let service = UploadService::new(config.upload_settings(), store, config.bucket_registry());

    // Ctrl+C 取消所有上传
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到 Ctrl+C，取消上传...");
            signal_token.cancel();
        }
    });

    let on_progress = Arc::new(|p: UploadProgress| {
        info!(
            "[{}] {:?} {:.1}% ({}/{} bytes)",
            p.file_name, p.status, p.percentage, p.bytes_uploaded, p.total_bytes
        );
    });

    let mut items = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("读取文件失败: {:?}", path))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let file = UploadFile::new(name, guess_content_type(path), data);

        let mut options = UploadOptions::new(args.bucket.clone())
            .compress(args.compress)
            .thumbnail(args.thumbnail)
            .on_progress(on_progress.clone())
            .cancel_token(cancel.clone());
        if let Some(folder) = &args.folder {
            options = options.folder(folder.clone());
        }
        if let Some(owner) = &args.owner {
            options = options.owner(owner.clone());
        }
        items.push((file, options));
    }

    let results = service.upload_batch(items).await;
    let failed = results.iter().filter(|r| !r.success).count();
    println!("{}", serde_json::to_string_pretty(&results)?);

    if failed > 0 {
        bail!("{}/{} 个文件上传失败", failed, results.len());
    }
    info!("全部 {} 个文件上传完成", results.len());
    Ok(())
}
