// 本地文件系统对象存储
//
// 目录布局：<root>/<bucket>/<key>
// 分片合并：按索引顺序拼接到临时文件，再原子 rename 到最终路径，最后删除暂存分片

use crate::storage::{
    CommittedPart, ErrorKind, ObjectStore, PutOptions, PutReceipt, StoreError, StoreResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    /// 公开访问地址前缀（例如静态文件服务器），为空时返回 file:// 地址
    public_base_url: Option<String>,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            public_base_url: None,
        }
    }

    pub fn with_public_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.public_base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 解析对象路径，拒绝 `..` 和绝对路径
    pub fn object_path(&self, bucket: &str, key: &str) -> StoreResult<PathBuf> {
        let mut path = self.root.join(sanitize_segment(bucket)?);
        for component in Path::new(key).components() {
            match component {
                Component::Normal(segment) => path.push(segment),
                _ => {
                    return Err(StoreError::new(
                        ErrorKind::BadRequest,
                        format!("非法对象路径: {}", key),
                    ))
                }
            }
        }
        Ok(path)
    }

    async fn ensure_parent(path: &Path) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

fn sanitize_segment(bucket: &str) -> StoreResult<&str> {
    if bucket.is_empty() || bucket.contains(['/', '\\']) || bucket == "." || bucket == ".." {
        return Err(StoreError::new(
            ErrorKind::BadRequest,
            format!("非法 bucket 名称: {:?}", bucket),
        ));
    }
    Ok(bucket)
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        _options: &PutOptions,
    ) -> StoreResult<PutReceipt> {
        let path = self.object_path(bucket, key)?;
        Self::ensure_parent(&path).await?;

        let etag = format!("{:x}", md5::compute(&data));
        fs::write(&path, &data).await?;

        debug!("本地存储写入: {:?} ({} bytes)", path, data.len());
        Ok(PutReceipt { etag: Some(etag) })
    }

    async fn finalize_multipart(
        &self,
        bucket: &str,
        key: &str,
        parts: &[CommittedPart],
        _options: &PutOptions,
    ) -> StoreResult<()> {
        let final_path = self.object_path(bucket, key)?;
        Self::ensure_parent(&final_path).await?;

        let tmp_path = final_path.with_file_name(format!(
            ".{}.{}.tmp",
            final_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            uuid::Uuid::new_v4().simple()
        ));

        let result = async {
            let mut out = fs::File::create(&tmp_path).await?;
            for part in parts {
                let part_path = self.object_path(bucket, &part.staging_key)?;
                let data = fs::read(&part_path).await.map_err(|e| {
                    StoreError::new(
                        ErrorKind::FileNotFound,
                        format!("读取分片 #{} 失败: {:?}: {}", part.index, part_path, e),
                    )
                })?;
                if data.len() as u64 != part.size {
                    return Err(StoreError::new(
                        ErrorKind::BadRequest,
                        format!(
                            "分片 #{} 大小不一致: 期望 {} bytes, 实际 {} bytes",
                            part.index,
                            part.size,
                            data.len()
                        ),
                    ));
                }
                out.write_all(&data).await?;
            }
            out.flush().await?;
            out.sync_all().await?;
            Ok::<(), StoreError>(())
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        fs::rename(&tmp_path, &final_path).await?;
        info!("本地存储合并完成: {:?} ({} 个分片)", final_path, parts.len());

        let staging: Vec<String> = parts.iter().map(|p| p.staging_key.clone()).collect();
        if let Err(e) = self.delete_objects(bucket, &staging).await {
            warn!("清理暂存分片失败: {}", e);
        }
        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> StoreResult<()> {
        for key in keys {
            let path = self.object_path(bucket, key)?;
            match fs::remove_file(&path).await {
                Ok(()) => {
                    // 顺手清理空的暂存目录，失败无所谓
                    if let Some(parent) = path.parent() {
                        let _ = fs::remove_dir(parent).await;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}/{}/{}", base, bucket, crate::storage::encode_key(key)),
            None => format!("file://{}", self.root.join(bucket).join(key).display()),
        }
    }

    async fn create_signed_url(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> StoreResult<String> {
        let path = self.object_path(bucket, key)?;
        if fs::metadata(&path).await.is_err() {
            return Err(StoreError::not_found(format!("{}/{}", bucket, key)));
        }
        let expires_at = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
        Ok(format!("{}?expires={}", self.public_url(bucket, key), expires_at))
    }
}
