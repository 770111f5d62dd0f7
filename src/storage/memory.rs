// 内存对象存储
//
// DashMap 保存对象，支持原生分片合并，并统计各类调用次数（测试与嵌入场景使用）

use crate::storage::{
    CommittedPart, ObjectStore, PutOptions, PutReceipt, StoreError, StoreResult,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// 内存中的对象
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: Option<String>,
    pub etag: String,
}

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: DashMap<(String, String), StoredObject>,
    put_calls: AtomicUsize,
    finalize_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    sign_calls: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .contains_key(&(bucket.to_string(), key.to_string()))
    }

    /// 指定 bucket 下的所有 key（排序后）
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().0 == bucket)
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn finalize_calls(&self) -> usize {
        self.finalize_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn sign_calls(&self) -> usize {
        self.sign_calls.load(Ordering::SeqCst)
    }

    /// 所有调用总数
    pub fn total_calls(&self) -> usize {
        self.put_calls() + self.finalize_calls() + self.delete_calls() + self.sign_calls()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        options: &PutOptions,
    ) -> StoreResult<PutReceipt> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let etag = format!("{:x}", md5::compute(&data));
        debug!("内存存储写入: {}/{} ({} bytes)", bucket, key, data.len());
        self.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data,
                content_type: options.content_type.clone(),
                etag: etag.clone(),
            },
        );
        Ok(PutReceipt { etag: Some(etag) })
    }

    async fn finalize_multipart(
        &self,
        bucket: &str,
        key: &str,
        parts: &[CommittedPart],
        options: &PutOptions,
    ) -> StoreResult<()> {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);

        let total: u64 = parts.iter().map(|p| p.size).sum();
        let mut buffer = BytesMut::with_capacity(total as usize);
        for part in parts {
            let object = self.get(bucket, &part.staging_key).ok_or_else(|| {
                StoreError::not_found(format!("分片 #{} 不存在: {}", part.index, part.staging_key))
            })?;
            buffer.extend_from_slice(&object.data);
        }

        let data = buffer.freeze();
        let etag = format!("{:x}", md5::compute(&data));
        self.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data,
                content_type: options.content_type.clone(),
                etag,
            },
        );

        for part in parts {
            self.objects
                .remove(&(bucket.to_string(), part.staging_key.clone()));
        }
        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> StoreResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        for key in keys {
            self.objects.remove(&(bucket.to_string(), key.clone()));
        }
        Ok(())
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!("memory://{}/{}", bucket, key)
    }

    async fn create_signed_url(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> StoreResult<String> {
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        if !self.contains(bucket, key) {
            return Err(StoreError::not_found(format!("{}/{}", bucket, key)));
        }
        Ok(format!(
            "memory://{}/{}?expires_in={}",
            bucket,
            key,
            ttl.as_secs()
        ))
    }
}
