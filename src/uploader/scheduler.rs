// 传输调度器
//
// 单个文件的一次传输：
// - 不超过一个分片大小的数据直接单次上传到最终 key
// - 更大的数据切分后上传到暂存 key `.staging/<upload_id>/part-<index:05>`，
//   全部提交后按索引顺序合并到最终 key
// - 先获取信号量许可再派发分片，任何时刻在途分片数不超过 max_concurrent
// - 任一分片失败（重试耗尽或不可重试）立即中止其余分片、清理暂存、不合并

use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::storage::{
    CommittedPart, ObjectStore, PutOptions, PutReceipt, StoreError, StoreResult, STAGING_PREFIX,
};
use crate::uploader::chunk::UploadChunkManager;
use crate::uploader::error::TransferError;
use crate::uploader::progress::ProgressReporter;
use crate::uploader::retry::{RetryError, RetryPolicy};
use crate::uploader::UploadSettings;

/// 一次传输的请求
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// 物理存储桶名
    pub bucket: String,
    /// 最终 key
    pub key: String,
    pub data: Bytes,
    pub content_type: String,
}

/// 传输结果
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOutcome {
    pub key: String,
    /// 分片上传时的暂存 ID，单次上传为 None
    pub upload_id: Option<String>,
    /// 分片数量（单次上传为 0）
    pub chunk_count: usize,
    /// 单次上传的 etag
    pub etag: Option<String>,
    pub bytes: u64,
    pub elapsed: Duration,
}

impl TransferOutcome {
    /// 平均速度 (bytes/s)
    pub fn speed(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.bytes as f64 / secs) as u64
        } else {
            0
        }
    }
}

/// 暂存分片 key
pub fn staging_key(upload_id: &str, index: usize) -> String {
    format!("{}{}/part-{:05}", STAGING_PREFIX, upload_id, index)
}

/// 分片任务的返回值
///
/// 许可随结果一起返回，由调度循环处理完结果后才释放，保证派发决策不会超额
struct ChunkOutcome {
    index: usize,
    size: u64,
    staging_key: String,
    result: Result<PutReceipt, RetryError<StoreError>>,
    _permit: OwnedSemaphorePermit,
}

/// 带单次超时的 put，超时视为可重试的 Timeout
async fn put_with_timeout(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    data: Bytes,
    options: &PutOptions,
    timeout: Duration,
) -> StoreResult<PutReceipt> {
    match tokio::time::timeout(timeout, store.put_object(bucket, key, data, options)).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::timeout(format!(
            "请求超时 ({}ms): {}",
            timeout.as_millis(),
            key
        ))),
    }
}

fn is_retriable(e: &StoreError) -> bool {
    e.is_retriable()
}

/// 传输调度器
#[derive(Clone)]
pub struct TransferScheduler {
    store: Arc<dyn ObjectStore>,
    chunk_size: u64,
    max_concurrent: usize,
    retry: RetryPolicy,
    settings: Arc<UploadSettings>,
}

impl TransferScheduler {
    pub fn new(store: Arc<dyn ObjectStore>, settings: Arc<UploadSettings>) -> Self {
        Self {
            store,
            chunk_size: settings.chunk_size.max(1),
            max_concurrent: settings.max_concurrent_uploads.max(1),
            retry: settings.retry_policy(),
            settings,
        }
    }

    /// 执行一次传输
    ///
    /// # 参数
    /// * `request` - 目标与数据
    /// * `reporter` - 进度汇报（只累加已提交字节，不发布终态）
    /// * `cancel` - 取消令牌
    pub async fn transfer(
        &self,
        request: &TransferRequest,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let size = request.data.len() as u64;
        if size <= self.chunk_size {
            self.upload_single(request, reporter, cancel).await
        } else {
            self.upload_chunked(request, reporter, cancel).await
        }
    }

    /// 小文件单次上传
    async fn upload_single(
        &self,
        request: &TransferRequest,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        let started = Instant::now();
        let size = request.data.len() as u64;
        let options = PutOptions::with_content_type(request.content_type.clone());
        let timeout = self.settings.attempt_timeout(size);
        let store = self.store.as_ref();

        debug!("单次上传: {} ({} bytes)", request.key, size);

        let receipt = self
            .retry
            .execute(&request.key, cancel, is_retriable, || {
                put_with_timeout(
                    store,
                    &request.bucket,
                    &request.key,
                    request.data.clone(),
                    &options,
                    timeout,
                )
            })
            .await
            .map_err(|e| match e {
                RetryError::Cancelled => TransferError::Cancelled,
                RetryError::Terminal(source) => TransferError::Single {
                    attempts: 1,
                    source,
                },
                RetryError::Exhausted { attempts, last } => TransferError::Single {
                    attempts,
                    source: last,
                },
            })?;

        reporter.advance(size);

        let outcome = TransferOutcome {
            key: request.key.clone(),
            upload_id: None,
            chunk_count: 0,
            etag: receipt.etag,
            bytes: size,
            elapsed: started.elapsed(),
        };
        info!(
            "上传完成: {} ({} bytes, {} bytes/s)",
            request.key,
            size,
            outcome.speed()
        );
        Ok(outcome)
    }

    /// 分片并发上传 + 合并
    async fn upload_chunked(
        &self,
        request: &TransferRequest,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        let started = Instant::now();
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        let mut manager = UploadChunkManager::new(&request.data, self.chunk_size);
        let chunk_count = manager.chunk_count();

        info!(
            "[分片上传] {} 开始: {} bytes, {} 个分片, 并发数 {}, upload_id={}",
            request.key,
            manager.total_size(),
            chunk_count,
            self.max_concurrent,
            upload_id
        );

        // 分片任务使用子令牌，失败时只取消本次传输
        let chunk_cancel = cancel.child_token();
        let options = PutOptions::with_content_type(request.content_type.clone());
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut join_set: JoinSet<ChunkOutcome> = JoinSet::new();
        let mut dispatched: Vec<String> = Vec::with_capacity(chunk_count);
        let mut failure: Option<TransferError> = None;

        // 按索引升序派发
        loop {
            if cancel.is_cancelled() {
                failure = Some(TransferError::Cancelled);
                break;
            }

            // 先处理已结束的分片，尽早发现失败
            while let Some(joined) = join_set.try_join_next() {
                if let Err(e) = Self::handle_chunk_result(joined, &mut manager, reporter) {
                    failure = Some(e);
                    break;
                }
            }
            if failure.is_some() {
                break;
            }

            let Some(chunk) = manager.next_pending().cloned() else {
                break;
            };

            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    // 并发已满：等待一个分片结束后重新调度
                    let joined = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            failure = Some(TransferError::Cancelled);
                            break;
                        }
                        joined = join_set.join_next() => joined,
                    };
                    if let Some(joined) = joined {
                        if let Err(e) = Self::handle_chunk_result(joined, &mut manager, reporter) {
                            failure = Some(e);
                            break;
                        }
                    }
                    continue;
                }
            };

            manager.mark_uploading(chunk.index);
            let key = staging_key(&upload_id, chunk.index);
            dispatched.push(key.clone());

            let store = self.store.clone();
            let bucket = request.bucket.clone();
            let options = options.clone();
            let retry = self.retry;
            let task_cancel = chunk_cancel.clone();
            let timeout = self.settings.attempt_timeout(chunk.size());

            debug!(
                "[分片上传] 派发分片 #{} ({}..{}) -> {}",
                chunk.index, chunk.start, chunk.end, key
            );

            join_set.spawn(async move {
                let label = format!("分片 #{}", chunk.index);
                let result = retry
                    .execute(&label, &task_cancel, is_retriable, || {
                        put_with_timeout(
                            store.as_ref(),
                            &bucket,
                            &key,
                            chunk.data.clone(),
                            &options,
                            timeout,
                        )
                    })
                    .await;
                ChunkOutcome {
                    index: chunk.index,
                    size: chunk.size(),
                    staging_key: key,
                    result,
                    _permit: permit,
                }
            });
        }

        // 等待剩余分片
        if failure.is_none() {
            loop {
                let joined = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        failure = Some(TransferError::Cancelled);
                        break;
                    }
                    joined = join_set.join_next() => joined,
                };
                let Some(joined) = joined else {
                    break;
                };
                if let Err(e) = Self::handle_chunk_result(joined, &mut manager, reporter) {
                    failure = Some(e);
                    break;
                }
            }
        }

        if failure.is_none() && !manager.is_completed() {
            failure = Some(TransferError::Task(format!(
                "分片未全部完成: {}/{}",
                manager.completed_count(),
                chunk_count
            )));
        }

        if let Some(err) = failure {
            chunk_cancel.cancel();
            join_set.abort_all();
            // 等待被中止的任务真正结束，避免清理之后还有写入
            while join_set.join_next().await.is_some() {}
            if err.is_cancelled() {
                info!("[分片上传] {} 已取消，清理暂存分片", request.key);
            } else {
                error!("[分片上传] {} 失败: {}", request.key, err);
            }
            self.cleanup(&request.bucket, &dispatched).await;
            return Err(err);
        }

        // 全部分片提交，按索引合并
        let parts = manager.committed_parts();
        debug!(
            "[分片上传] {} 所有 {} 个分片已提交，开始合并",
            request.key,
            parts.len()
        );
        if let Err(e) = self.finalize(request, &parts, &options, cancel).await {
            self.cleanup(&request.bucket, &dispatched).await;
            return Err(e);
        }

        let outcome = TransferOutcome {
            key: request.key.clone(),
            upload_id: Some(upload_id),
            chunk_count,
            etag: None,
            bytes: manager.total_size(),
            elapsed: started.elapsed(),
        };
        info!(
            "[分片上传] {} 完成: {} 个分片, {} bytes, 耗时 {}ms, {} bytes/s",
            request.key,
            chunk_count,
            outcome.bytes,
            outcome.elapsed.as_millis(),
            outcome.speed()
        );
        Ok(outcome)
    }

    /// 合并分片（合并请求本身也按策略重试）
    async fn finalize(
        &self,
        request: &TransferRequest,
        parts: &[CommittedPart],
        options: &PutOptions,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let store = self.store.as_ref();
        let label = format!("合并 {}", request.key);
        let result = self
            .retry
            .execute(&label, cancel, is_retriable, || {
                store.finalize_multipart(&request.bucket, &request.key, parts, options)
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(RetryError::Cancelled) => {
                // 合并可能已在服务端生效
                self.cleanup(&request.bucket, std::slice::from_ref(&request.key))
                    .await;
                Err(TransferError::Cancelled)
            }
            Err(RetryError::Terminal(e)) | Err(RetryError::Exhausted { last: e, .. }) => {
                Err(TransferError::Finalize(e))
            }
        }
    }

    /// 处理一个分片任务的结果
    fn handle_chunk_result(
        joined: Result<ChunkOutcome, JoinError>,
        manager: &mut UploadChunkManager,
        reporter: &ProgressReporter,
    ) -> Result<(), TransferError> {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => return Err(TransferError::Cancelled),
            Err(e) => {
                error!("分片任务异常: {}", e);
                return Err(TransferError::Task(e.to_string()));
            }
        };

        match outcome.result {
            Ok(receipt) => {
                debug!(
                    "[分片上传] 分片 #{} 已提交 ({} bytes)",
                    outcome.index, outcome.size
                );
                manager.mark_completed(CommittedPart {
                    index: outcome.index,
                    staging_key: outcome.staging_key,
                    size: outcome.size,
                    etag: receipt.etag,
                });
                reporter.advance(outcome.size);
                Ok(())
            }
            Err(RetryError::Cancelled) => {
                manager.unmark_uploading(outcome.index);
                Err(TransferError::Cancelled)
            }
            Err(RetryError::Terminal(source)) => Err(TransferError::Chunk {
                index: outcome.index,
                attempts: 1,
                source,
            }),
            Err(RetryError::Exhausted { attempts, last }) => Err(TransferError::Chunk {
                index: outcome.index,
                attempts,
                source: last,
            }),
        }
    }

    /// 尽力删除暂存对象，失败只记录日志
    async fn cleanup(&self, bucket: &str, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        match self.store.delete_objects(bucket, keys).await {
            Ok(()) => debug!("已清理 {} 个暂存对象", keys.len()),
            Err(e) => warn!("清理暂存对象失败（忽略）: {}", e),
        }
    }
}
