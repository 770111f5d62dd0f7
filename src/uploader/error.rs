// 上传错误类型
//
// TransferError 由调度器产生，UploadError 由门面产生；
// 门面最终把 UploadError 转换为 UploadResult，不向调用方抛出

use crate::storage::StoreError;
use thiserror::Error;

/// 传输错误（单个文件的一次传输）
#[derive(Debug, Error)]
pub enum TransferError {
    /// 某个分片失败（重试耗尽或不可重试）
    #[error("分片 #{index} 上传失败（已尝试 {attempts} 次）: {source}")]
    Chunk {
        index: usize,
        attempts: u32,
        #[source]
        source: StoreError,
    },
    /// 小文件单次上传失败
    #[error("上传失败（已尝试 {attempts} 次）: {source}")]
    Single {
        attempts: u32,
        #[source]
        source: StoreError,
    },
    /// 合并分片失败
    #[error("合并分片失败: {0}")]
    Finalize(#[source] StoreError),
    #[error("上传已取消")]
    Cancelled,
    /// 分片任务 panic 或被中止
    #[error("分片任务异常: {0}")]
    Task(String),
}

impl TransferError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }

    /// 失败的分片索引
    pub fn chunk_index(&self) -> Option<usize> {
        match self {
            TransferError::Chunk { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// 上传错误（门面层）
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("文件过大: {size} bytes，上限 {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },
    #[error("不支持的文件类型: {0}")]
    DisallowedMimeType(String),
    #[error("未知的存储桶: {0}")]
    UnknownBucket(String),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("获取访问地址失败: {0}")]
    UrlResolution(#[source] StoreError),
    #[error("删除失败: {0}")]
    Delete(#[source] StoreError),
    #[error("上传已取消")]
    Cancelled,
}

impl UploadError {
    /// 是否为校验错误（发生在任何网络请求之前）
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            UploadError::FileTooLarge { .. }
                | UploadError::DisallowedMimeType(_)
                | UploadError::UnknownBucket(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            UploadError::Cancelled => true,
            UploadError::Transfer(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_error_names_index() {
        let err = TransferError::Chunk {
            index: 2,
            attempts: 1,
            source: StoreError::forbidden("denied"),
        };
        assert_eq!(err.chunk_index(), Some(2));
        assert!(err.to_string().contains("#2"));
    }

    #[test]
    fn test_classification() {
        assert!(UploadError::FileTooLarge { size: 2, limit: 1 }.is_validation());
        assert!(UploadError::UnknownBucket("x".into()).is_validation());
        assert!(!UploadError::Cancelled.is_validation());
        assert!(UploadError::Transfer(TransferError::Cancelled).is_cancelled());
        assert!(UploadError::Cancelled.is_cancelled());
    }
}
