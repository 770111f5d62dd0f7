// 上传分片管理
//
// 分片规则：
// - 分片按固定大小切分，最后一片可以更小
// - 分片范围连续、不重叠，并集恰好为 [0, 文件大小)
// - 空文件不产生分片；小于一个分片大小的文件产生一个分片
// - 是否走分片上传由调度器决定（小文件直接单次上传）

use bit_set::BitSet;
use bytes::Bytes;
use std::ops::Range;
use tracing::debug;

use crate::storage::CommittedPart;

/// 默认分片大小: 5MB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// 分片信息
///
/// `data` 是原始数据的零拷贝切片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    /// 分片索引（从 0 开始，连续）
    pub index: usize,
    /// 起始偏移
    pub start: u64,
    /// 结束偏移（不包含）
    pub end: u64,
    /// 分片数据
    pub data: Bytes,
}

impl ChunkInfo {
    /// 分片大小
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }
}

/// 计算分片数量
pub fn chunk_count(total_size: u64, chunk_size: u64) -> usize {
    total_size.div_ceil(chunk_size.max(1)) as usize
}

/// 切分数据
///
/// 纯函数：同样的数据和分片大小总是得到同样的结果
pub fn split_into_chunks(data: &Bytes, chunk_size: u64) -> Vec<ChunkInfo> {
    let chunk_size = chunk_size.max(1);
    let total_size = data.len() as u64;
    let mut chunks = Vec::with_capacity(chunk_count(total_size, chunk_size));
    let mut offset = 0u64;
    let mut index = 0;

    while offset < total_size {
        let end = std::cmp::min(offset + chunk_size, total_size);
        chunks.push(ChunkInfo {
            index,
            start: offset,
            end,
            data: data.slice(offset as usize..end as usize),
        });
        offset = end;
        index += 1;
    }

    chunks
}

/// 上传分片管理器
///
/// 单个文件一次上传的分片状态，完成情况按索引记录在位集合中
#[derive(Debug)]
pub struct UploadChunkManager {
    /// 所有分片
    chunks: Vec<ChunkInfo>,
    /// 已完成分片
    completed: BitSet,
    /// 正在上传的分片（防止重复调度）
    uploading: BitSet,
    /// 已提交分片的回执，按索引存放
    committed: Vec<Option<CommittedPart>>,
    /// 文件总大小
    total_size: u64,
}

impl UploadChunkManager {
    /// 创建新的上传分片管理器
    pub fn new(data: &Bytes, chunk_size: u64) -> Self {
        let chunks = split_into_chunks(data, chunk_size);
        let count = chunks.len();

        debug!(
            "创建上传分片管理器: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            data.len(),
            chunk_size,
            count
        );

        Self {
            chunks,
            completed: BitSet::with_capacity(count),
            uploading: BitSet::with_capacity(count),
            committed: vec![None; count],
            total_size: data.len() as u64,
        }
    }

    /// 获取下一个待上传的分片（索引升序）
    pub fn next_pending(&self) -> Option<&ChunkInfo> {
        self.chunks
            .iter()
            .find(|c| !self.completed.contains(c.index) && !self.uploading.contains(c.index))
    }

    /// 获取分片数量
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// 获取已完成的分片数量
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// 是否全部完成（每个索引都已提交）
    pub fn is_completed(&self) -> bool {
        self.completed.len() == self.chunks.len()
    }

    /// 标记分片正在上传
    pub fn mark_uploading(&mut self, index: usize) {
        if index < self.chunks.len() {
            self.uploading.insert(index);
        }
    }

    /// 取消分片上传标记（上传失败时调用）
    pub fn unmark_uploading(&mut self, index: usize) {
        self.uploading.remove(index);
    }

    /// 标记分片为已完成
    ///
    /// 重复完成同一个分片只记录一次
    pub fn mark_completed(&mut self, part: CommittedPart) {
        let index = part.index;
        if index >= self.chunks.len() {
            return;
        }
        self.uploading.remove(index);
        self.completed.insert(index);
        self.committed[index] = Some(part);
    }

    /// 已提交分片列表（按索引升序）
    pub fn committed_parts(&self) -> Vec<CommittedPart> {
        self.committed.iter().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn blob(size: usize) -> Bytes {
        Bytes::from((0..size).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    fn part(index: usize, size: u64) -> CommittedPart {
        CommittedPart {
            index,
            staging_key: format!("part-{:05}", index),
            size,
            etag: None,
        }
    }

    #[test]
    fn test_chunk_calculation() {
        // 完整分片
        let chunks = split_into_chunks(&blob(16 * 1024), 4 * 1024);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].range(), 0..4096);
        assert_eq!(chunks[3].range(), 12288..16384);

        // 不完整分片
        let chunks = split_into_chunks(&blob(17 * 1024), 4 * 1024);
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[4].range(), 16384..17408);
        assert_eq!(chunks[4].size(), 1024);
        assert_eq!(chunks[4].data.len(), 1024);
    }

    #[test]
    fn test_small_blob_single_chunk() {
        let data = blob(100);
        let chunks = split_into_chunks(&data, DEFAULT_CHUNK_SIZE);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].range(), 0..100);
        assert_eq!(chunks[0].data, data);
    }

    #[test]
    fn test_empty_blob_no_chunks() {
        assert!(split_into_chunks(&Bytes::new(), 1024).is_empty());
        assert_eq!(chunk_count(0, 1024), 0);
    }

    #[test]
    fn test_zero_chunk_size_is_coerced() {
        let chunks = split_into_chunks(&blob(3), 0);
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn test_split_is_restartable() {
        let data = blob(10_000);
        assert_eq!(split_into_chunks(&data, 777), split_into_chunks(&data, 777));
    }

    proptest! {
        #[test]
        fn prop_chunks_partition_blob(size in 0usize..20_000, chunk_size in 1u64..4_096) {
            let data = blob(size);
            let chunks = split_into_chunks(&data, chunk_size);

            prop_assert_eq!(chunks.len() as u64, (size as u64).div_ceil(chunk_size));

            let mut expected_start = 0u64;
            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.index, i);
                prop_assert_eq!(chunk.start, expected_start);
                prop_assert!(chunk.end > chunk.start);
                prop_assert!(chunk.size() <= chunk_size);
                prop_assert_eq!(&chunk.data[..], &data[chunk.start as usize..chunk.end as usize]);
                expected_start = chunk.end;
            }
            prop_assert_eq!(expected_start, size as u64);
        }
    }

    #[test]
    fn test_out_of_order_completion() {
        let mut manager = UploadChunkManager::new(&blob(16 * 1024), 4 * 1024);
        assert_eq!(manager.completed_count(), 0);

        // 乱序完成
        manager.mark_completed(part(2, 4096));
        manager.mark_completed(part(0, 4096));
        assert_eq!(manager.completed_count(), 2);
        assert!(!manager.is_completed());

        manager.mark_completed(part(3, 4096));
        manager.mark_completed(part(1, 4096));
        assert!(manager.is_completed());

        let indexes: Vec<usize> = manager.committed_parts().iter().map(|p| p.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_duplicate_completion_counted_once() {
        let mut manager = UploadChunkManager::new(&blob(8 * 1024), 4 * 1024);
        manager.mark_completed(part(0, 4096));
        manager.mark_completed(part(0, 4096));
        assert_eq!(manager.completed_count(), 1);
        assert!(!manager.is_completed());
    }

    #[test]
    fn test_next_pending_skips_uploading() {
        let mut manager = UploadChunkManager::new(&blob(16 * 1024), 4 * 1024);

        manager.mark_uploading(0);
        assert_eq!(manager.next_pending().map(|c| c.index), Some(1));

        manager.unmark_uploading(0);
        assert_eq!(manager.next_pending().map(|c| c.index), Some(0));

        manager.mark_completed(part(0, 4096));
        assert_eq!(manager.next_pending().map(|c| c.index), Some(1));
    }
}
