//! 上传进度
//!
//! 进度通过回调推送给调用方：
//! - 百分比单调不减
//! - 中间事件按时间节流，避免事件风暴
//! - 每次上传恰好一个终态事件（complete / error），终态之后的更新全部丢弃

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 进度状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploading,
    /// 压缩 / 缩略图 / 合并阶段
    Processing,
    Complete,
    Error,
}

impl UploadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Complete | UploadStatus::Error)
    }
}

/// 进度事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadProgress {
    pub file_name: String,
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub percentage: f64,
    pub status: UploadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 计算百分比，结果限制在 [0, 100]
pub fn percentage(bytes_uploaded: u64, total_bytes: u64) -> f64 {
    if total_bytes == 0 {
        return 0.0;
    }
    (bytes_uploaded as f64 / total_bytes as f64 * 100.0).clamp(0.0, 100.0)
}

/// 进度回调
pub type ProgressCallback = Arc<dyn Fn(UploadProgress) + Send + Sync>;

/// 进度事件节流器
///
/// 使用原子操作记录上次发布时间，`should_emit()` 返回 true 时才发布事件
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 基准时间
    origin: Instant,
    /// 上次发布事件的时间（相对基准的纳秒数，0 表示从未发布）
    last_emit_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 距离上次发布超过节流间隔时返回 true 并更新时间戳
    pub fn should_emit(&self) -> bool {
        if self.interval_nanos == 0 {
            return true;
        }
        // +1 保证第一次调用总是发布
        let now = self.origin.elapsed().as_nanos() as u64 + 1;
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last != 0 && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }
        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制发布（状态切换、终态）
    pub fn force_emit(&self) {
        let now = self.origin.elapsed().as_nanos() as u64 + 1;
        self.last_emit_nanos.store(now, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct ReporterState {
    total_bytes: u64,
    bytes_uploaded: u64,
    status: UploadStatus,
    finished: bool,
}

/// 单个文件的进度汇总器
///
/// 回调在锁内调用，保证多个分片任务并发汇报时事件顺序与百分比一致。
/// 回调里不要再调用同一个 reporter。
pub struct ProgressReporter {
    file_name: String,
    callback: Option<ProgressCallback>,
    throttler: ProgressThrottler,
    state: Mutex<ReporterState>,
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("file_name", &self.file_name)
            .field("has_callback", &self.callback.is_some())
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl ProgressReporter {
    pub fn new(
        file_name: impl Into<String>,
        total_bytes: u64,
        callback: Option<ProgressCallback>,
        throttle_interval: Duration,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            callback,
            throttler: ProgressThrottler::new(throttle_interval),
            state: Mutex::new(ReporterState {
                total_bytes,
                bytes_uploaded: 0,
                status: UploadStatus::Pending,
                finished: false,
            }),
        }
    }

    /// 不推送事件的汇报器（缩略图等附属上传使用）
    pub fn silent(file_name: impl Into<String>, total_bytes: u64) -> Self {
        Self::new(file_name, total_bytes, None, Duration::ZERO)
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.state.lock().bytes_uploaded
    }

    pub fn status(&self) -> UploadStatus {
        self.state.lock().status
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// 更新总大小（压缩后大小变化），已上传字节数归零前不可调用
    pub fn set_total(&self, total_bytes: u64) {
        let mut state = self.state.lock();
        if !state.finished && state.bytes_uploaded == 0 {
            state.total_bytes = total_bytes;
        }
    }

    /// 切换状态并立即发布
    pub fn set_status(&self, status: UploadStatus) {
        let mut state = self.state.lock();
        if state.finished || status.is_terminal() {
            return;
        }
        state.status = status;
        self.throttler.force_emit();
        self.emit(&state, None);
    }

    /// 分片提交后累加字节数（节流发布）
    pub fn advance(&self, committed: u64) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.bytes_uploaded = state
            .bytes_uploaded
            .saturating_add(committed)
            .min(state.total_bytes);
        state.status = UploadStatus::Uploading;

        let reached_end = state.bytes_uploaded == state.total_bytes;
        if reached_end {
            self.throttler.force_emit();
            self.emit(&state, None);
        } else if self.throttler.should_emit() {
            self.emit(&state, None);
        }
    }

    /// 终态：完成
    pub fn complete(&self) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.finished = true;
        state.status = UploadStatus::Complete;
        state.bytes_uploaded = state.total_bytes;
        self.emit(&state, None);
    }

    /// 终态：失败（已上传字节数保持不变，百分比不回退）
    pub fn fail(&self, error: impl Into<String>) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.finished = true;
        state.status = UploadStatus::Error;
        self.emit(&state, Some(error.into()));
    }

    fn emit(&self, state: &ReporterState, error: Option<String>) {
        let Some(callback) = &self.callback else {
            return;
        };
        let percentage = if state.status == UploadStatus::Complete {
            100.0
        } else {
            percentage(state.bytes_uploaded, state.total_bytes)
        };
        callback(UploadProgress {
            file_name: self.file_name.clone(),
            bytes_uploaded: state.bytes_uploaded,
            total_bytes: state.total_bytes,
            percentage,
            status: state.status,
            error,
        });
    }
}
