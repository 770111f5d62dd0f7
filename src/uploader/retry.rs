// 重试策略
//
// - 最多重试 max_retries 次（总调用次数 max_retries + 1）
// - 指数退避：base, base*2, base*4 ...，上限 max_delay
// - 不可重试的错误第一次出现就直接返回，不消耗重试次数
// - 每次重试等待完整的退避时间，不扣除失败那次请求耗费的时间
// - 等待和请求都与取消令牌竞争，取消立即生效

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 默认最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 默认初始退避延迟（毫秒）
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;

/// 默认最大退避延迟（毫秒）
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;

/// 重试失败
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("操作已取消")]
    Cancelled,
    /// 不可重试的错误
    #[error("{0}")]
    Terminal(E),
    /// 重试次数用尽
    #[error("重试 {attempts} 次后仍失败: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }
}

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// 计算第 retry 次重试前的等待时间
    ///
    /// # 延迟序列（base=1000ms）
    /// - retry=0: 1000ms
    /// - retry=1: 2000ms
    /// - retry=2: 4000ms
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// 执行操作，失败时按策略重试
    ///
    /// # 参数
    /// * `label` - 日志标签
    /// * `cancel` - 取消令牌
    /// * `classify` - 判断错误是否可重试
    /// * `op` - 无参异步操作，每次尝试调用一次
    pub async fn execute<T, E, F, Fut, C>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        classify: C,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: Display,
    {
        let mut retry = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                result = op() => result,
            };

            let error = match result {
                Ok(value) => {
                    if retry > 0 {
                        debug!("[{}] 第 {} 次重试成功", label, retry);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !classify(&error) {
                warn!("[{}] 失败（不可重试）: {}", label, error);
                return Err(RetryError::Terminal(error));
            }

            if retry >= self.max_retries {
                warn!(
                    "[{}] 失败，已达最大重试次数 ({}): {}",
                    label, self.max_retries, error
                );
                return Err(RetryError::Exhausted {
                    attempts: retry + 1,
                    last: error,
                });
            }

            let delay = self.backoff_delay(retry);
            warn!(
                "[{}] 失败，等待 {}ms 后重试 ({}/{}): {}",
                label,
                delay.as_millis(),
                retry + 1,
                self.max_retries,
                error
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            retry += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    enum TestError {
        Transient,
        Fatal,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    fn is_transient(e: &TestError) -> bool {
        *e == TestError::Transient
    }

    #[test]
    fn test_backoff_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(60_000)); // 超过最大值
        assert_eq!(policy.backoff_delay(40), Duration::from_millis(60_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let c = calls.clone();
        let result = policy
            .execute("test", &cancel, is_transient, move || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(TestError::Transient)
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_exhausts_budget() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let c = calls.clone();
        let result: Result<(), _> = policy
            .execute("test", &cancel, is_transient, move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Transient)
                }
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last, TestError::Transient);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), DEFAULT_MAX_RETRIES + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_not_retried() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let c = calls.clone();
        let result: Result<(), _> = policy
            .execute("test", &cancel, is_transient, move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Fatal)
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Terminal(TestError::Fatal))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_double() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        let attempts = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let a = attempts.clone();
        let _: Result<(), _> = policy
            .execute("test", &cancel, is_transient, move || {
                let a = a.clone();
                async move {
                    a.lock().push(Instant::now());
                    // 失败前先消耗一段时间，退避不应扣除这段时间
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Err(TestError::Transient)
                }
            })
            .await;

        let attempts = attempts.lock();
        assert_eq!(attempts.len(), 4);
        let waits: Vec<u128> = attempts
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis() - 300)
            .collect();
        assert_eq!(waits, vec![1000, 2000, 4000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_backoff_wait() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let c = calls.clone();
        let result: Result<(), _> = policy
            .execute("test", &cancel, is_transient, move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Transient)
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // 在第一次 1000ms 退避结束前就返回了
        assert!(start.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_in_flight_attempt() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let result: Result<(), RetryError<TestError>> = policy
            .execute("test", &cancel, is_transient, || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await;

        assert!(result.unwrap_err().is_cancelled());
    }
}
