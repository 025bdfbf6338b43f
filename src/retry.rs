use std::future::Future;
use std::time::Duration;

use log::warn;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{ProviderError, StorageError};
use crate::metrics;

/// 可以交给 [`RetryPolicy`] 重试的错误
pub trait Retryable: Sized + std::fmt::Display {
    fn is_transient(&self) -> bool;

    /// 服务端建议的等待时间
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    fn timed_out() -> Self;

    fn cancelled() -> Self;
}

impl Retryable for ProviderError {
    fn is_transient(&self) -> bool {
        ProviderError::is_transient(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    fn timed_out() -> Self {
        Self::Timeout
    }

    fn cancelled() -> Self {
        Self::Cancelled
    }
}

impl Retryable for StorageError {
    fn is_transient(&self) -> bool {
        StorageError::is_transient(self)
    }

    fn timed_out() -> Self {
        Self::Timeout
    }

    fn cancelled() -> Self {
        Self::Cancelled
    }
}

/// 指数退避重试策略，等待时间带完全随机抖动
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 首次调用之后的最大重试次数
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 单次特征服务调用的超时时间
    pub timeout: Duration,
    /// 单次存储调用的超时时间
    pub storage_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            timeout: Duration::from_secs(30),
            storage_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// 不做任何重试，主要用于测试
    pub fn no_retry() -> Self {
        Self { max_retries: 0, ..Default::default() }
    }

    /// 第 `attempt` 次重试前的等待时间，范围为 `[0, min(max_delay, base_delay * 2^attempt)]`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let cap = self
            .base_delay
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .min(self.max_delay);
        let millis = cap.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=millis))
    }

    /// 调用特征服务，临时错误会被重试
    pub async fn provider<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: &'static str,
        f: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.run(self.timeout, cancel, op, f).await
    }

    /// 调用存储引擎，临时错误会被重试
    pub async fn storage<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: &'static str,
        f: F,
    ) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        self.run(self.storage_timeout, cancel, op, f).await
    }

    /// 单次存储调用，只加超时，不重试
    pub async fn storage_once<T, Fut>(
        &self,
        cancel: &CancellationToken,
        fut: Fut,
    ) -> Result<T, StorageError>
    where
        Fut: Future<Output = Result<T, StorageError>>,
    {
        attempt(self.storage_timeout, cancel, fut).await
    }

    async fn run<T, E, F, Fut>(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
        op: &'static str,
        mut f: F,
    ) -> Result<T, E>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut retries = 0;
        loop {
            let err = match attempt(timeout, cancel, f()).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_transient() || retries >= self.max_retries {
                return Err(err);
            }

            let delay = err.retry_after().unwrap_or_else(|| self.backoff(retries));
            retries += 1;
            warn!("{} 失败，{:?} 后第 {} 次重试: {}", op, delay, retries, err);
            metrics::inc_retry(op);

            tokio::select! {
                _ = cancel.cancelled() => return Err(E::cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

async fn attempt<T, E, Fut>(timeout: Duration, cancel: &CancellationToken, fut: Fut) -> Result<T, E>
where
    E: Retryable,
    Fut: Future<Output = Result<T, E>>,
{
    if cancel.is_cancelled() {
        return Err(E::cancelled());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(E::cancelled()),
        result = tokio::time::timeout(timeout, fut) => match result {
            Ok(result) => result,
            Err(_) => Err(E::timed_out()),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            timeout: Duration::from_millis(200),
            storage_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_backoff_bounds() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            ..Default::default()
        };
        for attempt in 0..40 {
            let cap = Duration::from_millis(100 * 2u64.pow(attempt.min(10))).min(policy.max_delay);
            assert!(policy.backoff(attempt) <= cap);
        }
    }

    #[tokio::test]
    async fn test_retry_transient_then_ok() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result = fast_policy(3)
            .provider(&cancel, "test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::Unavailable("503".into()))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<(), _> = fast_policy(2)
            .provider(&cancel, "test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::RateLimited { retry_after: None })
            })
            .await;
        assert!(matches!(result, Err(ProviderError::RateLimited { .. })));
        // 首次调用 + 2 次重试
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<(), _> = fast_policy(5)
            .provider(&cancel, "test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Auth("401".into()))
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let mut policy = fast_policy(1);
        policy.timeout = Duration::from_millis(10);
        let result: Result<(), _> = policy
            .provider(&cancel, "test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), StorageError> =
            fast_policy(3).storage(&cancel, "test", || async { Ok(()) }).await;
        assert!(matches!(result, Err(StorageError::Cancelled)));
    }
}
