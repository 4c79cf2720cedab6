//! 有界重试 + 指数退避
//!
//! 源码拉取和容器运行时调用统一使用这一个工具

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// 重试策略
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// 最大尝试次数（含首次）
    pub max_attempts: u32,
    /// 首次退避时间
    pub initial_delay: Duration,
    /// 退避上限
    pub max_delay: Duration,
    /// 退避倍数
    pub multiplier: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: Duration::from_secs(60),
            multiplier: 2,
        }
    }

    /// 不重试
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// 第 `attempt` 次失败后的退避时间（attempt 从 1 开始）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// 重试最终失败
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub error: E,
    pub attempts: u32,
    /// 退避期间被取消
    pub cancelled: bool,
}

/// 执行 `op`，对 `is_transient` 判定为瞬时的错误按策略退避重试
///
/// 非瞬时错误立即返回；取消令牌触发时在退避阶段中止
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    cancel: &CancellationToken,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= policy.max_attempts || !is_transient(&error) {
                    return Err(RetryFailure {
                        error,
                        attempts: attempt,
                        cancelled: false,
                    });
                }

                let delay = policy.delay_for(attempt);
                warn!(
                    operation = operation,
                    attempt = attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient failure, retrying"
                );

                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(RetryFailure { error, attempts: attempt, cancelled: true });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_grows_and_caps() {
        let mut policy = RetryPolicy::new(5, Duration::from_millis(100));
        policy.max_delay = Duration::from_millis(350);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let result: Result<u32, RetryFailure<String>> = retry(
            &policy,
            "test",
            &CancellationToken::new(),
            |_| true,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err("flaky".to_string())
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let result: Result<(), RetryFailure<String>> = retry(
            &policy,
            "test",
            &CancellationToken::new(),
            |e: &String| e != "fatal",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal".to_string()) }
            },
        )
        .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert!(!failure.cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = RetryPolicy::new(5, Duration::from_secs(30));
        let result: Result<(), RetryFailure<String>> =
            retry(&policy, "test", &cancel, |_| true, |_| async {
                Err("flaky".to_string())
            })
            .await;

        let failure = result.unwrap_err();
        assert!(failure.cancelled);
        assert_eq!(failure.attempts, 1);
    }
}
