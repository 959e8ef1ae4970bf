//! Retrying façade over a [`StackProvider`]
//!
//! Throttling and transient network faults are replayed here with a fixed
//! delay so the scheduler and executors never see them. Everything else
//! passes through untouched.

use super::{ProviderResult, StackDescription, StackEvent, StackProvider};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Fixed delay between attempts.
    pub delay: Duration,
    /// `None` keeps retrying until the call lands.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(3),
            max_attempts: None,
        }
    }
}

pub struct RetryingProvider<P> {
    inner: P,
    policy: RetryPolicy,
}

impl<P: StackProvider> RetryingProvider<P> {
    pub fn new(inner: P) -> Self {
        Self::with_policy(inner, RetryPolicy::default())
    }

    pub fn with_policy(inner: P, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn run<T, F, Fut>(&self, op: &'static str, mut call: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match call().await {
                Err(err) if err.is_retryable() => {
                    attempt += 1;
                    if let Some(max) = self.policy.max_attempts {
                        if attempt >= max {
                            return Err(err);
                        }
                    }
                    debug!(op, attempt, error = %err, "Retrying throttled control-plane call");
                    tokio::time::sleep(self.policy.delay).await;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<P: StackProvider> StackProvider for RetryingProvider<P> {
    async fn describe_stack(&self, region: &str, name: &str) -> ProviderResult<StackDescription> {
        self.run("describe_stack", || self.inner.describe_stack(region, name))
            .await
    }

    async fn describe_stack_events(
        &self,
        region: &str,
        name: &str,
    ) -> ProviderResult<Vec<StackEvent>> {
        self.run("describe_stack_events", || {
            self.inner.describe_stack_events(region, name)
        })
        .await
    }

    async fn get_template(&self, region: &str, name: &str) -> ProviderResult<String> {
        self.run("get_template", || self.inner.get_template(region, name))
            .await
    }

    async fn list_imports(&self, region: &str, export_name: &str) -> ProviderResult<Vec<String>> {
        self.run("list_imports", || self.inner.list_imports(region, export_name))
            .await
    }

    async fn create_stack(&self, region: &str, request: &serde_json::Value) -> ProviderResult<()> {
        self.run("create_stack", || self.inner.create_stack(region, request))
            .await
    }

    async fn update_stack(&self, region: &str, request: &serde_json::Value) -> ProviderResult<()> {
        self.run("update_stack", || self.inner.update_stack(region, request))
            .await
    }

    async fn delete_stack(&self, region: &str, name: &str) -> ProviderResult<()> {
        self.run("delete_stack", || self.inner.delete_stack(region, name))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::StackStatus;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `failures` times with the given error, then succeeds.
    struct FlakyProvider {
        failures: u32,
        error: ProviderError,
        calls: AtomicU32,
    }

    impl FlakyProvider {
        fn new(failures: u32, error: ProviderError) -> Self {
            Self {
                failures,
                error,
                calls: AtomicU32::new(0),
            }
        }

        fn description() -> StackDescription {
            StackDescription {
                name: "app-dev-net".into(),
                status: StackStatus::new("CREATE_COMPLETE"),
                creation_time: None,
                last_updated_time: None,
                outputs: vec![],
            }
        }
    }

    #[async_trait]
    impl StackProvider for FlakyProvider {
        async fn describe_stack(&self, _: &str, _: &str) -> ProviderResult<StackDescription> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(Self::description())
            }
        }

        async fn describe_stack_events(&self, _: &str, _: &str) -> ProviderResult<Vec<StackEvent>> {
            Ok(vec![])
        }

        async fn get_template(&self, _: &str, _: &str) -> ProviderResult<String> {
            Ok("{}".into())
        }

        async fn list_imports(&self, _: &str, _: &str) -> ProviderResult<Vec<String>> {
            Ok(vec![])
        }

        async fn create_stack(&self, _: &str, _: &serde_json::Value) -> ProviderResult<()> {
            Ok(())
        }

        async fn update_stack(&self, _: &str, _: &serde_json::Value) -> ProviderResult<()> {
            Ok(())
        }

        async fn delete_stack(&self, _: &str, _: &str) -> ProviderResult<()> {
            Ok(())
        }
    }

    fn fast_policy(max_attempts: Option<u32>) -> RetryPolicy {
        RetryPolicy {
            delay: Duration::from_millis(1),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn throttling_is_invisible_to_callers() {
        let provider = RetryingProvider::with_policy(
            FlakyProvider::new(3, ProviderError::Throttled),
            fast_policy(None),
        );
        let desc = provider.describe_stack("us-east-1", "app-dev-net").await.unwrap();
        assert_eq!(desc.name, "app-dev-net");
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_retryable_errors_pass_through() {
        let provider = RetryingProvider::with_policy(
            FlakyProvider::new(3, ProviderError::StackNotFound("app-dev-net".into())),
            fast_policy(None),
        );
        let err = provider.describe_stack("us-east-1", "app-dev-net").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempt_cap_surfaces_the_error() {
        let provider = RetryingProvider::with_policy(
            FlakyProvider::new(10, ProviderError::Timeout),
            fast_policy(Some(2)),
        );
        let err = provider.describe_stack("us-east-1", "app-dev-net").await.unwrap_err();
        assert_eq!(err, ProviderError::Timeout);
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 2);
    }
}
