//! Auth-profile failover for model calls.
//!
//! Each model carries an ordered list of auth profiles. On `RateLimited`,
//! `AuthExpired`, or `ModelTimeout` the chain advances to the next profile
//! without surfacing the error; the chain is sticky, so the next call starts
//! from the last profile that worked. Exhausting every profile surfaces
//! `ModelUnavailable`.
//!
//! A profile is only retried transparently if it failed before any event
//! reached the caller — once output has streamed, the error surfaces.

use crate::provider::{CompletionRequest, ModelProvider, ProviderEvent};
use openclaw_types::error::{OpenClawError, OpenClawResult};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// One entry in a model's failover chain.
pub struct Profile {
    pub name: String,
    pub provider: Arc<dyn ModelProvider>,
}

/// Ordered profile chain for one model.
pub struct ProfileChain {
    model: String,
    profiles: Vec<Profile>,
    last_used: AtomicUsize,
    call_timeout: Duration,
}

impl ProfileChain {
    pub fn new(model: &str, profiles: Vec<Profile>, call_timeout: Duration) -> Self {
        Self {
            model: model.to_string(),
            profiles,
            last_used: AtomicUsize::new(0),
            call_timeout,
        }
    }

    /// Index of the profile the next call will try first.
    pub fn current_profile(&self) -> usize {
        self.last_used.load(Ordering::Relaxed)
    }

    pub fn profile_count(&self) -> usize {
        self.profiles.len()
    }

    /// Run one streaming call through the chain.
    pub async fn complete_streaming(
        &self,
        request: CompletionRequest,
        events: mpsc::Sender<ProviderEvent>,
        cancel: watch::Receiver<bool>,
    ) -> OpenClawResult<()> {
        if self.profiles.is_empty() {
            return Err(OpenClawError::ModelUnavailable(format!(
                "model `{}` has no auth profiles",
                self.model
            )));
        }

        let start = self.last_used.load(Ordering::Relaxed) % self.profiles.len();
        let mut last_error: Option<OpenClawError> = None;

        for attempt in 0..self.profiles.len() {
            let index = (start + attempt) % self.profiles.len();
            let profile = &self.profiles[index];

            // Count events forwarded downstream so a mid-stream failure is
            // never silently retried against another profile.
            let forwarded = Arc::new(AtomicU64::new(0));
            let (tx, mut rx) = mpsc::channel::<ProviderEvent>(64);
            let downstream = events.clone();
            let counter = forwarded.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    counter.fetch_add(1, Ordering::Relaxed);
                    if downstream.send(event).await.is_err() {
                        break;
                    }
                }
            });

            let result = tokio::time::timeout(
                self.call_timeout,
                profile
                    .provider
                    .complete_streaming(request.clone(), tx, cancel.clone()),
            )
            .await;
            let _ = forwarder.await;

            let error = match result {
                Ok(Ok(())) => {
                    self.last_used.store(index, Ordering::Relaxed);
                    return Ok(());
                }
                Ok(Err(e)) => e,
                Err(_) => OpenClawError::ModelTimeout(self.call_timeout.as_secs()),
            };

            let streamed = forwarded.load(Ordering::Relaxed) > 0;
            if error.is_failover() && !streamed {
                info!(
                    model = %self.model,
                    profile = %profile.name,
                    error = %error,
                    "profile failed — advancing to next"
                );
                last_error = Some(error);
                continue;
            }

            warn!(model = %self.model, profile = %profile.name, error = %error, "model call failed");
            return Err(error);
        }

        Err(OpenClawError::ModelUnavailable(format!(
            "model `{}`: all {} profiles exhausted (last: {})",
            self.model,
            self.profiles.len(),
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use openclaw_types::session::{StopReason, TokenUsage};
    use std::sync::atomic::AtomicUsize;

    /// Provider scripted to fail `fail_times` calls, then succeed.
    struct Flaky {
        name: String,
        calls: AtomicUsize,
        fail_times: usize,
        error: fn() -> OpenClawError,
    }

    #[async_trait]
    impl ModelProvider for Flaky {
        fn name(&self) -> &str {
            &self.name
        }

        async fn complete_streaming(
            &self,
            _request: CompletionRequest,
            events: mpsc::Sender<ProviderEvent>,
            _cancel: watch::Receiver<bool>,
        ) -> OpenClawResult<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err((self.error)());
            }
            let _ = events
                .send(ProviderEvent::TextDelta {
                    text: format!("from {}", self.name),
                })
                .await;
            let _ = events
                .send(ProviderEvent::MessageEnd {
                    stop_reason: StopReason::EndTurn,
                    usage: TokenUsage::default(),
                })
                .await;
            Ok(())
        }
    }

    fn flaky(name: &str, fail_times: usize, error: fn() -> OpenClawError) -> Profile {
        Profile {
            name: name.to_string(),
            provider: Arc::new(Flaky {
                name: name.to_string(),
                calls: AtomicUsize::new(0),
                fail_times,
                error,
            }),
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "m".into(),
            system: String::new(),
            messages: vec![],
            tools: vec![],
            max_tokens: 64,
        }
    }

    async fn run(chain: &ProfileChain) -> (OpenClawResult<()>, Vec<ProviderEvent>) {
        let (tx, mut rx) = mpsc::channel(64);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let result = chain.complete_streaming(request(), tx, cancel_rx).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (result, events)
    }

    #[tokio::test]
    async fn test_rate_limit_advances_silently() {
        let chain = ProfileChain::new(
            "m",
            vec![
                flaky("primary", usize::MAX, || OpenClawError::RateLimited),
                flaky("backup", 0, || OpenClawError::RateLimited),
            ],
            Duration::from_secs(5),
        );
        let (result, events) = run(&chain).await;
        result.unwrap();
        assert!(matches!(
            &events[0],
            ProviderEvent::TextDelta { text } if text == "from backup"
        ));
        // Sticky: next call starts from the profile that worked.
        assert_eq!(chain.current_profile(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_model_unavailable() {
        let chain = ProfileChain::new(
            "m",
            vec![
                flaky("a", usize::MAX, || OpenClawError::RateLimited),
                flaky("b", usize::MAX, || OpenClawError::AuthExpired),
            ],
            Duration::from_secs(5),
        );
        let (result, _) = run(&chain).await;
        assert!(matches!(
            result.unwrap_err(),
            OpenClawError::ModelUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_non_failover_error_surfaces_immediately() {
        let chain = ProfileChain::new(
            "m",
            vec![
                flaky("a", usize::MAX, || {
                    OpenClawError::ModelUnavailable("bad config".into())
                }),
                flaky("b", 0, || OpenClawError::RateLimited),
            ],
            Duration::from_secs(5),
        );
        let (result, events) = run(&chain).await;
        assert!(result.is_err());
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_sticky_profile_reused_on_next_call() {
        let chain = ProfileChain::new(
            "m",
            vec![
                flaky("a", usize::MAX, || OpenClawError::RateLimited),
                flaky("b", 0, || OpenClawError::RateLimited),
            ],
            Duration::from_secs(5),
        );
        let (result, _) = run(&chain).await;
        result.unwrap();
        // Second call goes straight to the working profile.
        let (result, events) = run(&chain).await;
        result.unwrap();
        assert!(matches!(
            &events[0],
            ProviderEvent::TextDelta { text } if text == "from b"
        ));
    }

    #[tokio::test]
    async fn test_empty_chain_is_unavailable() {
        let chain = ProfileChain::new("m", vec![], Duration::from_secs(5));
        let (result, _) = run(&chain).await;
        assert!(matches!(
            result.unwrap_err(),
            OpenClawError::ModelUnavailable(_)
        ));
    }
}
