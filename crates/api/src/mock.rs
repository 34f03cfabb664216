//! A deterministic mock backend.
//!
//! The `mock` provider family serves two purposes: it is the reference
//! implementation the integration suites drive the engine against, and a
//! real (if trivial) provider for environments with no other backend. All
//! behavior is scripted at construction; nothing here is time-dependent
//! unless a token delay is explicitly configured.

use crate::provider::{
    DetectResult, GenerateParams, GenerateResult, PrivacyClaim, ProgressSender, Provider,
    ProviderSupports, TokenSender,
};
use async_trait::async_trait;
use axon_types::config::EngineConfig;
use axon_types::error::EngineError;
use axon_types::model::{ModelSpec, ProviderId};
use axon_types::protocol::{DownloadProgress, FinishReason, TokenChunk};
use axon_types::state::DownloadVariant;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// Scripted download behavior for `init`.
#[derive(Debug, Clone, Copy)]
pub struct MockDownload {
    /// Total bytes to report; `None` makes the download indeterminate.
    pub total_bytes: Option<u64>,
    /// Number of progress snapshots to push before completion.
    pub chunks: u32,
}

/// A fully scripted inference backend.
#[derive(Debug)]
pub struct MockProvider {
    id: ProviderId,
    available: bool,
    detect_reason: String,
    privacy_claim: Option<PrivacyClaim>,
    supports: ProviderSupports,
    script: Vec<String>,
    token_delay: Duration,
    hang_after: Option<usize>,
    remaining_failures: AtomicU32,
    failure: Option<EngineError>,
    init_failures: AtomicU32,
    download: Option<MockDownload>,
    ping_result: Result<(), EngineError>,
    ping_hangs: bool,
    aborted: AtomicBool,
    abort_notify: Notify,
    init_calls: AtomicU32,
    teardown_calls: AtomicU32,
    attempt_budgets: Mutex<Vec<u32>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    /// An available mock streaming a short fixed script.
    pub fn new() -> Self {
        Self {
            id: ProviderId::new("mock"),
            available: true,
            detect_reason: "mock backend always available".to_string(),
            privacy_claim: Some(PrivacyClaim::OnDeviceClaimed),
            supports: ProviderSupports::default(),
            script: vec![
                "Hello".to_string(),
                ", ".to_string(),
                "world".to_string(),
                "!".to_string(),
            ],
            token_delay: Duration::ZERO,
            hang_after: None,
            remaining_failures: AtomicU32::new(0),
            failure: None,
            init_failures: AtomicU32::new(0),
            download: None,
            ping_result: Ok(()),
            ping_hangs: false,
            aborted: AtomicBool::new(false),
            abort_notify: Notify::new(),
            init_calls: AtomicU32::new(0),
            teardown_calls: AtomicU32::new(0),
            attempt_budgets: Mutex::new(Vec::new()),
        }
    }

    /// Overrides the token script.
    pub fn with_script<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script = tokens.into_iter().map(Into::into).collect();
        self
    }

    /// Sleeps this long after each emitted token.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Emits `n` tokens, then blocks until aborted.
    pub fn with_hang_after(mut self, n: usize) -> Self {
        self.hang_after = Some(n);
        self
    }

    /// Fails the first `n` generate calls with a clone of `error`.
    pub fn failing_attempts(mut self, n: u32, error: EngineError) -> Self {
        self.remaining_failures = AtomicU32::new(n);
        self.failure = Some(error);
        self
    }

    /// Fails the first `n` init calls.
    pub fn failing_inits(mut self, n: u32) -> Self {
        self.init_failures = AtomicU32::new(n);
        self
    }

    /// Simulates a weights download during `init`.
    pub fn with_download(mut self, download: MockDownload) -> Self {
        self.download = Some(download);
        self
    }

    /// Reports the provider as unavailable at detect time.
    pub fn unavailable(mut self, reason: impl Into<String>) -> Self {
        self.available = false;
        self.detect_reason = reason.into();
        self
    }

    /// Drops the on-device privacy claim.
    pub fn without_privacy_claim(mut self) -> Self {
        self.privacy_claim = Some(PrivacyClaim::Unknown);
        self
    }

    /// Advertises a backend without a system role.
    pub fn without_system_role(mut self) -> Self {
        self.supports.system_role = false;
        self
    }

    /// Makes `ping` return the given result.
    pub fn with_ping_result(mut self, result: Result<(), EngineError>) -> Self {
        self.ping_result = result;
        self
    }

    /// Makes `ping` never answer.
    pub fn with_hanging_ping(mut self) -> Self {
        self.ping_hangs = true;
        self
    }

    /// How many times `init` ran.
    pub fn init_calls(&self) -> u32 {
        self.init_calls.load(Ordering::SeqCst)
    }

    /// How many times `teardown` ran.
    pub fn teardown_calls(&self) -> u32 {
        self.teardown_calls.load(Ordering::SeqCst)
    }

    /// The `max_tokens` budget of every generate attempt, in call order.
    pub fn attempt_budgets(&self) -> Vec<u32> {
        self.attempt_budgets
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    fn check_aborted(&self) -> Result<(), EngineError> {
        if self.aborted.load(Ordering::SeqCst) {
            Err(EngineError::Aborted)
        } else {
            Ok(())
        }
    }

    async fn wait_for_abort(&self) -> EngineError {
        loop {
            if self.aborted.load(Ordering::SeqCst) {
                return EngineError::Aborted;
            }
            self.abort_notify.notified().await;
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn id(&self) -> ProviderId {
        self.id.clone()
    }

    async fn detect(&self, _cfg: &EngineConfig) -> DetectResult {
        DetectResult {
            available: self.available,
            reason: self.detect_reason.clone(),
            privacy_claim: self.privacy_claim,
            supports: self.supports,
        }
    }

    async fn init(
        &self,
        _cfg: &EngineConfig,
        model: Option<&ModelSpec>,
        progress: Option<ProgressSender>,
    ) -> Result<(), EngineError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        self.aborted.store(false, Ordering::SeqCst);

        if self.init_failures.load(Ordering::SeqCst) > 0 {
            self.init_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::ModelLoad("injected init failure".to_string()));
        }

        if let (Some(download), Some(progress)) = (self.download, progress) {
            let variant = match download.total_bytes {
                Some(_) => DownloadVariant::Determinate,
                None => DownloadVariant::Indeterminate,
            };
            let chunks = download.chunks.max(1) as u64;
            let step = download.total_bytes.unwrap_or(0) / chunks;
            for i in 1..=chunks {
                self.check_aborted()?;
                let snapshot = DownloadProgress {
                    variant,
                    downloaded_bytes: step * i,
                    total_bytes: download.total_bytes,
                    complete: false,
                };
                if progress.send(snapshot).await.is_err() {
                    return Err(EngineError::Aborted);
                }
            }
            let done = DownloadProgress {
                variant,
                downloaded_bytes: download.total_bytes.unwrap_or(step * chunks),
                total_bytes: download.total_bytes,
                complete: true,
            };
            progress.send(done).await.ok();
        }

        log::debug!(
            "mock: initialized{}",
            model
                .map(|m| format!(" with model {}", m.id))
                .unwrap_or_default()
        );
        Ok(())
    }

    async fn generate(
        &self,
        params: GenerateParams,
        tokens: TokenSender,
    ) -> Result<GenerateResult, EngineError> {
        self.aborted.store(false, Ordering::SeqCst);
        if let Ok(mut budgets) = self.attempt_budgets.lock() {
            budgets.push(params.max_tokens);
        }

        if self.remaining_failures.load(Ordering::SeqCst) > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(self
                .failure
                .clone()
                .unwrap_or_else(|| EngineError::Unknown("injected failure".to_string())));
        }

        let mut text = String::new();
        let mut emitted: u64 = 0;
        for (i, tok) in self.script.iter().enumerate() {
            if let Some(hang) = self.hang_after {
                if i >= hang {
                    return Err(self.wait_for_abort().await);
                }
            }
            self.check_aborted()?;
            if tokens.send(TokenChunk::text(tok.clone())).await.is_err() {
                // Receiver gone: the orchestrator moved past this epoch.
                return Err(EngineError::Aborted);
            }
            text.push_str(tok);
            emitted += 1;
            if !self.token_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.token_delay) => {}
                    err = self.wait_for_abort() => return Err(err),
                }
            }
            if emitted >= params.max_tokens as u64 {
                break;
            }
        }

        Ok(GenerateResult {
            text,
            tokens_emitted: emitted,
            finish: FinishReason::Complete,
        })
    }

    async fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.abort_notify.notify_waiters();
    }

    async fn teardown(&self) -> Result<(), EngineError> {
        self.teardown_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> Result<(), EngineError> {
        if self.ping_hangs {
            std::future::pending::<()>().await;
        }
        self.ping_result.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn params(max_tokens: u32) -> GenerateParams {
        GenerateParams {
            messages: vec![axon_types::chat::ChatMessage::user("hi")],
            max_tokens,
            temperature: 0.0,
        }
    }

    #[tokio::test]
    async fn test_scripted_generation() {
        let mock = MockProvider::new().with_script(["a", "b", "c"]);
        let (tx, mut rx) = mpsc::channel(8);
        let result = mock.generate(params(100), tx).await.unwrap();
        assert_eq!(result.text, "abc");
        assert_eq!(result.tokens_emitted, 3);
        assert_eq!(result.finish, FinishReason::Complete);
        let mut streamed = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            streamed.push(chunk.text);
        }
        assert_eq!(streamed, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_budget_caps_emission() {
        let mock = MockProvider::new().with_script(["a", "b", "c", "d"]);
        let (tx, _rx) = mpsc::channel(8);
        let result = mock.generate(params(2), tx).await.unwrap();
        assert_eq!(result.tokens_emitted, 2);
        assert_eq!(mock.attempt_budgets(), vec![2]);
    }

    #[tokio::test]
    async fn test_abort_interrupts_hang() {
        let mock = std::sync::Arc::new(MockProvider::new().with_hang_after(1));
        let (tx, mut rx) = mpsc::channel(8);
        let gen_mock = mock.clone();
        let task = tokio::spawn(async move { gen_mock.generate(params(10), tx).await });
        // One token must arrive, then the mock parks.
        let first = rx.recv().await.unwrap();
        assert_eq!(first.text, "Hello");
        mock.abort().await;
        let result = task.await.unwrap();
        assert_eq!(result.unwrap_err(), EngineError::Aborted);
    }

    #[tokio::test]
    async fn test_injected_failures_then_success() {
        let mock = MockProvider::new()
            .failing_attempts(1, EngineError::Oom("vram".to_string()));
        let (tx, _rx) = mpsc::channel(8);
        let err = mock.generate(params(10), tx).await.unwrap_err();
        assert_eq!(err, EngineError::Oom("vram".to_string()));
        let (tx, _rx) = mpsc::channel(8);
        assert!(mock.generate(params(10), tx).await.is_ok());
    }

    #[tokio::test]
    async fn test_download_progress_script() {
        let mock = MockProvider::new().with_download(MockDownload {
            total_bytes: Some(100),
            chunks: 4,
        });
        let (tx, mut rx) = mpsc::channel(16);
        mock.init(&EngineConfig::default(), None, Some(tx))
            .await
            .unwrap();
        let mut snapshots = Vec::new();
        while let Ok(p) = rx.try_recv() {
            snapshots.push(p);
        }
        assert_eq!(snapshots.len(), 5);
        assert!(snapshots.last().unwrap().complete);
        assert_eq!(snapshots.last().unwrap().downloaded_bytes, 100);
    }
}
