//! End-to-end lifecycle tests driving a full engine against the mock
//! provider: bring-up chain, download-then-cache behavior, healthcheck,
//! teardown, and command guards.

use axon_api::mock::{MockDownload, MockProvider};
use axon_engine::Engine;
use axon_types::chat::ChatMessage;
use axon_types::config::{EngineConfig, ProviderPolicy};
use axon_types::model::{ModelId, ModelSpec, ProviderId};
use axon_types::protocol::{Command, Envelope, Event, GenerateRequest, HealthOutcome};
use axon_types::state::StateKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

fn test_config() -> EngineConfig {
    // First caller installs the JSON subscriber; later calls fail and are
    // discarded (one global subscriber per test binary).
    axon_telemetry::init_tracing().ok();
    let mut config = EngineConfig::default();
    config.provider_policy = ProviderPolicy {
        order: vec![ProviderId::new("mock")],
    };
    config.watchdog.check_interval_ms = 10;
    // Keep the opportunistic probe quiet during short-lived tests.
    config.healthcheck.interval_ms = 600_000;
    config
}

fn builtin_model() -> ModelSpec {
    ModelSpec {
        id: ModelId::new("mock-builtin"),
        provider: ProviderId::new("mock"),
        hf_repo: "mock/builtin".to_string(),
        tier: 1,
        size_bytes: 0,
        context_window: 4096,
        chat_template: None,
    }
}

fn downloadable_model() -> ModelSpec {
    ModelSpec {
        size_bytes: 400,
        ..builtin_model()
    }
}

fn hello_request() -> GenerateRequest {
    GenerateRequest {
        messages: vec![ChatMessage::user("hello")],
        max_tokens: 64,
        temperature: 0.0,
    }
}

/// Receives events until `pred` matches, with a wallclock guard.
async fn wait_for(
    rx: &mut broadcast::Receiver<Envelope<Event>>,
    pred: impl Fn(&Envelope<Event>) -> bool,
) -> Envelope<Event> {
    timeout(Duration::from_secs(5), async {
        loop {
            let envelope = rx.recv().await.expect("event stream closed");
            if pred(&envelope) {
                return envelope;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn is_state(envelope: &Envelope<Event>, kind: StateKind) -> bool {
    matches!(&envelope.body, Event::StateChange { state } if state.kind() == kind)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_happy_path_state_trace() {
    let provider = Arc::new(MockProvider::new());
    let handle = Engine::new(test_config())
        .with_provider(provider)
        .start();
    let mut rx = handle.subscribe();

    handle
        .submit(Command::Init {
            model: Some(builtin_model()),
        })
        .await
        .unwrap();
    wait_for(&mut rx, |e| is_state(e, StateKind::Ready)).await;

    handle
        .submit(Command::Generate {
            request: hello_request(),
        })
        .await
        .unwrap();
    let complete = wait_for(&mut rx, |e| {
        matches!(e.body, Event::GenerationComplete { .. })
    })
    .await;
    match complete.body {
        Event::GenerationComplete { text, .. } => assert!(!text.is_empty()),
        _ => unreachable!(),
    }
    let diagnostics = handle.diagnostics().await.unwrap();
    assert_eq!(diagnostics.state.kind(), StateKind::Ready);
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_state_trace_skips_download_for_builtin_model() {
    let provider = Arc::new(MockProvider::new());
    let handle = Engine::new(test_config())
        .with_provider(provider)
        .start();
    let mut rx = handle.subscribe();

    handle
        .submit(Command::Init {
            model: Some(builtin_model()),
        })
        .await
        .unwrap();

    let mut trace = Vec::new();
    timeout(Duration::from_secs(5), async {
        loop {
            let envelope = rx.recv().await.unwrap();
            if let Event::StateChange { state } = &envelope.body {
                trace.push(state.kind());
                if state.kind() == StateKind::Ready {
                    break;
                }
            }
        }
    })
    .await
    .expect("engine never became ready");

    assert_eq!(
        trace,
        vec![
            StateKind::Booting,
            StateKind::SelectingProvider,
            StateKind::PreflightQuota,
            StateKind::CheckingCache,
            StateKind::WarmingUp,
            StateKind::Ready,
        ]
    );
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_download_path_emits_progress_then_caches() {
    let provider = Arc::new(MockProvider::new().with_download(MockDownload {
        total_bytes: Some(400),
        chunks: 4,
    }));
    let handle = Engine::new(test_config())
        .with_provider(provider)
        .start();
    let mut rx = handle.subscribe();

    handle
        .submit(Command::Init {
            model: Some(downloadable_model()),
        })
        .await
        .unwrap();

    let mut saw_downloading = false;
    let mut progress_events = 0u32;
    timeout(Duration::from_secs(5), async {
        loop {
            let envelope = rx.recv().await.unwrap();
            match &envelope.body {
                Event::StateChange { state } if state.kind() == StateKind::Downloading => {
                    saw_downloading = true;
                }
                Event::DownloadProgress { .. } => progress_events += 1,
                Event::StateChange { state } if state.kind() == StateKind::Ready => break,
                _ => {}
            }
        }
    })
    .await
    .expect("engine never became ready");
    assert!(saw_downloading);
    assert!(progress_events >= 4);

    // The model is cached now: a teardown and re-init goes straight from
    // CHECKING_CACHE to WARMING_UP.
    handle.submit(Command::Teardown).await.unwrap();
    wait_for(&mut rx, |e| matches!(e.body, Event::TeardownComplete)).await;
    handle.submit(Command::Init { model: None }).await.unwrap();

    let cache_result = wait_for(&mut rx, |e| matches!(e.body, Event::CacheResult { .. })).await;
    match cache_result.body {
        Event::CacheResult { cached, .. } => assert!(cached),
        _ => unreachable!(),
    }
    let mut trace = Vec::new();
    timeout(Duration::from_secs(5), async {
        loop {
            let envelope = rx.recv().await.unwrap();
            if let Event::StateChange { state } = &envelope.body {
                trace.push(state.kind());
                if state.kind() == StateKind::Ready {
                    break;
                }
            }
        }
    })
    .await
    .expect("re-init never became ready");
    assert!(!trace.contains(&StateKind::Downloading));
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_healthcheck_round_trip() {
    let provider = Arc::new(MockProvider::new());
    let handle = Engine::new(test_config())
        .with_provider(provider)
        .start();
    let mut rx = handle.subscribe();

    handle
        .submit(Command::Init {
            model: Some(builtin_model()),
        })
        .await
        .unwrap();
    wait_for(&mut rx, |e| is_state(e, StateKind::Ready)).await;

    handle.submit(Command::Healthcheck).await.unwrap();
    let response = wait_for(&mut rx, |e| {
        matches!(e.body, Event::HealthcheckResponse { .. })
    })
    .await;
    match response.body {
        Event::HealthcheckResponse { outcome, state } => {
            assert_eq!(outcome, HealthOutcome::Healthy);
            assert_eq!(state, StateKind::Ready);
        }
        _ => unreachable!(),
    }
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_teardown_returns_to_idle_and_bumps_epoch() {
    let provider = Arc::new(MockProvider::new());
    let handle = Engine::new(test_config())
        .with_provider(provider.clone())
        .start();
    let mut rx = handle.subscribe();

    handle
        .submit(Command::Init {
            model: Some(builtin_model()),
        })
        .await
        .unwrap();
    wait_for(&mut rx, |e| is_state(e, StateKind::Ready)).await;
    assert_eq!(handle.current_epoch(), 0);

    handle.submit(Command::Teardown).await.unwrap();
    wait_for(&mut rx, |e| matches!(e.body, Event::TeardownComplete)).await;
    wait_for(&mut rx, |e| is_state(e, StateKind::Idle)).await;

    assert_eq!(handle.current_epoch(), 1);
    assert_eq!(provider.teardown_calls(), 1);

    let diagnostics = handle.diagnostics().await.unwrap();
    assert_eq!(diagnostics.state.kind(), StateKind::Idle);
    assert!(diagnostics.loaded_models.is_empty());
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_generate_outside_ready_is_rejected() {
    let provider = Arc::new(MockProvider::new());
    let handle = Engine::new(test_config())
        .with_provider(provider)
        .start();
    let mut rx = handle.subscribe();

    handle
        .submit(Command::Generate {
            request: hello_request(),
        })
        .await
        .unwrap();
    let error = wait_for(&mut rx, |e| matches!(e.body, Event::Error { .. })).await;
    match error.body {
        Event::Error { report } => {
            assert_eq!(report.code, "ERROR_INVALID_STATE");
            assert_eq!(report.at_state, Some(StateKind::Idle));
        }
        _ => unreachable!(),
    }
    // The rejection left the engine untouched.
    let diagnostics = handle.diagnostics().await.unwrap();
    assert_eq!(diagnostics.state.kind(), StateKind::Idle);
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_provider_available_unwinds_to_idle() {
    let mut config = test_config();
    config.provider_policy = ProviderPolicy {
        order: vec![ProviderId::new("native")],
    };
    let handle = Engine::new(config).start();
    let mut rx = handle.subscribe();

    handle
        .submit(Command::Init {
            model: Some(builtin_model()),
        })
        .await
        .unwrap();
    let error = wait_for(&mut rx, |e| matches!(e.body, Event::Error { .. })).await;
    match error.body {
        Event::Error { report } => assert_eq!(report.code, "ERROR_NO_PROVIDER_AVAILABLE"),
        _ => unreachable!(),
    }
    wait_for(&mut rx, |e| is_state(e, StateKind::Idle)).await;

    let diagnostics = handle.diagnostics().await.unwrap();
    let selection = diagnostics.selection_report.expect("selection report");
    assert_eq!(selection.selected, None);
    assert_eq!(selection.candidates.len(), 1);
    assert_eq!(selection.candidates[0].reason, "not registered");
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quota_preflight_blocks_oversized_download() {
    use axon_api::storage::FixedStorageEstimator;
    use axon_types::MIB;

    let provider = Arc::new(MockProvider::new());
    // 4 GiB model against a 1 GiB quota: no eviction can save this.
    let mut model = builtin_model();
    model.size_bytes = 4 * 1024 * MIB;
    let handle = Engine::new(test_config())
        .with_provider(provider)
        .with_estimator(Arc::new(FixedStorageEstimator::new(1024 * MIB, 0)))
        .start();
    let mut rx = handle.subscribe();

    handle
        .submit(Command::Init { model: Some(model) })
        .await
        .unwrap();
    let error = wait_for(&mut rx, |e| matches!(e.body, Event::Error { .. })).await;
    match error.body {
        Event::Error { report } => {
            assert_eq!(report.code, "ERROR_QUOTA_INSUFFICIENT");
            assert_eq!(report.at_state, Some(StateKind::PreflightQuota));
        }
        _ => unreachable!(),
    }
    wait_for(&mut rx, |e| is_state(e, StateKind::Idle)).await;

    let diagnostics = handle.diagnostics().await.unwrap();
    let quota = diagnostics.quota_report.expect("quota report");
    assert!(!quota.ok);
    assert_eq!(quota.quota_bytes, Some(1024 * MIB));
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_messages_rejected_at_generate() {
    let provider = Arc::new(MockProvider::new());
    let handle = Engine::new(test_config())
        .with_provider(provider)
        .start();
    let mut rx = handle.subscribe();

    handle
        .submit(Command::Init {
            model: Some(builtin_model()),
        })
        .await
        .unwrap();
    wait_for(&mut rx, |e| is_state(e, StateKind::Ready)).await;

    handle
        .submit(Command::Generate {
            request: GenerateRequest {
                messages: vec![ChatMessage::system("rules only")],
                max_tokens: 16,
                temperature: 0.0,
            },
        })
        .await
        .unwrap();
    let error = wait_for(&mut rx, |e| matches!(e.body, Event::Error { .. })).await;
    match error.body {
        Event::Error { report } => {
            assert_eq!(report.code, "ERROR_INVALID_INPUT_EMPTY_MESSAGES");
        }
        _ => unreachable!(),
    }
    handle.shutdown().await;
}
