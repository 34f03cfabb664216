//! The lifecycle hook registry.
//!
//! Integrators decorate the engine lifecycle with named hooks. Async hooks
//! are awaited serially in registration order; the two hot-path hooks
//! (`on_token`, `on_state_change`) are synchronous and run inline. A hook
//! that fails or panics is logged and skipped; it never aborts the
//! lifecycle.

use axon_types::chat::ChatMessage;
use axon_types::error::ErrorReport;
use axon_types::model::ModelSpec;
use axon_types::protocol::{FinishReason, TokenChunk};
use axon_types::state::RuntimeState;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;

/// Payload of the init hooks.
#[derive(Debug, Clone)]
pub struct InitContext {
    /// The model being prepared, when one was requested.
    pub model: Option<ModelSpec>,
}

/// Payload of the generate hooks.
#[derive(Debug, Clone)]
pub struct GenerateContext {
    /// The canonicalized conversation.
    pub messages: Vec<ChatMessage>,
    /// The token budget of the attempt.
    pub max_tokens: u32,
}

/// Payload of `after_generate`.
#[derive(Debug, Clone)]
pub struct GenerationSummary {
    /// Full output text.
    pub text: String,
    /// Token chunks streamed.
    pub tokens_emitted: u64,
    /// Why decoding ended.
    pub finish: FinishReason,
}

type AsyncHook<T> = Box<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type SyncHook<T> = Box<dyn Fn(&T) + Send + Sync>;

/// The registry of every lifecycle hook.
#[derive(Default)]
pub struct HookRegistry {
    before_init: Vec<AsyncHook<InitContext>>,
    after_init: Vec<AsyncHook<InitContext>>,
    before_generate: Vec<AsyncHook<GenerateContext>>,
    after_generate: Vec<AsyncHook<GenerationSummary>>,
    on_error: Vec<AsyncHook<ErrorReport>>,
    before_teardown: Vec<AsyncHook<()>>,
    after_teardown: Vec<AsyncHook<()>>,
    on_token: Vec<SyncHook<TokenChunk>>,
    on_state_change: Vec<SyncHook<RuntimeState>>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("before_init", &self.before_init.len())
            .field("after_init", &self.after_init.len())
            .field("before_generate", &self.before_generate.len())
            .field("after_generate", &self.after_generate.len())
            .field("on_error", &self.on_error.len())
            .field("before_teardown", &self.before_teardown.len())
            .field("after_teardown", &self.after_teardown.len())
            .field("on_token", &self.on_token.len())
            .field("on_state_change", &self.on_state_change.len())
            .finish()
    }
}

macro_rules! register_async {
    ($(#[$doc:meta])* $name:ident, $ty:ty) => {
        $(#[$doc])*
        pub fn $name<F, Fut>(&mut self, hook: F)
        where
            F: Fn($ty) -> Fut + Send + Sync + 'static,
            Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
        {
            self.$name.push(Box::new(move |ctx| hook(ctx).boxed()));
        }
    };
}

impl HookRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    register_async!(
        /// Registers a hook awaited before provider init.
        before_init,
        InitContext
    );
    register_async!(
        /// Registers a hook awaited after provider init.
        after_init,
        InitContext
    );
    register_async!(
        /// Registers a hook awaited before each generation attempt.
        before_generate,
        GenerateContext
    );
    register_async!(
        /// Registers a hook awaited after a completed generation.
        after_generate,
        GenerationSummary
    );
    register_async!(
        /// Registers a hook awaited on every surfaced error.
        on_error,
        ErrorReport
    );
    register_async!(
        /// Registers a hook awaited before teardown begins.
        before_teardown,
        ()
    );
    register_async!(
        /// Registers a hook awaited after teardown finishes.
        after_teardown,
        ()
    );

    /// Registers an inline hook for every streamed token.
    pub fn on_token(&mut self, hook: impl Fn(&TokenChunk) + Send + Sync + 'static) {
        self.on_token.push(Box::new(hook));
    }

    /// Registers an inline hook for every state change.
    pub fn on_state_change(&mut self, hook: impl Fn(&RuntimeState) + Send + Sync + 'static) {
        self.on_state_change.push(Box::new(hook));
    }

    async fn dispatch_async<T: Clone>(hooks: &[AsyncHook<T>], name: &str, ctx: &T) {
        for hook in hooks {
            let outcome = AssertUnwindSafe(hook(ctx.clone())).catch_unwind().await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::warn!(target: "hooks", "{} hook failed: {}; skipping", name, error);
                }
                Err(_) => {
                    tracing::warn!(target: "hooks", "{} hook panicked; skipping", name);
                }
            }
        }
    }

    fn dispatch_sync<T>(hooks: &[SyncHook<T>], name: &str, ctx: &T) {
        for hook in hooks {
            if std::panic::catch_unwind(AssertUnwindSafe(|| hook(ctx))).is_err() {
                tracing::warn!(target: "hooks", "{} hook panicked; skipping", name);
            }
        }
    }

    /// Awaits the `before_init` chain.
    pub async fn run_before_init(&self, ctx: &InitContext) {
        Self::dispatch_async(&self.before_init, "before_init", ctx).await;
    }

    /// Awaits the `after_init` chain.
    pub async fn run_after_init(&self, ctx: &InitContext) {
        Self::dispatch_async(&self.after_init, "after_init", ctx).await;
    }

    /// Awaits the `before_generate` chain.
    pub async fn run_before_generate(&self, ctx: &GenerateContext) {
        Self::dispatch_async(&self.before_generate, "before_generate", ctx).await;
    }

    /// Awaits the `after_generate` chain.
    pub async fn run_after_generate(&self, summary: &GenerationSummary) {
        Self::dispatch_async(&self.after_generate, "after_generate", summary).await;
    }

    /// Awaits the `on_error` chain.
    pub async fn run_on_error(&self, report: &ErrorReport) {
        Self::dispatch_async(&self.on_error, "on_error", report).await;
    }

    /// Awaits the `before_teardown` chain.
    pub async fn run_before_teardown(&self) {
        Self::dispatch_async(&self.before_teardown, "before_teardown", &()).await;
    }

    /// Awaits the `after_teardown` chain.
    pub async fn run_after_teardown(&self) {
        Self::dispatch_async(&self.after_teardown, "after_teardown", &()).await;
    }

    /// Runs the inline token hooks.
    pub fn emit_token(&self, chunk: &TokenChunk) {
        Self::dispatch_sync(&self.on_token, "on_token", chunk);
    }

    /// Runs the inline state-change hooks.
    pub fn emit_state_change(&self, state: &RuntimeState) {
        Self::dispatch_sync(&self.on_state_change, "on_state_change", state);
    }
}
