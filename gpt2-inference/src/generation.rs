#[cfg(test)]
#[path = "../tests/unit/generation_test.rs"]
mod tests;

use crate::error::{Error, Result};
use crate::sampler::{Candidate, TopKSampler};
use crate::tokenizer::Tokenizer;
use crate::transformer::Transformer;
use log::{debug, info};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Number of most recent tokens fed to the model by default.
pub const DEFAULT_CONTEXT_LIMIT: usize = 50;

/// Receives progress from the generation loop. Implementations must not affect generation.
pub trait GenerationObserver {
    /// Called after transformer block `layer` finishes.
    fn on_layer_done(&mut self, _layer: usize) {}

    /// Called with the candidates, best first, before one of them is sampled.
    fn on_top_k(&mut self, _candidates: &[Candidate]) {}
}

impl GenerationObserver for () {}

impl<T: GenerationObserver + ?Sized> GenerationObserver for &mut T {
    fn on_layer_done(&mut self, layer: usize) {
        (**self).on_layer_done(layer);
    }

    fn on_top_k(&mut self, candidates: &[Candidate]) {
        (**self).on_top_k(candidates);
    }
}

/// Samples the token following `context_ids`.
///
/// Only the last `context_limit` ids are fed to the model.
pub fn generate_next_token(
    transformer: &Transformer,
    context_ids: &[usize],
    context_limit: usize,
    sampler: &mut TopKSampler,
    observer: &mut dyn GenerationObserver,
) -> Result<usize> {
    let start = context_ids.len().saturating_sub(context_limit);
    let window = &context_ids[start..];

    let logits = transformer.forward(window, &mut |layer| observer.on_layer_done(layer))?;
    let last = logits.row(logits.rows() - 1);

    let candidates = sampler.candidates(last);
    observer.on_top_k(&candidates);

    sampler
        .sample(&candidates)
        .ok_or_else(|| Error::Config("model produced no logits".to_string()))
}

/// Cooperative cancellation flag shared with a [`Generator`].
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One sampled token and its decoded text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedToken {
    pub id: usize,
    pub text: String,
}

/// Text state of a generation run.
#[derive(Debug, Clone, Default)]
pub struct GenerationSession {
    pub prompt: String,
    pub completion: String,
    pub last_token: Option<GeneratedToken>,
}

impl GenerationSession {
    /// Prompt followed by everything generated so far.
    pub fn text(&self) -> String {
        format!("{}{}", self.prompt, self.completion)
    }
}

/// Tracks token generation performance metrics
#[derive(Debug, Default)]
struct TokenMetrics {
    start_time: Option<Instant>,
    generated_count: usize,
}

impl TokenMetrics {
    fn start_generation(&mut self) {
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
    }

    fn increment_token(&mut self) {
        self.generated_count += 1;
    }

    fn report_and_reset(&mut self) {
        if let Some(start_time) = self.start_time.take() {
            let duration = start_time.elapsed();
            if self.generated_count > 0 && duration.as_secs_f64() > 0.0 {
                let tps = self.generated_count as f64 / duration.as_secs_f64();
                info!(
                    "⚡ Generated {} tokens in {:.2}s - {:.2} tokens/sec",
                    self.generated_count,
                    duration.as_secs_f64(),
                    tps
                );
            }
        }
        self.generated_count = 0;
    }
}

/// Lazy, restartable token stream.
///
/// Each call to `next` re-encodes the prompt plus the completion so far, samples one token and
/// appends its text to the completion. The stream ends when the [`StopHandle`] is raised, when
/// `max_tokens` tokens were produced since the last (re)start, or after the first error.
pub struct Generator<'a> {
    transformer: &'a Transformer,
    tokenizer: &'a mut Tokenizer,
    sampler: TopKSampler,
    observer: Box<dyn GenerationObserver + 'a>,
    context_limit: usize,
    max_tokens: Option<usize>,
    session: GenerationSession,
    stop: StopHandle,
    metrics: TokenMetrics,
    produced: usize,
    failed: bool,
}

impl<'a> Generator<'a> {
    pub fn new(
        transformer: &'a Transformer,
        tokenizer: &'a mut Tokenizer,
        sampler: TopKSampler,
        prompt: &str,
        context_limit: usize,
    ) -> Result<Self> {
        if prompt.is_empty() {
            return Err(Error::Config("Please provide a prompt".to_string()));
        }
        let n_ctx = transformer.hparams().n_ctx;
        if context_limit == 0 || context_limit > n_ctx {
            return Err(Error::Config(format!("context limit must be between 1 and {n_ctx}, got {context_limit}")));
        }

        Ok(Self {
            transformer,
            tokenizer,
            sampler,
            observer: Box::new(()),
            context_limit,
            max_tokens: None,
            session: GenerationSession { prompt: prompt.to_string(), ..Default::default() },
            stop: StopHandle::default(),
            metrics: TokenMetrics::default(),
            produced: 0,
            failed: false,
        })
    }

    pub fn with_observer(mut self, observer: impl GenerationObserver + 'a) -> Self {
        self.observer = Box::new(observer);
        self
    }

    /// Ends the stream after `max_tokens` tokens per (re)start.
    pub fn with_max_tokens(mut self, max_tokens: Option<usize>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Shares an externally owned stop flag, e.g. one raised from a signal handler.
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn session(&self) -> &GenerationSession {
        &self.session
    }

    pub fn into_session(self) -> GenerationSession {
        self.session
    }

    /// Clears the stop flag and the token budget so iteration continues the same completion.
    pub fn restart(&mut self) {
        self.stop.reset();
        self.produced = 0;
        self.failed = false;
    }

    fn step(&mut self) -> Result<GeneratedToken> {
        let context_ids = self.tokenizer.encode(&self.session.text())?;
        if context_ids.is_empty() {
            return Err(Error::Tokenizer("prompt encodes to no tokens".to_string()));
        }
        debug!("Context of {} tokens, using the last {}", context_ids.len(), self.context_limit);

        let id = generate_next_token(
            self.transformer,
            &context_ids,
            self.context_limit,
            &mut self.sampler,
            self.observer.as_mut(),
        )?;
        let text = self.tokenizer.decode(&[id]);

        self.session.completion.push_str(&text);
        let token = GeneratedToken { id, text };
        self.session.last_token = Some(token.clone());
        Ok(token)
    }

    fn finish(&mut self) {
        self.metrics.report_and_reset();
    }
}

impl Iterator for Generator<'_> {
    type Item = Result<GeneratedToken>;

    fn next(&mut self) -> Option<Self::Item> {
        let exhausted = self.max_tokens.is_some_and(|max| self.produced >= max);
        if self.failed || exhausted || self.stop.is_stopped() {
            self.finish();
            return None;
        }

        self.metrics.start_generation();
        match self.step() {
            Ok(token) => {
                self.produced += 1;
                self.metrics.increment_token();
                Some(Ok(token))
            }
            Err(e) => {
                self.failed = true;
                self.finish();
                Some(Err(e))
            }
        }
    }
}

impl std::fmt::Debug for Generator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("sampler", &self.sampler)
            .field("context_limit", &self.context_limit)
            .field("max_tokens", &self.max_tokens)
            .field("session", &self.session)
            .field("stopped", &self.stop.is_stopped())
            .finish_non_exhaustive()
    }
}
