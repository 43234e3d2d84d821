//! Streaming generation pipeline
//!
//! Drives one generation at a time against the engine owned by the
//! lifecycle manager. Fragments are forwarded verbatim and in order;
//! cancellation is cooperative, checked between fragment deliveries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::chat::{Message, Role, Transcript};
use crate::classify::{classify, ClassifiedError};
use crate::config::{ContextPolicy, EngineConfig, SamplingParams};
use crate::context::{ContextEstimate, ContextTracker};
use crate::engine::backend::StreamEvent;
use crate::engine::lifecycle::LifecycleManager;
use crate::sanitize::sanitize;

/// Default cap on fragments per response.
pub const DEFAULT_MAX_FRAGMENTS: usize = 2048;

/// How one generation ended. Cancellation is an outcome, not a failure;
/// fragments already delivered stay with the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Complete(String),
    Cancelled { fragments_delivered: usize },
}

/// Cancellation token for one in-flight generation.
#[derive(Debug, Clone)]
pub struct GenerationHandle {
    id: Uuid,
    stop: Arc<AtomicBool>,
}

impl GenerationHandle {
    fn new(stop: Arc<AtomicBool>) -> Self {
        Self {
            id: Uuid::new_v4(),
            stop,
        }
    }

    pub fn cancel(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

pub struct GenerationPipeline {
    lifecycle: Arc<LifecycleManager>,
    policy: ContextPolicy,
    sampling: SamplingParams,
    tracker: StdMutex<ContextTracker>,
    active: StdMutex<Option<GenerationHandle>>,
}

impl GenerationPipeline {
    pub fn new(lifecycle: Arc<LifecycleManager>) -> Self {
        let config: &EngineConfig = lifecycle.config();
        let policy = config.context.clone();
        let sampling = config.sampling.clone();
        Self {
            lifecycle,
            tracker: StdMutex::new(ContextTracker::new(policy.clone())),
            policy,
            sampling,
            active: StdMutex::new(None),
        }
    }

    /// Generate one assistant response for the transcript, streaming
    /// fragments to `on_fragment` as they arrive.
    pub async fn generate<F>(
        &self,
        transcript: &Transcript,
        system_instruction: Option<&str>,
        mut on_fragment: F,
        max_fragments: usize,
    ) -> std::result::Result<GenerationOutcome, ClassifiedError>
    where
        F: FnMut(&str) + Send,
    {
        let (handle, mut rx) = {
            let mut slot = self.lifecycle.slot().await;
            if !self.lifecycle.is_ready().await {
                return Err(ClassifiedError::not_ready());
            }
            if slot.engine.is_none() {
                return Err(ClassifiedError::not_ready());
            }
            if slot.generation.is_some() {
                return Err(ClassifiedError::already_generating());
            }
            let engine = slot.engine.as_mut().expect("engine checked above");

            let estimate = self.tracker.lock().unwrap().observe(transcript);
            let messages = self.build_prompt(transcript, system_instruction, estimate);
            debug!(
                window = messages.len(),
                estimated_tokens = estimate.estimated_tokens,
                "Starting generation"
            );

            let rx = match engine.stream_completion(&messages, &self.sampling).await {
                Ok(rx) => rx,
                Err(err) => {
                    return Err(ClassifiedError::from_engine_error(
                        &err,
                        &self.lifecycle.generation_hints(),
                    ))
                }
            };

            let stop = Arc::new(AtomicBool::new(false));
            slot.generation = Some(stop.clone());
            let handle = GenerationHandle::new(stop);
            *self.active.lock().unwrap() = Some(handle.clone());
            (handle, rx)
        };

        let mut full = String::new();
        let mut delivered = 0usize;
        let mut cancelled = false;
        let mut failure: Option<ClassifiedError> = None;

        while let Some(event) = rx.recv().await {
            if handle.is_cancelled() {
                cancelled = true;
                break;
            }
            match event {
                StreamEvent::Fragment(text) => {
                    full.push_str(&text);
                    on_fragment(&text);
                    delivered += 1;
                    if handle.is_cancelled() {
                        cancelled = true;
                        break;
                    }
                    if delivered >= max_fragments {
                        debug!(delivered, "Fragment cap reached");
                        break;
                    }
                }
                StreamEvent::Done => break,
                StreamEvent::Error(raw) => {
                    failure = Some(classify(&raw, &self.lifecycle.generation_hints()));
                    break;
                }
            }
        }
        drop(rx);

        self.finish(&handle).await;

        if let Some(err) = failure {
            return Err(err);
        }
        if cancelled {
            info!(delivered, "Generation cancelled");
            return Ok(GenerationOutcome::Cancelled {
                fragments_delivered: delivered,
            });
        }

        // Re-estimate with the new assistant message included.
        let mut updated = transcript.clone();
        updated.push(Message::assistant(full.clone()));
        self.tracker.lock().unwrap().observe(&updated);

        Ok(GenerationOutcome::Complete(full))
    }

    /// Cancel the in-flight generation, if any. Safe to call when idle.
    pub fn cancel(&self) {
        if let Some(handle) = self.active.lock().unwrap().as_ref() {
            handle.cancel();
        }
    }

    /// Current context estimate for the conversation.
    pub fn context(&self) -> ContextEstimate {
        self.tracker.lock().unwrap().current()
    }

    /// Re-estimate after a transcript append outside of generation.
    pub fn observe(&self, transcript: &Transcript) -> ContextEstimate {
        self.tracker.lock().unwrap().observe(transcript)
    }

    /// Called when the transcript is cleared.
    pub fn reset_context(&self) {
        self.tracker.lock().unwrap().reset();
    }

    /// Select the context window and assemble the engine message list.
    /// Deterministic: the same transcript and estimate always produce the
    /// same window.
    fn build_prompt(
        &self,
        transcript: &Transcript,
        system_instruction: Option<&str>,
        estimate: ContextEstimate,
    ) -> Vec<Message> {
        let window = if estimate.estimated_tokens > self.policy.shrink_threshold_tokens {
            self.policy.reduced_window
        } else {
            self.policy.full_window
        };

        let mut messages = Vec::with_capacity(window + 1);
        if let Some(instruction) = system_instruction.map(str::trim).filter(|s| !s.is_empty()) {
            messages.push(Message::system(instruction));
        }
        for msg in transcript.window(window) {
            // Only user-authored content is sanitized; assistant output is
            // never re-sanitized by this layer.
            let content = match msg.role {
                Role::User => sanitize(&msg.content),
                _ => msg.content.clone(),
            };
            messages.push(Message {
                role: msg.role,
                content,
                created_at: msg.created_at,
            });
        }
        messages
    }

    /// Clear the generation flag, but only if it is still ours: teardown
    /// may have replaced it while we were draining.
    async fn finish(&self, handle: &GenerationHandle) {
        let mut slot = self.lifecycle.slot().await;
        if let Some(active) = &slot.generation {
            if Arc::ptr_eq(active, &handle.stop) {
                slot.generation = None;
            }
        }
        drop(slot);

        let mut active = self.active.lock().unwrap();
        if active.as_ref().map(|h| h.id) == Some(handle.id) {
            *active = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::classify::ErrorCode;
    use crate::context::WarningLevel;
    use crate::engine::backend::testing::{MockEvent, MockFactory, MockScript};
    use std::sync::atomic::AtomicUsize;

    fn pipeline_with(factory: MockFactory, config: EngineConfig) -> Arc<GenerationPipeline> {
        let lifecycle = Arc::new(LifecycleManager::new(config, Arc::new(factory)));
        Arc::new(GenerationPipeline::new(lifecycle))
    }

    async fn load_tiny(pipeline: &GenerationPipeline) {
        let descriptor = catalog::by_id("Qwen2-0.5B-Instruct-q4f16_1").unwrap();
        pipeline
            .lifecycle
            .load_model(descriptor, |_, _| {})
            .await
            .unwrap();
    }

    fn user_transcript(messages: &[&str]) -> Transcript {
        let mut t = Transcript::new();
        for m in messages {
            t.push(Message::user(*m));
        }
        t
    }

    #[tokio::test]
    async fn generate_without_model_fails_with_not_ready() {
        let pipeline = pipeline_with(MockFactory::default(), EngineConfig::default());
        let err = pipeline
            .generate(&user_transcript(&["hi"]), None, |_| {}, DEFAULT_MAX_FRAGMENTS)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotReady);
    }

    #[tokio::test]
    async fn fragments_arrive_in_order_and_accumulate() {
        let factory = MockFactory {
            script: MockScript {
                fragments: vec!["Hel".into(), "lo ".into(), "world".into()],
                ..MockScript::default()
            },
            ..MockFactory::default()
        };
        let pipeline = pipeline_with(factory, EngineConfig::default());
        load_tiny(&pipeline).await;

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let outcome = pipeline
            .generate(
                &user_transcript(&["hi"]),
                None,
                move |f| sink.lock().unwrap().push(f.to_string()),
                DEFAULT_MAX_FRAGMENTS,
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            GenerationOutcome::Complete("Hello world".to_string())
        );
        assert_eq!(
            seen.lock().unwrap().clone(),
            vec!["Hel".to_string(), "lo ".to_string(), "world".to_string()]
        );
        // The tracker saw the transcript plus the assistant reply.
        // "hi" (2) + "Hello world" (11) = 13 chars -> ceil(13 / 4) = 4.
        assert_eq!(pipeline.context().estimated_tokens, 4);
        assert_eq!(pipeline.context().warning, WarningLevel::None);
    }

    #[tokio::test]
    async fn cancel_after_n_fragments_yields_cancelled_with_exact_count() {
        let factory = MockFactory {
            script: MockScript {
                fragments: vec!["x".to_string(); 50],
                ..MockScript::default()
            },
            ..MockFactory::default()
        };
        let pipeline = pipeline_with(factory, EngineConfig::default());
        load_tiny(&pipeline).await;

        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let canceller = pipeline.clone();
        let outcome = pipeline
            .generate(
                &user_transcript(&["hi"]),
                None,
                move |_| {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n == 3 {
                        canceller.cancel();
                    }
                },
                DEFAULT_MAX_FRAGMENTS,
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            GenerationOutcome::Cancelled {
                fragments_delivered: 3
            }
        );
        assert_eq!(count.load(Ordering::SeqCst), 3);
        // The flag is cleared; a new generation can start.
        let again = pipeline
            .generate(&user_transcript(&["hi"]), None, |_| {}, DEFAULT_MAX_FRAGMENTS)
            .await
            .unwrap();
        assert!(matches!(again, GenerationOutcome::Cancelled { .. } | GenerationOutcome::Complete(_)));
    }

    #[tokio::test]
    async fn second_generate_fails_fast_with_already_generating() {
        let factory = MockFactory::default();
        let pipeline = pipeline_with(factory, EngineConfig::default());
        load_tiny(&pipeline).await;

        // Simulate a live generation by occupying the slot's flag.
        let stop = Arc::new(AtomicBool::new(false));
        pipeline.lifecycle.slot().await.generation = Some(stop.clone());

        let err = pipeline
            .generate(&user_transcript(&["hi"]), None, |_| {}, DEFAULT_MAX_FRAGMENTS)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyGenerating);
        // The active generation's flag is untouched.
        assert!(!stop.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_generate_rejected_while_first_completes() {
        let factory = MockFactory {
            script: MockScript {
                fragments: vec!["y".to_string(); 200],
                ..MockScript::default()
            },
            ..MockFactory::default()
        };
        let pipeline = pipeline_with(factory, EngineConfig::default());
        load_tiny(&pipeline).await;

        let started = Arc::new(AtomicUsize::new(0));
        let progress = started.clone();
        let first = tokio::spawn({
            let pipeline = pipeline.clone();
            async move {
                pipeline
                    .generate(
                        &user_transcript(&["hi"]),
                        None,
                        move |_| {
                            progress.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(2));
                        },
                        DEFAULT_MAX_FRAGMENTS,
                    )
                    .await
            }
        });

        while started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }

        let err = pipeline
            .generate(&user_transcript(&["again"]), None, |_| {}, DEFAULT_MAX_FRAGMENTS)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyGenerating);

        pipeline.cancel();
        let outcome = first.await.unwrap().unwrap();
        assert!(matches!(outcome, GenerationOutcome::Cancelled { .. }));
    }

    #[tokio::test]
    async fn window_shrinks_under_context_pressure() {
        let factory = MockFactory {
            script: MockScript {
                fragments: vec!["ok".to_string()],
                ..MockScript::default()
            },
            ..MockFactory::default()
        };
        let pipeline = pipeline_with(factory.clone(), EngineConfig::default());
        load_tiny(&pipeline).await;

        // 15 short messages: estimate stays under the threshold.
        let light = user_transcript(&["short message"; 15]);
        pipeline
            .generate(&light, None, |_| {}, DEFAULT_MAX_FRAGMENTS)
            .await
            .unwrap();

        // 15 long messages: 15 * 1000 chars / 4 = 3750 tokens, over 2048.
        let heavy = {
            let mut t = Transcript::new();
            for _ in 0..15 {
                t.push(Message::user("w".repeat(1000)));
            }
            t
        };
        pipeline
            .generate(&heavy, Some("Be brief"), |_| {}, DEFAULT_MAX_FRAGMENTS)
            .await
            .unwrap();

        let starts: Vec<usize> = factory
            .events()
            .iter()
            .filter_map(|e| match e {
                MockEvent::StreamStarted { message_count } => Some(*message_count),
                _ => None,
            })
            .collect();
        // Full window of 10, then reduced window of 6 plus the system message.
        assert_eq!(starts, vec![10, 7]);
    }

    #[tokio::test]
    async fn stream_error_is_classified_not_swallowed() {
        let factory = MockFactory {
            script: MockScript {
                fragments: vec!["par".to_string()],
                stream_error: Some("GPU device lost".to_string()),
                ..MockScript::default()
            },
            ..MockFactory::default()
        };
        let pipeline = pipeline_with(factory, EngineConfig::default());
        load_tiny(&pipeline).await;

        let err = pipeline
            .generate(&user_transcript(&["hi"]), None, |_| {}, DEFAULT_MAX_FRAGMENTS)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::GpuUnsupported);
        assert_eq!(err.raw_message, "GPU device lost");
    }

    #[tokio::test]
    async fn max_fragments_caps_the_response() {
        let factory = MockFactory {
            script: MockScript {
                fragments: vec!["z".to_string(); 10],
                ..MockScript::default()
            },
            ..MockFactory::default()
        };
        let pipeline = pipeline_with(factory, EngineConfig::default());
        load_tiny(&pipeline).await;

        let outcome = pipeline
            .generate(&user_transcript(&["hi"]), None, |_| {}, 4)
            .await
            .unwrap();
        assert_eq!(outcome, GenerationOutcome::Complete("zzzz".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn teardown_surfaces_as_cancelled_outcome() {
        let factory = MockFactory {
            script: MockScript {
                fragments: vec!["q".to_string(); 200],
                ..MockScript::default()
            },
            ..MockFactory::default()
        };
        let pipeline = pipeline_with(factory, EngineConfig::default());
        load_tiny(&pipeline).await;

        let started = Arc::new(AtomicUsize::new(0));
        let progress = started.clone();
        let task = tokio::spawn({
            let pipeline = pipeline.clone();
            async move {
                pipeline
                    .generate(
                        &user_transcript(&["hi"]),
                        None,
                        move |_| {
                            progress.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(2));
                        },
                        DEFAULT_MAX_FRAGMENTS,
                    )
                    .await
            }
        });

        while started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }

        pipeline.lifecycle.unload().await;

        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome, GenerationOutcome::Cancelled { .. }));
        // Stale cleanup must not disturb the emptied slot.
        assert!(pipeline.lifecycle.slot().await.generation.is_none());
    }

    #[tokio::test]
    async fn sanitizes_user_content_but_not_assistant_content() {
        let factory = MockFactory {
            script: MockScript {
                fragments: vec!["fine".to_string()],
                ..MockScript::default()
            },
            ..MockFactory::default()
        };
        let pipeline = pipeline_with(factory, EngineConfig::default());
        load_tiny(&pipeline).await;

        let mut t = Transcript::new();
        t.push(Message::user("hi\u{0}there"));
        t.push(Message::assistant("raw \u{7} assistant output"));
        // Sanitization happens inside build_prompt; just assert it runs
        // without disturbing the stored transcript.
        pipeline
            .generate(&t, None, |_| {}, DEFAULT_MAX_FRAGMENTS)
            .await
            .unwrap();
        assert_eq!(t.messages()[0].content, "hi\u{0}there");

        let estimate = ContextEstimate {
            estimated_tokens: 0,
            warning: WarningLevel::None,
        };
        let prompt = pipeline.build_prompt(&t, None, estimate);
        assert_eq!(prompt[0].content, "hithere");
        assert_eq!(prompt[1].content, "raw \u{7} assistant output");
    }
}
