//! Throttled presenter: merges thinking and answer deltas into display
//! markup and rate-limits outbound UI writes with a guaranteed final flush.

use crate::traits::UiSurface;
use crate::types::TargetId;
use futures_util::StreamExt;
use relay_backends::{EventStream, StreamEvent, UsageStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const CONTENT_FIELD: &str = "content";
pub const STATUS_FIELD: &str = "status";

const THINKING_DISPLAY_LIMIT: usize = 2000;

#[derive(Debug, Clone)]
pub struct AnimationConfig {
    pub frames: Vec<String>,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct PresenterConfig {
    /// Minimum spacing between non-final UI pushes. The very first chunk and
    /// the final flush are never throttled.
    pub update_interval: Duration,
    pub animation: Option<AnimationConfig>,
}

impl Default for PresenterConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(1),
            animation: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PresentedRun {
    pub answer: String,
    pub thinking: String,
    pub usage: Option<UsageStats>,
    pub error: Option<String>,
}

pub struct ThrottledPresenter {
    surface: Arc<dyn UiSurface>,
    config: PresenterConfig,
}

impl ThrottledPresenter {
    pub fn new(surface: Arc<dyn UiSurface>, config: PresenterConfig) -> Self {
        Self { surface, config }
    }

    /// Consume one event stream to completion, pushing throttled updates and
    /// one final non-throttled flush. Returns the accumulated run regardless
    /// of how the stream ended.
    #[tracing::instrument(level = "info", skip_all, fields(target = %target))]
    pub async fn present(&self, target: &TargetId, mut events: EventStream) -> PresentedRun {
        let cancel = CancellationToken::new();
        let animation = self
            .config
            .animation
            .clone()
            .filter(|a| !a.frames.is_empty())
            .map(|config| {
                let surface = self.surface.clone();
                let target = target.clone();
                let token = cancel.clone();
                tokio::spawn(status_animation_loop(surface, target, config, token))
            });

        let mut run = PresentedRun::default();
        let mut first_push = true;
        let mut last_push = Instant::now();
        let mut past_thinking = false;
        let mut delta_events = 0usize;

        while let Some(event) = events.next().await {
            match event {
                StreamEvent::ThinkingDelta { text } => {
                    if past_thinking {
                        // The run is past its thinking phase; stray thought
                        // deltas are not coalesced into the displayed block.
                        continue;
                    }
                    delta_events += 1;
                    run.thinking.push_str(&text);
                    self.maybe_push(target, &run, true, &mut first_push, &mut last_push)
                        .await;
                }
                StreamEvent::ContentDelta { text } => {
                    delta_events += 1;
                    past_thinking = true;
                    run.answer.push_str(&text);
                    self.maybe_push(target, &run, false, &mut first_push, &mut last_push)
                        .await;
                }
                StreamEvent::Usage(usage) => {
                    run.usage = Some(usage);
                }
                StreamEvent::Error { message } => {
                    // Terminal by adapter contract; flush what we have.
                    run.error = Some(message);
                    break;
                }
            }
        }

        let markup = render_display(&run.thinking, &run.answer, false);
        if let Err(error) = self
            .surface
            .push_update(target, CONTENT_FIELD, &markup, true)
            .await
        {
            tracing::warn!(%error, "final ui push failed");
        }

        // The animation is the only task cancelled mid-flight; await its
        // stop before the run counts as finished, then clear the field.
        cancel.cancel();
        if let Some(handle) = animation {
            if let Err(error) = handle.await {
                tracing::warn!(%error, "status animation join failed");
            }
            if let Err(error) = self
                .surface
                .push_update(target, STATUS_FIELD, "", false)
                .await
            {
                tracing::debug!(%error, "status field clear failed");
            }
        }

        tracing::info!(
            delta_events,
            answer_len = run.answer.len(),
            thinking_len = run.thinking.len(),
            errored = run.error.is_some(),
            "presentation finished"
        );
        run
    }

    async fn maybe_push(
        &self,
        target: &TargetId,
        run: &PresentedRun,
        is_thinking: bool,
        first_push: &mut bool,
        last_push: &mut Instant,
    ) {
        let now = Instant::now();
        if !*first_push && now.duration_since(*last_push) < self.config.update_interval {
            return;
        }
        let markup = render_display(&run.thinking, &run.answer, is_thinking);
        if let Err(error) = self
            .surface
            .push_update(target, CONTENT_FIELD, &markup, false)
            .await
        {
            // A failed non-final push is superseded by the next one.
            tracing::warn!(%error, "ui push failed");
        }
        *first_push = false;
        *last_push = now;
    }
}

/// Combined display markup for the current thinking and answer text.
pub fn render_display(thinking: &str, answer: &str, is_thinking: bool) -> String {
    let mut parts: Vec<String> = Vec::new();

    if !thinking.is_empty() {
        let mut shown: String = thinking.chars().take(THINKING_DISPLAY_LIMIT).collect();
        if thinking.chars().count() > THINKING_DISPLAY_LIMIT {
            shown.push_str("...");
        }
        if is_thinking {
            parts.push(format!(
                "<details open>\n<summary>Thinking...</summary>\n\n{shown}\n</details>"
            ));
        } else {
            parts.push(format!(
                "<details>\n<summary>Thought process</summary>\n\n{shown}\n</details>"
            ));
        }
    }

    if !answer.is_empty() {
        if !thinking.is_empty() {
            parts.push("\n---\n".to_string());
        }
        parts.push(answer.to_string());
    }

    parts.concat()
}

async fn status_animation_loop(
    surface: Arc<dyn UiSurface>,
    target: TargetId,
    config: AnimationConfig,
    cancel: CancellationToken,
) {
    let mut index = 0usize;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let frame = &config.frames[index % config.frames.len()];
        index += 1;
        if let Err(error) = surface.push_update(&target, STATUS_FIELD, frame, false).await {
            tracing::debug!(%error, "status frame push failed");
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(config.interval) => {}
        }
    }
}
