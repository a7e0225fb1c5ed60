//! Background generation of registry content.

use crate::ContentError;
use crate::registry::{ContentKind, ContentRegistry, MovieArtifact};
use async_channel::{Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Outcome of a generation batch.
pub type GenerateResult = Result<Vec<MovieArtifact>, ContentError>;

/// Progress of a [`GenerateTask`].
///
/// Events arrive in order. `Finished` is always the last one and is sent
/// exactly once.
#[derive(Debug)]
pub enum GenerateEvent {
    /// Item `index` of the batch is `percent` done.
    Progress {
        /// Position of the item in the requested batch.
        index: usize,
        /// Completion, `0..=100`.
        percent: u32,
    },
    /// The batch ended.
    Finished(GenerateResult),
}

/// A batch of movies being generated on a worker thread.
#[derive(Debug)]
pub struct GenerateTask {
    events: Receiver<GenerateEvent>,
    thread: Option<JoinHandle<()>>,
}

impl GenerateTask {
    pub(crate) fn spawn(
        registry: Arc<ContentRegistry>,
        kinds: Vec<ContentKind>,
    ) -> Result<Self, ContentError> {
        let (sender, events) = async_channel::unbounded();
        let thread = std::thread::Builder::new()
            .name("content generator".into())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    run_batch(&registry, &kinds, &sender)
                }))
                .unwrap_or(Err(ContentError::TaskPanicked));
                match &result {
                    Ok(items) => log::info!("generation complete, {} movies", items.len()),
                    Err(err) => log::warn!("failed while generating content: {err}"),
                }
                send(&sender, GenerateEvent::Finished(result));
            })?;
        Ok(Self {
            events,
            thread: Some(thread),
        })
    }

    /// Event stream of the batch, for consumers polling from their own
    /// thread or task.
    #[must_use]
    pub const fn events(&self) -> &Receiver<GenerateEvent> {
        &self.events
    }

    /// Block until the batch ends, calling `on_progress` for each progress
    /// event.
    ///
    /// # Errors
    ///
    /// Returns the first item failure, or [`ContentError::TaskPanicked`] if
    /// the worker died without reporting.
    pub fn wait_with_progress(
        mut self,
        mut on_progress: impl FnMut(usize, u32),
    ) -> GenerateResult {
        let result = loop {
            match self.events.recv_blocking() {
                Ok(GenerateEvent::Progress { index, percent }) => on_progress(index, percent),
                Ok(GenerateEvent::Finished(result)) => break result,
                Err(_) => break Err(ContentError::TaskPanicked),
            }
        };
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                return Err(ContentError::TaskPanicked);
            }
        }
        result
    }

    /// Block until the batch ends.
    ///
    /// # Errors
    ///
    /// See [`GenerateTask::wait_with_progress`].
    pub fn wait(self) -> GenerateResult {
        self.wait_with_progress(|_, _| {})
    }
}

fn send(sender: &Sender<GenerateEvent>, event: GenerateEvent) {
    if sender.send_blocking(event).is_err() {
        log::debug!("generate event dropped, receiver is gone");
    }
}

fn run_batch(
    registry: &ContentRegistry,
    kinds: &[ContentKind],
    sender: &Sender<GenerateEvent>,
) -> GenerateResult {
    let mut items = Vec::with_capacity(kinds.len());
    for (index, &kind) in kinds.iter().enumerate() {
        send(sender, GenerateEvent::Progress { index, percent: 0 });
        let artifact = registry.prepare(kind, &mut |percent| {
            send(sender, GenerateEvent::Progress { index, percent });
        })?;
        items.push(artifact);
        send(sender, GenerateEvent::Progress { index, percent: 100 });
    }
    Ok(items)
}
