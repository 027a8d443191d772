//! Request lifecycle for note loads.
//!
//! Key changes are debounced. At most one load is in flight; starting a new
//! one (or switching keys) cancels the previous request through its token, and
//! a generation counter rejects any response that still slips through.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::schedule::ScheduledTask;
use crate::error::{Error, Result};
use crate::models::{NoteKey, NoteRecord};
use crate::store::NoteStore;

/// Why a load was started; decides how its result is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPurpose {
    /// First load after a key change.
    Initial,
    /// Remote update arrived with nothing local to lose.
    AutoReload,
    /// User chose to drop local edits ("use theirs" or a confirmed reload).
    Discard,
}

pub(crate) type Reply = oneshot::Sender<Result<()>>;

/// Result of a finished fetch, tagged with the generation that issued it.
#[derive(Debug)]
pub(crate) struct LoadOutcome {
    pub generation: u64,
    pub result: Result<NoteRecord>,
}

/// A load whose result the owner is waiting for.
#[derive(Debug)]
pub(crate) struct InFlightLoad {
    pub purpose: LoadPurpose,
    pub reply: Option<Reply>,
    generation: u64,
    token: CancellationToken,
}

impl InFlightLoad {
    fn cancel(self) {
        self.token.cancel();
        if let Some(reply) = self.reply {
            let _ = reply.send(Err(Error::Cancelled));
        }
    }
}

#[derive(Debug)]
pub(crate) struct LoadManager {
    debounce_delay: Duration,
    debounce: ScheduledTask,
    pending_key: Option<NoteKey>,
    generation: u64,
    in_flight: Option<InFlightLoad>,
}

impl LoadManager {
    pub fn new(debounce_delay: Duration) -> Self {
        Self {
            debounce_delay,
            debounce: ScheduledTask::default(),
            pending_key: None,
            generation: 0,
            in_flight: None,
        }
    }

    pub const fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    pub const fn pending_key(&self) -> Option<&NoteKey> {
        self.pending_key.as_ref()
    }

    /// Wait for the debounce window on `key`, cancelling everything older.
    pub fn schedule(&mut self, key: NoteKey) {
        self.cancel();
        self.pending_key = Some(key);
        self.debounce.arm(self.debounce_delay);
    }

    /// Drop the pending debounce and cancel any in-flight request.
    pub fn cancel(&mut self) {
        self.debounce.cancel();
        self.pending_key = None;
        if let Some(load) = self.in_flight.take() {
            tracing::debug!(generation = load.generation, "Cancelling in-flight load");
            load.cancel();
        }
    }

    /// Skip the rest of the debounce window and hand out the pending key.
    pub fn take_pending(&mut self) -> Option<NoteKey> {
        self.debounce.cancel();
        self.pending_key.take()
    }

    pub async fn debounce_elapsed(&self) {
        self.debounce.elapsed().await;
    }

    /// The key to load once the debounce window has passed.
    pub fn fire(&mut self) -> Option<NoteKey> {
        if self.debounce.fire() {
            self.pending_key.take()
        } else {
            None
        }
    }

    /// Start fetching `key`, cancelling the previous request. The outcome is
    /// delivered through `deliver`.
    pub fn start(
        &mut self,
        store: &Arc<dyn NoteStore>,
        key: NoteKey,
        purpose: LoadPurpose,
        reply: Option<Reply>,
        deliver: impl FnOnce(LoadOutcome) + Send + 'static,
    ) {
        if let Some(previous) = self.in_flight.take() {
            tracing::debug!(generation = previous.generation, "Superseding in-flight load");
            previous.cancel();
        }

        self.generation += 1;
        let generation = self.generation;
        let token = CancellationToken::new();
        self.in_flight = Some(InFlightLoad {
            purpose,
            reply,
            generation,
            token: token.clone(),
        });

        let store = Arc::clone(store);
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                () = token.cancelled() => Err(Error::Cancelled),
                result = store.fetch(&key) => result,
            };
            deliver(LoadOutcome { generation, result });
        });
    }

    /// Claim the in-flight load matching `generation`. Stale generations
    /// return `None`.
    pub fn finish(&mut self, generation: u64) -> Option<InFlightLoad> {
        if self
            .in_flight
            .as_ref()
            .is_some_and(|load| load.generation == generation)
        {
            self.in_flight.take()
        } else {
            None
        }
    }
}
