//! Note session actor.
//!
//! All sync state lives in one task. User actions, load and save
//! completions, timers and realtime signals are messages to that task and
//! each is handled to completion before the next, so the edit state and the
//! remote flag never change half-way. After every message the task publishes
//! a fresh [`SessionSnapshot`] and only then answers pending callers.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};

use super::autosave::AutosaveController;
use super::conflict::{
    check_manual_save, check_reload, ConflictState, ReloadConfirmation, RemoteDecision, SaveMode,
};
use super::listener::{
    classify, Classification, ListenerEvent, ListenerSignal, RealtimeListener, RealtimeStatus,
};
use super::loader::{LoadManager, LoadOutcome, LoadPurpose, Reply};
use super::state::{LocalEditState, RecordSummary, RemoteUpdateFlag, SessionSnapshot};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::feed::ChangeFeed;
use crate::models::{ChangeNotification, NoteKey, NoteRecord, RecordId};
use crate::store::NoteStore;

const COMMAND_BUFFER: usize = 32;

enum Command {
    Load {
        key: String,
        reply: Reply,
    },
    Edit {
        content: String,
        reply: Reply,
    },
    ManualSave {
        reply: Reply,
    },
    Reload {
        confirmation: ReloadConfirmation,
        reply: Reply,
    },
    UseTheirs {
        reply: Reply,
    },
    KeepMine {
        reply: Reply,
    },
    DismissRemoteUpdate {
        reply: Reply,
    },
    DismissError {
        reply: Reply,
    },
    Close {
        reply: Reply,
    },
}

/// Handle to a running note session.
///
/// Cheap to clone; every clone talks to the same session task. The task stops
/// on [`NoteSession::close`] or when the last handle is dropped.
#[derive(Debug, Clone)]
pub struct NoteSession {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl NoteSession {
    /// Spawn the session task on the current tokio runtime.
    pub fn spawn(
        store: Arc<dyn NoteStore>,
        feed: Arc<dyn ChangeFeed>,
        config: SyncConfig,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let actor = SessionActor::new(store, feed, config, command_rx, snapshot_tx);
        tokio::spawn(actor.run());
        Self {
            commands: command_tx,
            snapshot: snapshot_rx,
        }
    }

    /// Switch to the note for `key`. The fetch starts once the key has been
    /// stable for the load debounce window; a key that is too short clears
    /// the session and fails with [`Error::Validation`].
    pub async fn load(&self, key: impl Into<String>) -> Result<()> {
        let key = key.into();
        self.request(|reply| Command::Load { key, reply }).await
    }

    /// Replace the live editor content.
    pub async fn edit(&self, content: impl Into<String>) -> Result<()> {
        let content = content.into();
        self.request(|reply| Command::Edit { content, reply }).await
    }

    /// Save now with the known version. Resolves when the save completes.
    pub async fn manual_save(&self) -> Result<()> {
        self.request(|reply| Command::ManualSave { reply }).await
    }

    /// Fetch the latest server content, replacing local content.
    pub async fn reload(&self, confirmation: ReloadConfirmation) -> Result<()> {
        self.request(|reply| Command::Reload {
            confirmation,
            reply,
        })
        .await
    }

    /// Resolve a conflict by discarding local edits.
    pub async fn use_theirs(&self) -> Result<()> {
        self.request(|reply| Command::UseTheirs { reply }).await
    }

    /// Resolve a conflict by overwriting the server (last-write-wins).
    pub async fn keep_mine(&self) -> Result<()> {
        self.request(|reply| Command::KeepMine { reply }).await
    }

    pub async fn dismiss_remote_update(&self) -> Result<()> {
        self.request(|reply| Command::DismissRemoteUpdate { reply })
            .await
    }

    pub async fn dismiss_error(&self) -> Result<()> {
        self.request(|reply| Command::DismissError { reply }).await
    }

    /// Stop the session. Later calls fail with [`Error::SessionClosed`].
    pub async fn close(&self) -> Result<()> {
        self.request(|reply| Command::Close { reply }).await
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot> {
        let mut receiver = self.snapshot.clone();
        let snapshot = receiver
            .wait_for(predicate)
            .await
            .map_err(|_| Error::SessionClosed)?;
        Ok(snapshot.clone())
    }

    async fn request(&self, command: impl FnOnce(Reply) -> Command) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| Error::SessionClosed)?;
        response.await.map_err(|_| Error::SessionClosed)?
    }
}

enum Event {
    Loaded(LoadOutcome),
    Saved(SaveOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveOrigin {
    Autosave,
    Manual,
    KeepMine,
}

impl SaveOrigin {
    const fn mode(self) -> SaveMode {
        match self {
            Self::Autosave | Self::Manual => SaveMode::Checked,
            Self::KeepMine => SaveMode::Forced,
        }
    }
}

struct SaveRequest {
    origin: SaveOrigin,
    reply: Option<Reply>,
}

struct SaveOutcome {
    epoch: u64,
    baseline_seq: u64,
    origin: SaveOrigin,
    content: String,
    result: Result<NoteRecord>,
}

struct SessionActor {
    store: Arc<dyn NoteStore>,
    config: SyncConfig,
    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    listener_events: mpsc::UnboundedReceiver<ListenerEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
    replies: Vec<(Reply, Result<()>)>,

    /// Bumped on every key change; results from older epochs are dropped.
    epoch: u64,
    key: Option<NoteKey>,
    ready: bool,
    record: Option<RecordSummary>,
    edit: LocalEditState,
    remote: RemoteUpdateFlag,
    /// Bumped whenever a load replaces the baseline.
    baseline_seq: u64,
    last_local_write_at: Option<DateTime<Utc>>,
    error: Option<String>,
    realtime: RealtimeStatus,

    autosave: AutosaveController,
    loader: LoadManager,
    listener: RealtimeListener,
    saving: Option<SaveRequest>,
    save_queue: VecDeque<SaveRequest>,
    /// Notifications that arrived while a save was in flight.
    held: Vec<ChangeNotification>,
}

impl SessionActor {
    fn new(
        store: Arc<dyn NoteStore>,
        feed: Arc<dyn ChangeFeed>,
        config: SyncConfig,
        commands: mpsc::Receiver<Command>,
        snapshot: watch::Sender<SessionSnapshot>,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (listener_tx, listener_events) = mpsc::unbounded_channel();
        Self {
            store,
            autosave: AutosaveController::new(config.autosave_delay),
            loader: LoadManager::new(config.load_debounce),
            listener: RealtimeListener::new(feed, config.reconnect, listener_tx),
            config,
            commands,
            events_tx,
            events,
            listener_events,
            snapshot,
            replies: Vec::new(),
            epoch: 0,
            key: None,
            ready: false,
            record: None,
            edit: LocalEditState::default(),
            remote: RemoteUpdateFlag::default(),
            baseline_seq: 0,
            last_local_write_at: None,
            error: None,
            realtime: RealtimeStatus::Idle,
            saving: None,
            save_queue: VecDeque::new(),
            held: Vec::new(),
        }
    }

    async fn run(mut self) {
        loop {
            let keep_running = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => false,
                },
                Some(event) = self.events.recv() => {
                    self.handle_event(event);
                    true
                }
                Some(event) = self.listener_events.recv() => {
                    self.handle_listener_event(event);
                    true
                }
                () = self.loader.debounce_elapsed() => {
                    self.on_debounce_elapsed();
                    true
                }
                () = self.autosave.elapsed() => {
                    self.on_autosave_elapsed();
                    true
                }
            };

            if !keep_running {
                self.shutdown();
            }
            self.sync_autosave();
            self.publish();
            for (reply, result) in self.replies.drain(..) {
                let _ = reply.send(result);
            }
            if !keep_running {
                break;
            }
        }
        tracing::debug!("Note session stopped");
    }

    fn respond(&mut self, reply: Option<Reply>, result: Result<()>) {
        if let Some(reply) = reply {
            self.replies.push((reply, result));
        }
    }

    fn conflict_state(&self) -> ConflictState {
        ConflictState::derive(self.edit.has_unsaved_changes(), self.remote.pending)
    }

    fn sync_autosave(&mut self) {
        let enabled = self.ready
            && self.key.is_some()
            && !self.loader.is_loading()
            && self.conflict_state().autosave_allowed();
        self.autosave.set_enabled(enabled);
    }

    fn publish(&self) {
        let next = SessionSnapshot {
            note_ready: self.ready,
            is_loading: self.loader.is_loading() || self.loader.pending_key().is_some(),
            is_saving: self.saving.is_some(),
            has_unsaved_changes: self.edit.has_unsaved_changes(),
            last_saved_at: self.edit.last_saved_at,
            remote_update_available: self.remote.pending,
            remote_updated_at: self.remote.remote_updated_at,
            conflict_state: self.conflict_state(),
            error: self.error.clone(),
            realtime: self.realtime,
            record: self.record.clone(),
            content: self.edit.live_content.clone(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Load { key, reply } => {
                let result = self.load(key);
                self.respond(Some(reply), result);
            }
            Command::Edit { content, reply } => {
                let result = self.edit(content);
                self.respond(Some(reply), result);
            }
            Command::ManualSave { reply } => self.manual_save(reply),
            Command::Reload {
                confirmation,
                reply,
            } => self.reload(confirmation, reply),
            Command::UseTheirs { reply } => self.use_theirs(reply),
            Command::KeepMine { reply } => self.keep_mine(reply),
            Command::DismissRemoteUpdate { reply } => {
                if self.remote.pending {
                    tracing::info!("Remote update dismissed");
                }
                self.remote.clear();
                self.respond(Some(reply), Ok(()));
            }
            Command::DismissError { reply } => {
                self.error = None;
                self.respond(Some(reply), Ok(()));
            }
            Command::Close { reply } => {
                self.respond(Some(reply), Ok(()));
                return false;
            }
        }
        true
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Loaded(outcome) => self.on_loaded(outcome),
            Event::Saved(outcome) => self.on_saved(outcome),
        }
    }

    // --- key and load lifecycle ---

    fn load(&mut self, raw: String) -> Result<()> {
        let is_active = self.key.as_ref().is_some_and(|key| key.as_str() == raw)
            && (self.ready || self.loader.is_loading());
        let is_pending = self
            .loader
            .pending_key()
            .is_some_and(|key| key.as_str() == raw);
        if is_active || is_pending {
            return Ok(());
        }

        self.reset_for_key_change();
        let key = NoteKey::parse(raw)?;
        tracing::debug!(epoch = self.epoch, "Note load scheduled");
        self.loader.schedule(key);
        Ok(())
    }

    fn reset_for_key_change(&mut self) {
        self.loader.cancel();
        self.detach_listener();
        self.epoch += 1;
        self.key = None;
        self.ready = false;
        self.record = None;
        self.edit = LocalEditState::default();
        self.remote.clear();
        self.autosave.resync("");
        self.last_local_write_at = None;
        self.error = None;
        self.held.clear();

        // Saves already issued still reach the server, but their results
        // belong to the previous note.
        if let Some(in_flight) = self.saving.take() {
            self.respond(in_flight.reply, Err(Error::Cancelled));
        }
        for queued in mem::take(&mut self.save_queue) {
            self.respond(queued.reply, Err(Error::Cancelled));
        }
    }

    fn on_debounce_elapsed(&mut self) {
        if let Some(key) = self.loader.fire() {
            self.key = Some(key.clone());
            self.start_load(key, LoadPurpose::Initial, None);
        }
    }

    fn start_load(&mut self, key: NoteKey, purpose: LoadPurpose, reply: Option<Reply>) {
        tracing::info!(?purpose, epoch = self.epoch, "Loading note");
        let events = self.events_tx.clone();
        self.loader.start(&self.store, key, purpose, reply, move |outcome| {
            let _ = events.send(Event::Loaded(outcome));
        });
    }

    fn on_loaded(&mut self, outcome: LoadOutcome) {
        let Some(load) = self.loader.finish(outcome.generation) else {
            tracing::debug!(generation = outcome.generation, "Ignoring stale load result");
            return;
        };

        match (load.purpose, outcome.result) {
            (_, Err(Error::Cancelled)) => {
                tracing::debug!("Load cancelled");
                self.respond(load.reply, Err(Error::Cancelled));
            }
            (LoadPurpose::AutoReload, Ok(record)) => {
                if self.edit.has_unsaved_changes() {
                    // Typed while the reload was in flight; the user decides now
                    tracing::info!("Local edits made during auto-reload; awaiting resolution");
                } else {
                    self.apply_loaded(Some(record));
                }
                self.respond(load.reply, Ok(()));
            }
            (LoadPurpose::AutoReload, Err(error)) => {
                tracing::warn!(error = %error, "Auto-reload failed");
                self.error = Some(error.user_message());
                self.respond(load.reply, Err(error));
            }
            (_, Ok(record)) => {
                self.apply_loaded(Some(record));
                self.respond(load.reply, Ok(()));
            }
            (_, Err(Error::NotFound(_))) => {
                tracing::info!("Note does not exist yet; it will be created on first save");
                self.apply_loaded(None);
                self.respond(load.reply, Ok(()));
            }
            (LoadPurpose::Initial, Err(error)) => {
                tracing::warn!(error = %error, "Note load failed");
                self.error = Some(error.user_message());
                self.respond(load.reply, Err(error));
            }
            (LoadPurpose::Discard, Err(error)) => {
                tracing::warn!(error = %error, "Reload failed");
                self.respond(load.reply, Err(error));
            }
        }
    }

    /// Adopt `record` (or an empty, not yet created note) as the new baseline.
    fn apply_loaded(&mut self, record: Option<NoteRecord>) {
        let content = record
            .as_ref()
            .map(|record| record.content.clone())
            .unwrap_or_default();
        // A change announced after this read is still pending
        let superseded = self.remote.pending
            && record
                .as_ref()
                .zip(self.remote.remote_updated_at)
                .is_some_and(|(record, remote_at)| remote_at > record.updated_at);
        self.edit.apply_baseline(&content);
        self.autosave.resync(&content);
        if !superseded {
            self.remote.clear();
        }
        self.ready = true;
        self.error = None;
        self.baseline_seq += 1;
        self.record = record.as_ref().map(RecordSummary::from);

        let record_id = self.record.as_ref().map(|summary| {
            tracing::info!(record_id = %summary.id, version = summary.version, "Note loaded");
            summary.id.clone()
        });
        match record_id {
            Some(record_id) => self.attach_listener(&record_id),
            None => self.detach_listener(),
        }

        if superseded {
            tracing::info!("Loaded copy is older than the latest remote change; reloading again");
            self.evaluate_remote();
        }
    }

    fn reload(&mut self, confirmation: ReloadConfirmation, reply: Reply) {
        if let Err(error) = check_reload(self.edit.has_unsaved_changes(), confirmation) {
            self.respond(Some(reply), Err(error));
            return;
        }

        let key = match self.key.clone() {
            Some(key) => key,
            None => match self.loader.take_pending() {
                Some(key) => {
                    self.key = Some(key.clone());
                    key
                }
                None => {
                    self.respond(Some(reply), Err(no_note_loaded()));
                    return;
                }
            },
        };
        let purpose = if self.ready {
            LoadPurpose::Discard
        } else {
            LoadPurpose::Initial
        };
        self.start_load(key, purpose, Some(reply));
    }

    fn use_theirs(&mut self, reply: Reply) {
        let Some(key) = self.key.clone().filter(|_| self.ready) else {
            self.respond(Some(reply), Err(no_note_loaded()));
            return;
        };
        tracing::info!("Discarding local edits in favour of the server copy");
        self.start_load(key, LoadPurpose::Discard, Some(reply));
    }

    // --- edits and saves ---

    fn edit(&mut self, content: String) -> Result<()> {
        if !self.ready {
            return Err(no_note_loaded());
        }
        self.edit.live_content = content;
        self.sync_autosave();
        self.autosave.on_edit(&self.edit.live_content);
        self.evaluate_remote();
        Ok(())
    }

    fn on_autosave_elapsed(&mut self) {
        if self.autosave.fire(&self.edit.live_content) {
            self.request_save(SaveRequest {
                origin: SaveOrigin::Autosave,
                reply: None,
            });
        }
    }

    fn manual_save(&mut self, reply: Reply) {
        if !self.ready {
            self.respond(Some(reply), Err(no_note_loaded()));
            return;
        }
        if let Err(error) = check_manual_save(self.conflict_state()) {
            self.respond(Some(reply), Err(error));
            return;
        }
        if !self.edit.has_unsaved_changes() && self.saving.is_none() {
            self.respond(Some(reply), Ok(()));
            return;
        }
        self.autosave.cancel();
        self.request_save(SaveRequest {
            origin: SaveOrigin::Manual,
            reply: Some(reply),
        });
    }

    fn keep_mine(&mut self, reply: Reply) {
        if !self.ready {
            self.respond(Some(reply), Err(no_note_loaded()));
            return;
        }
        tracing::info!("Overwriting the server copy with local content");
        self.autosave.cancel();
        self.request_save(SaveRequest {
            origin: SaveOrigin::KeepMine,
            reply: Some(reply),
        });
    }

    fn request_save(&mut self, request: SaveRequest) {
        if self.saving.is_none() {
            self.dispatch_save(request);
            return;
        }

        let duplicate_autosave = request.origin == SaveOrigin::Autosave
            && self
                .save_queue
                .iter()
                .any(|queued| queued.origin == SaveOrigin::Autosave);
        if !duplicate_autosave {
            tracing::debug!(origin = ?request.origin, "Save queued behind in-flight save");
            self.save_queue.push_back(request);
        }
    }

    fn dispatch_save(&mut self, request: SaveRequest) {
        let Some(key) = self.key.clone() else {
            self.respond(request.reply, Err(no_note_loaded()));
            return;
        };

        let mode = request.origin.mode();
        if mode == SaveMode::Checked {
            if self.remote.pending {
                if request.origin == SaveOrigin::Autosave {
                    tracing::debug!("Autosave skipped while a remote update is pending");
                } else {
                    self.respond(request.reply, Err(Error::ConflictPending));
                }
                return;
            }
            if !self.edit.has_unsaved_changes() {
                self.respond(request.reply, Ok(()));
                return;
            }
        }

        let content = self.edit.live_content.clone();
        let expected_version = mode.expected_version(self.record.as_ref().map(|record| record.version));
        tracing::info!(
            origin = ?request.origin,
            expected_version = ?expected_version,
            "Saving note"
        );

        let store = Arc::clone(&self.store);
        let events = self.events_tx.clone();
        let epoch = self.epoch;
        let baseline_seq = self.baseline_seq;
        let origin = request.origin;
        self.saving = Some(request);
        tokio::spawn(async move {
            let result = store.save(&key, &content, expected_version).await;
            let _ = events.send(Event::Saved(SaveOutcome {
                epoch,
                baseline_seq,
                origin,
                content,
                result,
            }));
        });
    }

    fn on_saved(&mut self, outcome: SaveOutcome) {
        if outcome.epoch != self.epoch {
            tracing::debug!("Ignoring save result for a previous note");
            return;
        }
        let Some(in_flight) = self.saving.take() else {
            return;
        };

        match outcome.result {
            Ok(record) => {
                tracing::info!(record_id = %record.id, version = record.version, "Note saved");
                self.last_local_write_at = Some(record.updated_at);
                if outcome.baseline_seq == self.baseline_seq {
                    self.edit.mark_saved(&outcome.content, record.updated_at);
                    self.autosave.on_save_succeeded(&outcome.content);
                    self.record = Some(RecordSummary::from(&record));
                    self.error = None;
                    if outcome.origin == SaveOrigin::KeepMine {
                        self.remote.clear();
                    }
                    self.attach_listener(&record.id);
                } else {
                    tracing::debug!("A reload replaced the baseline while saving; keeping the reloaded state");
                }
                self.respond(in_flight.reply, Ok(()));
            }
            Err(Error::VersionConflict { current_version }) => {
                tracing::warn!(?current_version, "Save rejected: the server has a newer version");
                self.remote.raise(None);
                self.respond(
                    in_flight.reply,
                    Err(Error::VersionConflict { current_version }),
                );
            }
            Err(error) => {
                tracing::warn!(origin = ?outcome.origin, error = %error, "Save failed");
                if outcome.origin == SaveOrigin::Autosave {
                    self.error = Some(error.user_message());
                }
                self.respond(in_flight.reply, Err(error));
            }
        }

        for notification in mem::take(&mut self.held) {
            self.on_notification(&notification);
        }
        self.sync_autosave();
        self.evaluate_remote();

        while self.saving.is_none() {
            let Some(next) = self.save_queue.pop_front() else {
                break;
            };
            self.dispatch_save(next);
        }
    }

    // --- realtime ---

    fn attach_listener(&mut self, record_id: &RecordId) {
        if self.listener.active_record() != Some(record_id) {
            self.listener.attach(record_id);
            self.realtime = RealtimeStatus::Connecting;
        }
    }

    fn detach_listener(&mut self) {
        self.listener.detach();
        self.realtime = RealtimeStatus::Idle;
    }

    fn handle_listener_event(&mut self, event: ListenerEvent) {
        if !self.listener.is_current(event.subscription) {
            tracing::debug!(subscription = event.subscription, "Dropping event from retired subscription");
            return;
        }
        match event.signal {
            ListenerSignal::Status(status) => self.realtime = status,
            ListenerSignal::Change(notification) => {
                if self.saving.is_some() {
                    self.held.push(notification);
                    return;
                }
                self.on_notification(&notification);
                self.sync_autosave();
                self.evaluate_remote();
            }
        }
    }

    fn on_notification(&mut self, notification: &ChangeNotification) {
        let Some(record) = &self.record else {
            return;
        };
        match classify(
            notification,
            &record.id,
            Some(record.updated_at),
            self.last_local_write_at,
            self.config.self_echo_window,
        ) {
            Classification::OtherRecord => {}
            Classification::SelfEcho => {
                tracing::debug!(record_id = %notification.record_id, "Ignoring echo of our own save");
            }
            Classification::AlreadyApplied => {
                tracing::debug!(record_id = %notification.record_id, "Ignoring change we already hold");
            }
            Classification::Foreign => {
                tracing::info!(
                    record_id = %notification.record_id,
                    updated_at = %notification.updated_at,
                    "Remote update available"
                );
                self.remote.raise(Some(notification.updated_at));
            }
        }
    }

    /// Reload automatically when a remote update is pending and nothing
    /// local would be lost.
    fn evaluate_remote(&mut self) {
        if self.conflict_state().remote_decision() != RemoteDecision::AutoReload {
            return;
        }
        if !self.ready || self.loader.is_loading() || self.saving.is_some() {
            return;
        }
        if let Some(key) = self.key.clone() {
            self.start_load(key, LoadPurpose::AutoReload, None);
        }
    }

    fn shutdown(&mut self) {
        self.loader.cancel();
        self.detach_listener();
        self.autosave.set_enabled(false);
        if let Some(in_flight) = self.saving.take() {
            self.respond(in_flight.reply, Err(Error::SessionClosed));
        }
        for queued in mem::take(&mut self.save_queue) {
            self.respond(queued.reply, Err(Error::SessionClosed));
        }
        self.ready = false;
    }
}

fn no_note_loaded() -> Error {
    Error::Validation("No note is loaded".to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::{MemoryNoteStore, StoreCall};

    fn start(store: &MemoryNoteStore) -> NoteSession {
        NoteSession::spawn(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            SyncConfig::default(),
        )
    }

    async fn wait_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    async fn open(store: &MemoryNoteStore, key: &str) -> NoteSession {
        let session = start(store);
        session.load(key).await.unwrap();
        wait_ms(600).await;
        assert!(session.snapshot().note_ready);
        session
    }

    /// Saved once, edited again, then another device writes.
    async fn into_conflict(store: &MemoryNoteStore) -> NoteSession {
        store.remote_write("abc", "base");
        let session = open(store, "abc").await;
        session.edit("local").await.unwrap();
        wait_ms(1_100).await;
        session.edit("local 2").await.unwrap();

        store.advance_clock(chrono::Duration::seconds(5));
        store.remote_write("abc", "theirs");
        wait_ms(10).await;
        assert_eq!(
            session.snapshot().conflict_state,
            ConflictState::ConflictPendingDirty
        );
        session
    }

    fn millis(ms: i64) -> chrono::Duration {
        chrono::Duration::milliseconds(ms)
    }

    #[tokio::test(start_paused = true)]
    async fn new_key_loads_after_debounce_and_missing_note_is_editable() {
        let store = MemoryNoteStore::new();
        let session = start(&store);
        session.load("abc").await.unwrap();

        wait_ms(400).await;
        assert_eq!(store.fetch_count(), 0);
        assert!(session.snapshot().is_loading);

        wait_ms(200).await;
        assert_eq!(store.fetch_count(), 1);
        let snapshot = session.snapshot();
        assert!(snapshot.note_ready);
        assert!(!snapshot.is_loading);
        assert_eq!(snapshot.record, None);
        assert_eq!(snapshot.content, "");
        assert_eq!(snapshot.conflict_state, ConflictState::Clean);
        assert_eq!(snapshot.realtime, RealtimeStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn edit_burst_saves_once_with_last_value_and_known_version() {
        let store = MemoryNoteStore::new();
        let session = open(&store, "abc").await;

        session.edit("h").await.unwrap();
        wait_ms(300).await;
        session.edit("he").await.unwrap();
        wait_ms(300).await;
        session.edit("hello").await.unwrap();
        assert!(session.snapshot().has_unsaved_changes);

        wait_ms(999).await;
        assert!(store.saves().is_empty());

        wait_ms(2).await;
        assert_eq!(store.saves(), vec![("hello".to_string(), Some(0))]);
        let snapshot = session.snapshot();
        assert!(!snapshot.has_unsaved_changes);
        assert!(snapshot.last_saved_at.is_some());
        assert_eq!(snapshot.record.map(|record| record.version), Some(1));

        session.edit("hello world").await.unwrap();
        wait_ms(1_100).await;
        assert_eq!(store.saves()[1], ("hello world".to_string(), Some(1)));
        assert_eq!(store.record("abc").unwrap().content, "hello world");
        assert!(!session.snapshot().remote_update_available);
    }

    #[tokio::test(start_paused = true)]
    async fn editing_back_to_baseline_saves_nothing() {
        let store = MemoryNoteStore::new();
        store.remote_write("abc", "base");
        let session = open(&store, "abc").await;

        session.edit("base!").await.unwrap();
        wait_ms(500).await;
        session.edit("base").await.unwrap();
        wait_ms(3_000).await;

        assert!(store.saves().is_empty());
        assert!(!session.snapshot().has_unsaved_changes);
    }

    #[tokio::test(start_paused = true)]
    async fn short_key_is_rejected_without_network() {
        let store = MemoryNoteStore::new();
        let session = start(&store);

        let error = session.load("ab").await.unwrap_err();
        assert!(matches!(error, Error::Validation(_)));
        wait_ms(2_000).await;

        assert_eq!(store.fetch_count(), 0);
        assert!(!session.snapshot().note_ready);
        assert!(matches!(
            session.edit("x").await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fast_key_changes_load_only_the_last_key() {
        let store = MemoryNoteStore::new();
        let session = start(&store);

        let _ = session.load("ab").await;
        wait_ms(100).await;
        session.load("abc").await.unwrap();
        wait_ms(100).await;
        session.load("abcd").await.unwrap();
        wait_ms(600).await;

        assert_eq!(
            store.calls(),
            vec![StoreCall::Fetch {
                key: "abcd".to_string()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn loading_the_same_key_again_keeps_local_state() {
        let store = MemoryNoteStore::new();
        store.remote_write("abc", "base");
        let session = open(&store, "abc").await;

        session.edit("draft").await.unwrap();
        session.load("abc").await.unwrap();
        wait_ms(600).await;

        assert_eq!(session.snapshot().content, "draft");
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_keys_cancels_the_in_flight_load() {
        let store = MemoryNoteStore::new();
        store.remote_write("first key", "first");
        store.remote_write("second key", "second");
        store.set_fetch_delay(Duration::from_millis(300));
        let session = start(&store);

        session.load("first key").await.unwrap();
        wait_ms(600).await;
        assert!(session.snapshot().is_loading);

        session.load("second key").await.unwrap();
        // The first response would have landed by now
        wait_ms(250).await;
        let snapshot = session.snapshot();
        assert!(!snapshot.note_ready);
        assert_eq!(snapshot.content, "");

        wait_ms(600).await;
        let snapshot = session.snapshot();
        assert!(snapshot.note_ready);
        assert_eq!(snapshot.content, "second");
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn echo_of_own_save_is_ignored_but_later_changes_raise_the_flag() {
        let store = MemoryNoteStore::new();
        store.remote_write("abc", "base");
        let session = open(&store, "abc").await;

        session.edit("mine").await.unwrap();
        wait_ms(1_100).await;
        let snapshot = session.snapshot();
        let saved_at = snapshot.last_saved_at.unwrap();
        let record_id = snapshot.record.unwrap().id;

        store.publish_change(ChangeNotification {
            record_id: record_id.clone(),
            updated_at: saved_at + millis(1_500),
        });
        wait_ms(10).await;
        assert!(!session.snapshot().remote_update_available);

        session.edit("mine, more").await.unwrap();
        store.publish_change(ChangeNotification {
            record_id,
            updated_at: saved_at + millis(5_000),
        });
        wait_ms(10).await;
        let snapshot = session.snapshot();
        assert!(snapshot.remote_update_available);
        assert_eq!(snapshot.remote_updated_at, Some(saved_at + millis(5_000)));
        assert_eq!(snapshot.conflict_state, ConflictState::ConflictPendingDirty);

        // The armed autosave was cancelled and new edits do not re-arm it
        wait_ms(2_000).await;
        session.edit("mine, even more").await.unwrap();
        wait_ms(2_000).await;
        assert_eq!(store.saves().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_update_while_clean_reloads_automatically() {
        let store = MemoryNoteStore::new();
        store.remote_write("abc", "base");
        let session = open(&store, "abc").await;
        assert_eq!(session.snapshot().realtime, RealtimeStatus::Live);

        store.remote_write("abc", "theirs");
        wait_ms(10).await;

        let snapshot = session.snapshot();
        assert_eq!(snapshot.content, "theirs");
        assert!(!snapshot.remote_update_available);
        assert_eq!(snapshot.conflict_state, ConflictState::Clean);
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn change_during_auto_reload_is_not_lost() {
        let store = MemoryNoteStore::new();
        store.remote_write("abc", "base");
        let session = open(&store, "abc").await;
        store.set_fetch_reply_delay(Duration::from_millis(200));

        // The reload reads "theirs" right away but answers later
        store.remote_write("abc", "theirs");
        wait_ms(50).await;
        store.remote_write("abc", "third");
        wait_ms(250).await;

        let snapshot = session.snapshot();
        assert_eq!(snapshot.content, "theirs");
        assert!(snapshot.remote_update_available);
        assert_eq!(snapshot.conflict_state, ConflictState::ConflictPendingClean);

        wait_ms(300).await;
        let snapshot = session.snapshot();
        assert_eq!(snapshot.content, "third");
        assert!(!snapshot.remote_update_available);
        assert_eq!(snapshot.conflict_state, ConflictState::Clean);
        assert_eq!(store.fetch_count(), 3);
        assert!(store.saves().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn edits_during_auto_reload_turn_into_a_conflict() {
        let store = MemoryNoteStore::new();
        store.remote_write("abc", "base");
        let session = open(&store, "abc").await;
        store.set_fetch_delay(Duration::from_millis(200));

        store.remote_write("abc", "theirs");
        wait_ms(50).await;
        session.edit("typed").await.unwrap();
        wait_ms(300).await;

        let snapshot = session.snapshot();
        assert_eq!(snapshot.content, "typed");
        assert!(snapshot.remote_update_available);
        assert_eq!(snapshot.conflict_state, ConflictState::ConflictPendingDirty);
        assert!(store.saves().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn use_theirs_replaces_local_content() {
        let store = MemoryNoteStore::new();
        let session = into_conflict(&store).await;

        session.use_theirs().await.unwrap();

        let snapshot = session.snapshot();
        assert_eq!(snapshot.content, "theirs");
        assert!(!snapshot.has_unsaved_changes);
        assert!(!snapshot.remote_update_available);
        assert_eq!(snapshot.conflict_state, ConflictState::Clean);
        assert_eq!(snapshot.record.map(|record| record.version), Some(3));

        wait_ms(2_000).await;
        assert_eq!(store.saves().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_mine_overwrites_without_version_check() {
        let store = MemoryNoteStore::new();
        let session = into_conflict(&store).await;

        session.keep_mine().await.unwrap();

        assert_eq!(
            store.saves().last(),
            Some(&("local 2".to_string(), None))
        );
        assert_eq!(store.record("abc").unwrap().content, "local 2");

        wait_ms(100).await;
        let snapshot = session.snapshot();
        assert!(!snapshot.remote_update_available);
        assert!(!snapshot.has_unsaved_changes);
        assert_eq!(snapshot.record.map(|record| record.version), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn dismissing_the_flag_reenables_autosave_for_new_edits() {
        let store = MemoryNoteStore::new();
        let session = into_conflict(&store).await;

        session.dismiss_remote_update().await.unwrap();
        assert_eq!(session.snapshot().conflict_state, ConflictState::Dirty);
        wait_ms(2_000).await;
        assert_eq!(store.saves().len(), 1);

        session.edit("local 3").await.unwrap();
        wait_ms(1_100).await;
        assert_eq!(
            store.saves().last(),
            Some(&("local 3".to_string(), Some(2)))
        );
        assert_eq!(
            session.snapshot().conflict_state,
            ConflictState::ConflictPendingDirty
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_save_raises_the_flag_and_blocks_manual_save() {
        let store = MemoryNoteStore::new();
        store.remote_write("abc", "base");
        store.fail_next_connects(100);
        let session = open(&store, "abc").await;

        // Nobody is subscribed, so this write goes unnoticed
        store.remote_write("abc", "other device");
        session.edit("mine").await.unwrap();
        wait_ms(1_100).await;

        assert_eq!(store.saves(), vec![("mine".to_string(), Some(1))]);
        let snapshot = session.snapshot();
        assert!(snapshot.remote_update_available);
        assert_eq!(snapshot.conflict_state, ConflictState::ConflictPendingDirty);
        assert_eq!(snapshot.error, None);

        assert!(matches!(
            session.manual_save().await,
            Err(Error::ConflictPending)
        ));
        assert_eq!(store.saves().len(), 1);

        session.keep_mine().await.unwrap();
        assert_eq!(store.record("abc").unwrap().content, "mine");
        assert_eq!(session.snapshot().conflict_state, ConflictState::Clean);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_save_reports_failures_to_the_caller() {
        let store = MemoryNoteStore::new();
        let session = open(&store, "abc").await;

        session.edit("first").await.unwrap();
        session.manual_save().await.unwrap();
        assert_eq!(store.saves(), vec![("first".to_string(), Some(0))]);

        // Nothing left to save
        session.manual_save().await.unwrap();
        assert_eq!(store.saves().len(), 1);

        store.fail_next_save(Error::Network("offline".into()));
        session.edit("second").await.unwrap();
        let error = session.manual_save().await.unwrap_err();
        assert!(matches!(error, Error::Network(_)));

        let snapshot = session.snapshot();
        assert!(snapshot.has_unsaved_changes);
        assert_eq!(snapshot.error, None);

        wait_ms(2_000).await;
        assert_eq!(store.saves().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn autosave_failure_sets_the_banner_and_retries_on_next_edit() {
        let store = MemoryNoteStore::new();
        let session = open(&store, "abc").await;

        store.fail_next_save(Error::Network("offline".into()));
        session.edit("a").await.unwrap();
        wait_ms(1_100).await;
        let snapshot = session.snapshot();
        assert_eq!(
            snapshot.error.as_deref(),
            Some("No internet connection. Please check your network.")
        );
        assert!(snapshot.has_unsaved_changes);

        wait_ms(3_000).await;
        assert_eq!(store.saves().len(), 1);

        session.dismiss_error().await.unwrap();
        assert_eq!(session.snapshot().error, None);

        session.edit("ab").await.unwrap();
        wait_ms(1_100).await;
        assert_eq!(store.saves().len(), 2);
        assert!(!session.snapshot().has_unsaved_changes);
    }

    #[tokio::test(start_paused = true)]
    async fn reload_with_unsaved_changes_needs_confirmation() {
        let store = MemoryNoteStore::new();
        store.remote_write("abc", "base");
        let session = open(&store, "abc").await;

        session.edit("draft").await.unwrap();
        assert!(matches!(
            session.reload(ReloadConfirmation::Unconfirmed).await,
            Err(Error::UnsavedChanges)
        ));
        assert_eq!(session.snapshot().content, "draft");

        session
            .reload(ReloadConfirmation::DiscardLocalChanges)
            .await
            .unwrap();
        let snapshot = session.snapshot();
        assert_eq!(snapshot.content, "base");
        assert!(!snapshot.has_unsaved_changes);

        wait_ms(2_000).await;
        assert!(store.saves().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn saves_are_serialised_and_echoes_outrunning_the_response_are_ignored() {
        let store = MemoryNoteStore::new();
        store.remote_write("abc", "base");
        let session = open(&store, "abc").await;
        store.set_save_delay(Duration::from_millis(300));

        session.edit("one").await.unwrap();
        wait_ms(1_050).await;
        assert!(session.snapshot().is_saving);

        session.edit("two").await.unwrap();
        session.manual_save().await.unwrap();

        assert_eq!(
            store.saves(),
            vec![("one".to_string(), Some(1)), ("two".to_string(), Some(2))]
        );
        wait_ms(100).await;
        let snapshot = session.snapshot();
        assert!(!snapshot.remote_update_available);
        assert!(!snapshot.has_unsaved_changes);
        assert_eq!(snapshot.content, "two");
    }

    #[tokio::test(start_paused = true)]
    async fn save_finishing_after_a_key_switch_does_not_touch_the_new_note() {
        let store = MemoryNoteStore::new();
        store.remote_write("second key", "second");
        let session = open(&store, "first key").await;
        store.set_save_delay(Duration::from_millis(300));

        session.edit("draft").await.unwrap();
        wait_ms(1_050).await;
        assert!(session.snapshot().is_saving);

        session.load("second key").await.unwrap();
        wait_ms(700).await;

        let snapshot = session.snapshot();
        assert_eq!(snapshot.content, "second");
        assert_eq!(snapshot.last_saved_at, None);
        assert!(!snapshot.is_saving);
        assert_eq!(store.record("first key").unwrap().content, "draft");
    }

    #[tokio::test(start_paused = true)]
    async fn realtime_degrades_after_retries_and_reload_still_works() {
        let store = MemoryNoteStore::new();
        store.remote_write("abc", "base");
        store.fail_next_connects(100);
        let session = open(&store, "abc").await;

        wait_ms(10_000).await;
        assert_eq!(session.snapshot().realtime, RealtimeStatus::Degraded);
        assert_eq!(store.connect_count(), 5);

        store.remote_write("abc", "theirs");
        session
            .reload(ReloadConfirmation::Unconfirmed)
            .await
            .unwrap();
        assert_eq!(session.snapshot().content, "theirs");
    }

    #[tokio::test(start_paused = true)]
    async fn closed_session_rejects_actions() {
        let store = MemoryNoteStore::new();
        let session = open(&store, "abc").await;

        session.close().await.unwrap();
        assert!(matches!(
            session.edit("x").await,
            Err(Error::SessionClosed)
        ));
    }
}
