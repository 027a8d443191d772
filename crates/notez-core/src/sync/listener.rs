//! Realtime change listener.
//!
//! One subscription task per attached record. Every signal it emits is tagged
//! with a subscription id; once a record is detached its id is retired, so
//! nothing an old task still has queued can reach the state of the next note.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ReconnectPolicy;
use crate::feed::ChangeFeed;
use crate::models::{ChangeNotification, RecordId};

/// Health of the realtime channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RealtimeStatus {
    /// No record attached.
    #[default]
    Idle,
    Connecting,
    Live,
    /// Gave up reconnecting. Manual reloads still work.
    Degraded,
}

/// Outcome of inspecting one change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Belongs to a different record (collection-wide feeds).
    OtherRecord,
    /// Echo of our own last save.
    SelfEcho,
    /// Not newer than the record we already hold.
    AlreadyApplied,
    /// Someone else wrote the active record.
    Foreign,
}

/// Classify a notification against the active record.
///
/// `last_local_write_at` is the server timestamp of our own last successful
/// save, so both sides of the echo comparison come from the same clock.
pub fn classify(
    notification: &ChangeNotification,
    active_record: &RecordId,
    known_updated_at: Option<DateTime<Utc>>,
    last_local_write_at: Option<DateTime<Utc>>,
    echo_window: Duration,
) -> Classification {
    if &notification.record_id != active_record {
        return Classification::OtherRecord;
    }

    if let Some(written_at) = last_local_write_at {
        let distance = (notification.updated_at - written_at)
            .num_milliseconds()
            .unsigned_abs();
        if u128::from(distance) < echo_window.as_millis() {
            return Classification::SelfEcho;
        }
    }

    if known_updated_at.is_some_and(|known| notification.updated_at <= known) {
        return Classification::AlreadyApplied;
    }

    Classification::Foreign
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ListenerSignal {
    Status(RealtimeStatus),
    Change(ChangeNotification),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ListenerEvent {
    pub subscription: u64,
    pub signal: ListenerSignal,
}

#[derive(Debug)]
struct Subscription {
    id: u64,
    record_id: RecordId,
    token: CancellationToken,
}

/// Owns at most one live subscription.
pub(crate) struct RealtimeListener {
    feed: Arc<dyn ChangeFeed>,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<ListenerEvent>,
    next_id: u64,
    active: Option<Subscription>,
}

impl RealtimeListener {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        policy: ReconnectPolicy,
        events: mpsc::UnboundedSender<ListenerEvent>,
    ) -> Self {
        Self {
            feed,
            policy,
            events,
            next_id: 0,
            active: None,
        }
    }

    pub fn active_record(&self) -> Option<&RecordId> {
        self.active.as_ref().map(|subscription| &subscription.record_id)
    }

    /// Whether `subscription` is the live one.
    pub fn is_current(&self, subscription: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.id == subscription)
    }

    /// Subscribe to `record_id`, replacing any other subscription.
    pub fn attach(&mut self, record_id: &RecordId) {
        if self.active_record() == Some(record_id) {
            return;
        }
        self.detach();

        self.next_id += 1;
        let subscription = Subscription {
            id: self.next_id,
            record_id: record_id.clone(),
            token: CancellationToken::new(),
        };
        tokio::spawn(run_subscription(
            Arc::clone(&self.feed),
            record_id.clone(),
            self.policy,
            subscription.token.clone(),
            self.events.clone(),
            subscription.id,
        ));
        self.active = Some(subscription);
    }

    pub fn detach(&mut self) {
        if let Some(subscription) = self.active.take() {
            subscription.token.cancel();
            tracing::debug!(record_id = %subscription.record_id, "Realtime subscription torn down");
        }
    }
}

impl Drop for RealtimeListener {
    fn drop(&mut self) {
        self.detach();
    }
}

async fn run_subscription(
    feed: Arc<dyn ChangeFeed>,
    record_id: RecordId,
    policy: ReconnectPolicy,
    token: CancellationToken,
    events: mpsc::UnboundedSender<ListenerEvent>,
    subscription: u64,
) {
    let emit = |signal| {
        events
            .send(ListenerEvent {
                subscription,
                signal,
            })
            .is_ok()
    };

    let mut failures = 0_u32;
    loop {
        if !emit(ListenerSignal::Status(RealtimeStatus::Connecting)) {
            return;
        }

        let connected = tokio::select! {
            () = token.cancelled() => return,
            connected = feed.connect(&record_id) => connected,
        };

        match connected {
            Ok(mut stream) => {
                tracing::info!(record_id = %record_id, "Realtime connected");
                if !emit(ListenerSignal::Status(RealtimeStatus::Live)) {
                    return;
                }

                // A connection only counts as healthy once it delivered
                // something or stayed up for a full backoff period.
                let connected_at = Instant::now();
                let mut delivered = false;
                loop {
                    let item = tokio::select! {
                        () = token.cancelled() => return,
                        item = stream.next() => item,
                    };
                    match item {
                        Some(Ok(notification)) => {
                            delivered = true;
                            if !emit(ListenerSignal::Change(notification)) {
                                return;
                            }
                        }
                        Some(Err(error)) => {
                            tracing::warn!(record_id = %record_id, error = %error, "Realtime connection dropped");
                            break;
                        }
                        None => {
                            tracing::warn!(record_id = %record_id, "Realtime stream ended");
                            break;
                        }
                    }
                }
                if delivered || connected_at.elapsed() >= policy.max_delay {
                    failures = 0;
                }
            }
            Err(error) => {
                tracing::warn!(record_id = %record_id, error = %error, "Realtime connect failed");
            }
        }

        failures += 1;
        if failures >= policy.max_attempts {
            tracing::warn!(
                record_id = %record_id,
                attempts = failures,
                "Giving up on realtime updates"
            );
            emit(ListenerSignal::Status(RealtimeStatus::Degraded));
            return;
        }

        let delay = policy.delay_for(failures);
        tracing::debug!(record_id = %record_id, attempt = failures, delay_ms = delay.as_millis(), "Reconnecting");
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}
