//! Debounced autosave.

use std::time::Duration;

use super::schedule::ScheduledTask;

/// Decides when local edits should be persisted.
///
/// Tracks the last observed content (to ignore non-changes) and the last
/// content known to be on the server (to suppress redundant writes). Each
/// differing edit restarts the quiescence timer; the save itself is issued by
/// the owner with whatever content is current when the timer fires.
#[derive(Debug)]
pub struct AutosaveController {
    delay: Duration,
    enabled: bool,
    observed: String,
    saved: String,
    timer: ScheduledTask,
}

impl AutosaveController {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            enabled: false,
            observed: String::new(),
            saved: String::new(),
            timer: ScheduledTask::default(),
        }
    }

    pub const fn is_armed(&self) -> bool {
        self.timer.is_armed()
    }

    /// Enable or disable. Disabling cancels a pending save; enabling never
    /// schedules one by itself.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled && !enabled && self.timer.cancel() {
            tracing::debug!("Autosave suspended; pending save cancelled");
        }
        self.enabled = enabled;
    }

    /// Observe new editor content.
    pub fn on_edit(&mut self, content: &str) {
        if content == self.observed {
            return;
        }
        content.clone_into(&mut self.observed);
        if !self.enabled {
            return;
        }
        if content == self.saved {
            // Edited back to what the server has
            self.timer.cancel();
        } else {
            self.timer.arm(self.delay);
        }
    }

    /// Drop a pending save, e.g. when an explicit save supersedes it.
    pub fn cancel(&mut self) {
        self.timer.cancel();
    }

    /// Resolves when the quiescence window has passed.
    pub async fn elapsed(&self) {
        self.timer.elapsed().await;
    }

    /// Consume the timer. Returns `true` if `current` should be saved now.
    pub fn fire(&mut self, current: &str) -> bool {
        self.timer.fire() && self.enabled && current != self.saved
    }

    /// `content` is now on the server.
    pub fn on_save_succeeded(&mut self, content: &str) {
        content.clone_into(&mut self.saved);
    }

    /// Adopt an externally loaded baseline so it is not re-saved as an edit.
    pub fn resync(&mut self, baseline: &str) {
        baseline.clone_into(&mut self.observed);
        baseline.clone_into(&mut self.saved);
        self.timer.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(1000);

    fn enabled() -> AutosaveController {
        let mut controller = AutosaveController::new(DELAY);
        controller.set_enabled(true);
        controller
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_edits_fires_once_with_latest_content() {
        let mut controller = enabled();
        controller.on_edit("h");
        tokio::time::advance(Duration::from_millis(400)).await;
        controller.on_edit("he");
        tokio::time::advance(Duration::from_millis(400)).await;
        controller.on_edit("hello");
        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!controller.fire("hello"));

        controller.elapsed().await;
        assert!(controller.fire("hello"));
        assert!(!controller.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn identical_content_does_not_rearm() {
        let mut controller = enabled();
        controller.on_edit("same");
        tokio::time::advance(Duration::from_millis(600)).await;
        controller.on_edit("same");
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(controller.fire("same"));
    }

    #[test]
    fn editing_back_to_saved_content_cancels() {
        let mut controller = enabled();
        controller.resync("base");
        controller.on_edit("base!");
        assert!(controller.is_armed());
        controller.on_edit("base");
        assert!(!controller.is_armed());
    }

    #[test]
    fn resync_does_not_schedule_a_save() {
        let mut controller = enabled();
        controller.on_edit("draft");
        controller.resync("from server");
        assert!(!controller.is_armed());

        controller.on_edit("from server");
        assert!(!controller.is_armed());
    }

    #[test]
    fn disabling_cancels_and_enabling_does_not_fire() {
        let mut controller = enabled();
        controller.on_edit("draft");
        controller.set_enabled(false);
        assert!(!controller.is_armed());

        controller.on_edit("draft 2");
        controller.set_enabled(true);
        assert!(!controller.is_armed());

        controller.on_edit("draft 3");
        assert!(controller.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_save_leaves_marker_so_next_edit_retries() {
        let mut controller = enabled();
        controller.on_edit("one");
        controller.elapsed().await;
        assert!(controller.fire("one"));
        // no on_save_succeeded: the save failed

        controller.on_edit("one!");
        controller.elapsed().await;
        assert!(controller.fire("one!"));
        controller.on_save_succeeded("one!");

        controller.on_edit("one");
        assert!(controller.is_armed());
        controller.on_edit("one!");
        assert!(!controller.is_armed());
    }
}
