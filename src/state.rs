//! Agent state shared between the worker thread and the control surface.
//!
//! All mutation goes through [`Shared::mutate`], which holds the single state
//! mutex, bumps `update_id` when something observable changed and republishes
//! the lock-free [`StatusSnapshot`] that pollers read.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;

use crate::conversation::{Conversation, TurnPreview};
use crate::events::EventBus;
use crate::types::{ActionResult, RELEVANT_UPDATE_MAX_CHARS};

/// Number of trailing turns exposed through `/debug`.
pub const PREVIEW_TURNS: usize = 6;

#[derive(Debug, Clone, Default)]
pub struct LoopState {
    pub running: bool,
    pub idle: bool,
    pub thread_alive: bool,
    pub current_goal: Option<String>,
    pub goals_history: Vec<String>,
    /// A replacement goal the worker has not applied yet.
    pub pending_goal: Option<String>,
    pub relevant_update: Option<String>,
    pub update_id: u64,
    pub last_results: Vec<(String, ActionResult)>,
    pub current_url: Option<String>,
    pub contents_len: usize,
    pub contents_preview: Vec<TurnPreview>,
    /// Bumped by every start; a worker only clears the running flags of its
    /// own session.
    pub session: u64,
}

impl LoopState {
    /// Store a notable message. Returns false when nothing changed.
    pub fn set_relevant_update(&mut self, message: &str) -> bool {
        let trimmed = message.trim();
        if trimmed.is_empty() {
            return false;
        }
        let capped = cap_message(trimmed);
        if self.relevant_update.as_deref() == Some(capped.as_str()) {
            return false;
        }
        self.relevant_update = Some(capped);
        true
    }

    /// Make `goal` current, retiring the previous goal into the history.
    pub fn replace_goal(&mut self, goal: &str) {
        self.retire_goal(Some(goal));
        self.current_goal = Some(goal.to_string());
    }

    /// Move the current goal into the history unless it repeats `next` or
    /// the last history entry.
    pub fn retire_goal(&mut self, next: Option<&str>) {
        if let Some(prev) = self.current_goal.take() {
            let repeats_last = self.goals_history.last().is_some_and(|g| *g == prev);
            if next != Some(prev.as_str()) && !repeats_last {
                self.goals_history.push(prev);
            }
        }
    }

    pub fn record_conversation(&mut self, conversation: &Conversation) {
        self.contents_len = conversation.len();
        self.contents_preview = conversation.preview(PREVIEW_TURNS);
    }
}

fn cap_message(message: &str) -> String {
    if message.chars().count() <= RELEVANT_UPDATE_MAX_CHARS {
        return message.to_string();
    }
    let mut capped: String = message.chars().take(RELEVANT_UPDATE_MAX_CHARS - 3).collect();
    capped.push_str("...");
    capped
}

/// What `/status` and `/debug` report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub idle: bool,
    pub thread_alive: bool,
    pub current_goal: Option<String>,
    pub goals_history: Vec<String>,
    pub last_results: Vec<(String, ActionResult)>,
    pub current_url: Option<String>,
    pub update_id: u64,
    pub relevant_update: Option<String>,
    pub contents_len: usize,
    pub contents_preview: Vec<TurnPreview>,
}

impl From<&LoopState> for StatusSnapshot {
    fn from(s: &LoopState) -> Self {
        Self {
            running: s.running,
            idle: s.idle,
            thread_alive: s.thread_alive,
            current_goal: s.current_goal.clone(),
            goals_history: s.goals_history.clone(),
            last_results: s.last_results.clone(),
            current_url: s.current_url.clone(),
            update_id: s.update_id,
            relevant_update: s.relevant_update.clone(),
            contents_len: s.contents_len,
            contents_preview: s.contents_preview.clone(),
        }
    }
}

pub struct Shared {
    state: Mutex<LoopState>,
    wake: Condvar,
    snapshot: ArcSwap<StatusSnapshot>,
    pub events: EventBus,
}

impl Shared {
    pub fn new(events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LoopState::default()),
            wake: Condvar::new(),
            snapshot: ArcSwap::from_pointee(StatusSnapshot::default()),
            events,
        })
    }

    /// Apply `f` under the state lock. When it reports a change the update
    /// counter is bumped and a fresh snapshot is published.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut LoopState) -> (R, bool)) -> R {
        let mut state = self.state.lock();
        let (out, changed) = f(&mut state);
        if changed {
            state.update_id += 1;
            self.snapshot.store(Arc::new(StatusSnapshot::from(&*state)));
        }
        out
    }

    /// Shorthand for a mutation that always counts as a change.
    pub fn update(&self, f: impl FnOnce(&mut LoopState)) {
        self.mutate(|s| {
            f(s);
            ((), true)
        });
    }

    pub fn publish_update(&self, message: &str) -> bool {
        self.mutate(|s| {
            let changed = s.set_relevant_update(message);
            (changed, changed)
        })
    }

    /// Read without bumping anything.
    pub fn read<R>(&self, f: impl FnOnce(&LoopState) -> R) -> R {
        f(&self.state.lock())
    }

    pub fn snapshot(&self) -> Arc<StatusSnapshot> {
        self.snapshot.load_full()
    }

    pub fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock()
    }

    /// Block on the wake primitive for at most `timeout`.
    pub fn wait(&self, guard: &mut MutexGuard<'_, LoopState>, timeout: Duration) {
        let _ = self.wake.wait_for(guard, timeout);
    }

    pub fn wake(&self) {
        // Taking the lock orders the notify after any in-progress check.
        let _guard = self.state.lock();
        self.wake.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> Arc<Shared> {
        Shared::new(EventBus::default())
    }

    #[test]
    fn duplicate_updates_do_not_bump_the_counter() {
        let s = shared();
        assert!(s.publish_update("Done"));
        let id = s.snapshot().update_id;
        assert!(!s.publish_update("  Done  "));
        assert!(!s.publish_update("   "));
        assert_eq!(s.snapshot().update_id, id);
        assert!(s.publish_update("Next"));
        assert_eq!(s.snapshot().update_id, id + 1);
        assert_eq!(s.snapshot().relevant_update.as_deref(), Some("Next"));
    }

    #[test]
    fn long_updates_are_capped() {
        let mut state = LoopState::default();
        state.set_relevant_update(&"é".repeat(1500));
        let stored = state.relevant_update.unwrap();
        assert_eq!(stored.chars().count(), RELEVANT_UPDATE_MAX_CHARS);
        assert!(stored.ends_with("..."));

        let mut state = LoopState::default();
        state.set_relevant_update(&"a".repeat(1000));
        assert_eq!(state.relevant_update.unwrap().len(), 1000);
    }

    #[test]
    fn goal_history_skips_repeats() {
        let mut state = LoopState::default();
        state.replace_goal("a");
        assert!(state.goals_history.is_empty());
        state.replace_goal("b");
        state.replace_goal("b");
        assert_eq!(state.goals_history, vec!["a"]);
        state.replace_goal("a");
        assert_eq!(state.goals_history, vec!["a", "b"]);
        assert_eq!(state.current_goal.as_deref(), Some("a"));
    }

    #[test]
    fn snapshot_follows_mutations() {
        let s = shared();
        assert_eq!(s.snapshot().update_id, 0);
        s.update(|st| st.running = true);
        let snap = s.snapshot();
        assert!(snap.running);
        assert_eq!(snap.update_id, 1);
        assert!(!s.read(|st| st.idle));
    }
}
