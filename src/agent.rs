//! The agent control loop.
//!
//! One worker thread per session owns the browser and the conversation. The
//! control surface talks to it through [`Agent`]: a command queue, the
//! synchronized entry points `start`, `stop` and `update_goal`, and the
//! lock-free status snapshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::actions::{Action, Dispatcher, ParseError};
use crate::brain::ModelClient;
use crate::conversation::{Conversation, Turn};
use crate::error::{AgentError, BrowserError, DispatchError};
use crate::events::{AgentEvent, EventBus};
use crate::hands::Browser;
use crate::safety::{AutoAcknowledge, SafetyPolicy, SafetyVerdict, safety_decision};
use crate::state::{Shared, StatusSnapshot};
use crate::types::{ActionResult, DEFAULT_TURN_LIMIT, ModelTurn};

/// Creates the browser session. Invoked on the worker thread, which then
/// owns the session until teardown.
pub type BrowserLauncher =
    Arc<dyn Fn() -> Result<Box<dyn Browser>, BrowserError> + Send + Sync>;

pub const SAFETY_TERMINATION_NOTICE: &str = "Agent loop terminated by user safety decision.";

#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Model turns per inner cycle before yielding to the outer loop.
    pub turn_limit: usize,
    /// Page opened before the conversation is seeded.
    pub start_url: Option<String>,
    /// Fixed pause after each action batch, before the state capture.
    pub settle_delay: Duration,
    /// Upper bound for the per-action `wait_for_settle`.
    pub action_settle_timeout: Duration,
    /// Re-check interval of the idle wait.
    pub idle_poll: Duration,
    pub outer_pause: Duration,
    pub error_pause: Duration,
    pub join_timeout: Duration,
    pub dispatcher: Dispatcher,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            turn_limit: DEFAULT_TURN_LIMIT,
            start_url: Some("https://www.google.com/".into()),
            settle_delay: Duration::from_secs(1),
            action_settle_timeout: Duration::from_secs(5),
            idle_poll: Duration::from_secs(1),
            outer_pause: Duration::from_millis(500),
            error_pause: Duration::from_secs(1),
            join_timeout: Duration::from_secs(5),
            dispatcher: Dispatcher::default(),
        }
    }
}

struct Session {
    shutdown: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<String>,
    done: std_mpsc::Receiver<()>,
    handle: JoinHandle<()>,
}

pub struct Agent {
    shared: Arc<Shared>,
    model: Arc<dyn ModelClient>,
    safety: Arc<dyn SafetyPolicy>,
    launcher: BrowserLauncher,
    settings: AgentSettings,
    session: Mutex<Option<Session>>,
}

impl Agent {
    pub fn new(
        model: Arc<dyn ModelClient>,
        launcher: BrowserLauncher,
        settings: AgentSettings,
    ) -> Self {
        Self {
            shared: Shared::new(EventBus::default()),
            model,
            safety: Arc::new(AutoAcknowledge),
            launcher,
            settings,
            session: Mutex::new(None),
        }
    }

    pub fn with_safety_policy(mut self, policy: Arc<dyn SafetyPolicy>) -> Self {
        self.safety = policy;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn status(&self) -> Arc<StatusSnapshot> {
        self.shared.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.shared.read(|s| s.running)
    }

    /// Launch a worker for `goal`. Fails if a session is already running, or
    /// if the worker of a stopped session still holds the browser.
    pub fn start(&self, goal: Option<&str>) -> Result<(), AgentError> {
        let mut session = self.session.lock();
        if self.is_running() {
            return Err(AgentError::AlreadyRunning);
        }
        if let Some(previous) = session.take() {
            match previous.done.recv_timeout(self.settings.join_timeout) {
                Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                    if previous.handle.join().is_err() {
                        error!("agent worker panicked");
                    }
                }
                Err(std_mpsc::RecvTimeoutError::Timeout) => {
                    warn!("previous agent worker is still shutting down");
                    *session = Some(previous);
                    return Err(AgentError::ShuttingDown);
                }
            }
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = std_mpsc::channel();

        let epoch = self.shared.mutate(|s| {
            match goal {
                Some(goal) => s.replace_goal(goal),
                None => s.retire_goal(None),
            }
            s.running = true;
            s.idle = false;
            s.thread_alive = true;
            s.pending_goal = None;
            s.last_results.clear();
            s.session += 1;
            (s.session, true)
        });

        let worker = Worker {
            shared: self.shared.clone(),
            model: self.model.clone(),
            safety: self.safety.clone(),
            settings: self.settings.clone(),
            shutdown: shutdown.clone(),
            commands: command_rx,
            conversation: Conversation::default(),
            steps: 0,
        };
        let launcher = self.launcher.clone();
        let exit = ExitGuard {
            shared: self.shared.clone(),
            session: epoch,
            done: done_tx,
        };

        let spawned = thread::Builder::new()
            .name("agent-worker".into())
            .spawn(move || {
                let _exit = exit;
                worker.run(launcher);
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                // The closure, and with it the exit guard, was dropped.
                return Err(AgentError::Spawn(e));
            }
        };

        info!(goal = goal.unwrap_or_default(), "agent started");
        *session = Some(Session {
            shutdown,
            commands: command_tx,
            done: done_rx,
            handle,
        });
        Ok(())
    }

    /// Signal shutdown and wait a bounded time for the worker to finish.
    /// Returns whether a session was running.
    ///
    /// A worker that misses the deadline stays registered, and [`Agent::start`]
    /// refuses to launch another one until it has exited.
    pub fn stop(&self) -> bool {
        let mut slot = self.session.lock();
        let was_running = self.is_running();
        let Some(session) = slot.take() else {
            return was_running;
        };

        session.shutdown.store(true, Ordering::SeqCst);
        self.shared.wake();
        match session.done.recv_timeout(self.settings.join_timeout) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                if session.handle.join().is_err() {
                    error!("agent worker panicked");
                }
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                // The worker still tears the browser down once it observes the flag.
                warn!(
                    timeout_ms = self.settings.join_timeout.as_millis() as u64,
                    "agent worker did not stop in time, detaching"
                );
                *slot = Some(session);
            }
        }
        self.shared.update(|s| {
            s.running = false;
            s.idle = false;
        });
        info!("agent stopped");
        was_running
    }

    /// Replace the goal of the running session. The worker resets the
    /// conversation at its next turn boundary.
    pub fn update_goal(&self, goal: &str) -> Result<(), AgentError> {
        let _session = self.session.lock();
        let accepted = self.shared.mutate(|s| {
            if !s.running {
                return (false, false);
            }
            s.replace_goal(goal);
            s.pending_goal = Some(goal.to_string());
            s.idle = false;
            (true, true)
        });
        if !accepted {
            return Err(AgentError::NotRunning);
        }
        info!(%goal, "goal updated");
        self.shared.wake();
        Ok(())
    }

    /// Queue an operator command for delivery after the current turn.
    pub fn enqueue_command(&self, command: &str) -> Result<(), AgentError> {
        let session = self.session.lock();
        let Some(session) = session.as_ref().filter(|_| self.is_running()) else {
            return Err(AgentError::NotRunning);
        };
        session
            .commands
            .send(command.to_string())
            .map_err(|_| AgentError::NotRunning)?;
        debug!(%command, "command queued");
        self.shared.update(|_| {});
        Ok(())
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if self.session.lock().is_some() {
            self.stop();
        }
    }
}

/// Marks the session finished however the worker exits.
struct ExitGuard {
    shared: Arc<Shared>,
    session: u64,
    done: std_mpsc::Sender<()>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let current = self.shared.mutate(|s| {
            if s.session != self.session {
                return (false, false);
            }
            s.running = false;
            s.idle = false;
            s.thread_alive = false;
            (true, true)
        });
        if current {
            self.shared.events.emit(AgentEvent::Stopped);
        } else {
            debug!(session = self.session, "stale worker exited");
        }
        let _ = self.done.send(());
    }
}

/// How an action batch ended.
enum Batch {
    Completed(Vec<(String, ActionResult)>),
    Declined(Vec<(String, ActionResult)>),
}

struct Worker {
    shared: Arc<Shared>,
    model: Arc<dyn ModelClient>,
    safety: Arc<dyn SafetyPolicy>,
    settings: AgentSettings,
    shutdown: Arc<AtomicBool>,
    commands: mpsc::UnboundedReceiver<String>,
    conversation: Conversation,
    steps: usize,
}

impl Worker {
    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn run(mut self, launcher: BrowserLauncher) {
        let mut browser = match launcher() {
            Ok(browser) => browser,
            Err(e) => {
                error!(error = %e, "could not start browser");
                self.shared.publish_update(&format!("Failed to start browser: {e}"));
                return;
            }
        };

        if let Some(url) = self.settings.start_url.clone() {
            if let Err(e) = browser.navigate(&url) {
                warn!(%url, error = %e, "failed to open start page");
            }
        }

        let goal = self.shared.read(|s| s.current_goal.clone()).unwrap_or_default();
        let (screenshot, url) = capture(browser.as_mut());
        self.conversation = Conversation::seeded(&goal, Some(screenshot));
        self.record(Some(url));

        while !self.stopping() {
            self.cycle(browser.as_mut());
            if self.stopping() {
                break;
            }
            thread::sleep(self.settings.outer_pause);
        }

        info!("tearing down browser");
        browser.close();
    }

    fn record(&self, url: Option<String>) {
        self.shared.update(|s| {
            s.record_conversation(&self.conversation);
            if url.is_some() {
                s.current_url = url;
            }
        });
    }

    /// One inner cycle of at most `turn_limit` model turns.
    fn cycle(&mut self, browser: &mut dyn Browser) {
        for turn in 1..=self.settings.turn_limit {
            if self.stopping() {
                return;
            }
            self.apply_pending_goal(browser);

            debug!(turn, "thinking");
            self.shared.events.emit(AgentEvent::Thinking { turn });
            let reply = self.model.generate(&self.conversation);
            if self.stopping() {
                return;
            }
            if self.shared.read(|s| s.pending_goal.is_some()) {
                debug!(turn, "goal replaced during model call, discarding reply");
                continue;
            }

            let model_turn = match reply {
                Ok(model_turn) => model_turn,
                Err(e) => {
                    error!(turn, kind = e.kind(), error = %e, "model call failed");
                    self.shared
                        .publish_update(&format!("Error generating content: {e}"));
                    thread::sleep(self.settings.error_pause);
                    continue;
                }
            };

            self.conversation.push(Turn::Model(model_turn.clone()));
            self.record(None);

            if !model_turn.has_action_calls() {
                let text = model_turn.joined_text();
                info!(turn, %text, "goal finished");
                self.shared.publish_update(&text);
                self.shared
                    .events
                    .emit(AgentEvent::TaskComplete { summary: text });
                self.idle_wait();
                continue;
            }

            match self.execute(&model_turn, browser) {
                Ok(batch) => {
                    let declined = matches!(batch, Batch::Declined(_));
                    self.finish_batch(batch, browser);
                    if declined {
                        return;
                    }
                }
                Err(e) => {
                    error!(turn, error = %e, "aborting turn");
                    self.conversation.pop_model_turn();
                    self.conversation.push_command(&rejection_notice(&e));
                    self.record(None);
                    self.shared.publish_update(&e.to_string());
                    return;
                }
            }
        }
        debug!(limit = self.settings.turn_limit, "turn limit reached");
    }

    fn apply_pending_goal(&mut self, browser: &mut dyn Browser) {
        let Some(goal) = self.shared.mutate(|s| (s.pending_goal.take(), false)) else {
            return;
        };
        let (screenshot, url) = capture(browser);
        self.conversation.reset(&goal, Some(screenshot));
        self.record(Some(url));
        self.shared.events.emit(AgentEvent::GoalUpdated { goal });
    }

    /// Block until a new goal arrives or shutdown is requested.
    fn idle_wait(&mut self) {
        self.shared.update(|s| s.idle = true);
        {
            let mut state = self.shared.lock();
            while !self.stopping() && state.pending_goal.is_none() {
                self.shared.wait(&mut state, self.settings.idle_poll);
            }
        }
        self.shared.update(|s| s.idle = false);
    }

    /// Run every call of the turn in order.
    ///
    /// An unknown action name anywhere in the turn rejects the whole turn
    /// before anything runs.
    fn execute(
        &mut self,
        model_turn: &ModelTurn,
        browser: &mut dyn Browser,
    ) -> Result<Batch, DispatchError> {
        for call in model_turn.action_calls() {
            if let Err(ParseError::Unknown(name)) = Action::parse(&call.name, &call.args) {
                return Err(DispatchError::UnknownAction(name));
            }
        }

        let mut results = Vec::new();
        let mut declined = false;
        for call in model_turn.action_calls() {
            if declined {
                results.push((
                    call.name.clone(),
                    ActionResult::error("not executed: an earlier action was declined"),
                ));
                continue;
            }

            let mut acknowledged = false;
            if let Some(decision) = safety_decision(call) {
                match self.safety.confirm(call, decision) {
                    SafetyVerdict::Continue => acknowledged = true,
                    SafetyVerdict::Terminate => {
                        declined = true;
                        results.push((
                            call.name.clone(),
                            ActionResult::error("declined by safety policy"),
                        ));
                        continue;
                    }
                }
            }

            self.steps += 1;
            self.shared.events.emit(AgentEvent::Step {
                number: self.steps,
                description: format!("{} {}", call.name, Value::Object(call.args.clone())),
            });

            let mut result = self.settings.dispatcher.dispatch(call, browser)?;
            if acknowledged {
                result.insert("safety_acknowledgement", Value::Bool(true));
            }
            if let Some(message) = result.error_message() {
                self.shared.events.emit(AgentEvent::StepError {
                    action: call.name.clone(),
                    message: message.to_string(),
                });
            }
            if let Err(e) = browser.wait_for_settle(self.settings.action_settle_timeout) {
                debug!(action = %call.name, error = %e, "page did not settle");
            }
            results.push((call.name.clone(), result));
        }

        Ok(if declined {
            Batch::Declined(results)
        } else {
            Batch::Completed(results)
        })
    }

    fn finish_batch(&mut self, batch: Batch, browser: &mut dyn Browser) {
        let (results, declined) = match batch {
            Batch::Completed(results) => (results, false),
            Batch::Declined(results) => (results, true),
        };

        self.shared.update(|s| s.last_results = results.clone());
        if let Some((name, message)) = results
            .iter()
            .find_map(|(name, r)| r.error_message().map(|m| (name, m)))
        {
            let message = format!("Error executing {name}: {message}");
            warn!("{message}");
            self.shared.publish_update(&message);
        }
        if declined {
            warn!("{SAFETY_TERMINATION_NOTICE}");
            self.shared.publish_update(SAFETY_TERMINATION_NOTICE);
        }

        thread::sleep(self.settings.settle_delay);
        let (screenshot, url) = capture(browser);
        self.conversation.push(Turn::ActionResults {
            results,
            url: url.clone(),
            screenshot,
        });

        while let Ok(command) = self.commands.try_recv() {
            info!(%command, "delivering queued command");
            self.conversation.push_command(&command);
        }
        self.record(Some(url));
    }
}

/// Told to the model in place of a turn that could not be executed.
fn rejection_notice(err: &DispatchError) -> String {
    format!("{err}. Choose a supported action instead.")
}

/// Screenshot and URL of the current page. Failures degrade to empty values.
fn capture(browser: &mut dyn Browser) -> (Vec<u8>, String) {
    let screenshot = browser.screenshot().unwrap_or_else(|e| {
        warn!(error = %e, "failed to capture screenshot");
        Vec::new()
    });
    let url = browser.current_url().unwrap_or_else(|e| {
        warn!(error = %e, "failed to read current url");
        String::new()
    });
    (screenshot, url)
}
