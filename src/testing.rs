//! Deterministic stand-ins for the browser and the model service.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::brain::ModelClient;
use crate::conversation::Conversation;
use crate::coords::Viewport;
use crate::error::{BrowserError, ModelError};
use crate::hands::Browser;
use crate::types::ModelTurn;

/// One recorded browser operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Navigate(String),
    Click(u32, u32),
    Move(u32, u32),
    Down(u32, u32),
    Up(u32, u32),
    Type(String),
    Key(String),
    SelectAll,
    ScrollStart,
    ScrollEnd,
    ScrollBy(i64, i64),
    Back,
    Forward,
    Screenshot,
    CurrentUrl,
    Settle,
    Close,
}

impl Op {
    fn name(&self) -> &'static str {
        match self {
            Op::Navigate(_) => "navigate",
            Op::Click(..) => "click",
            Op::Move(..) => "move",
            Op::Down(..) => "mouse_down",
            Op::Up(..) => "mouse_up",
            Op::Type(_) => "type",
            Op::Key(_) => "key",
            Op::SelectAll => "select_all",
            Op::ScrollStart | Op::ScrollEnd | Op::ScrollBy(..) => "scroll",
            Op::Back => "go_back",
            Op::Forward => "go_forward",
            Op::Screenshot => "screenshot",
            Op::CurrentUrl => "current_url",
            Op::Settle => "settle",
            Op::Close => "close",
        }
    }
}

/// Shared view of what a [`FakeBrowser`] was asked to do.
#[derive(Clone, Default)]
pub struct OpLog(Arc<Mutex<Vec<Op>>>);

impl OpLog {
    pub fn ops(&self) -> Vec<Op> {
        self.0.lock().clone()
    }

    /// Operations other than the agent's own state capture.
    pub fn actions(&self) -> Vec<Op> {
        self.ops()
            .into_iter()
            .filter(|op| !matches!(op, Op::Screenshot | Op::CurrentUrl | Op::Settle))
            .collect()
    }
}

pub struct FakeBrowser {
    viewport: Viewport,
    url: String,
    log: OpLog,
    failing_ops: HashSet<&'static str>,
    failing_keys: HashSet<String>,
}

impl FakeBrowser {
    pub fn new(viewport: Viewport) -> Self {
        Self {
            viewport,
            url: "about:blank".into(),
            log: OpLog::default(),
            failing_ops: HashSet::new(),
            failing_keys: HashSet::new(),
        }
    }

    pub fn log(&self) -> OpLog {
        self.log.clone()
    }

    pub fn failing(mut self, op: &'static str) -> Self {
        self.failing_ops.insert(op);
        self
    }

    pub fn failing_key(mut self, key: &str) -> Self {
        self.failing_keys.insert(key.to_string());
        self
    }

    fn record(&mut self, op: Op) -> Result<(), BrowserError> {
        let name = op.name();
        let key_fails = matches!(&op, Op::Key(k) if self.failing_keys.contains(k));
        self.log.0.lock().push(op);
        if self.failing_ops.contains(name) || key_fails {
            return Err(BrowserError::op(name, "injected failure"));
        }
        Ok(())
    }
}

impl Browser for FakeBrowser {
    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        self.record(Op::Navigate(url.to_string()))?;
        self.url = url.to_string();
        Ok(())
    }

    fn click(&mut self, x: u32, y: u32) -> Result<(), BrowserError> {
        self.record(Op::Click(x, y))
    }

    fn move_to(&mut self, x: u32, y: u32) -> Result<(), BrowserError> {
        self.record(Op::Move(x, y))
    }

    fn mouse_down(&mut self, x: u32, y: u32) -> Result<(), BrowserError> {
        self.record(Op::Down(x, y))
    }

    fn mouse_up(&mut self, x: u32, y: u32) -> Result<(), BrowserError> {
        self.record(Op::Up(x, y))
    }

    fn type_text(&mut self, text: &str) -> Result<(), BrowserError> {
        self.record(Op::Type(text.to_string()))
    }

    fn key(&mut self, name: &str) -> Result<(), BrowserError> {
        self.record(Op::Key(name.to_string()))
    }

    fn select_all(&mut self) -> Result<(), BrowserError> {
        self.record(Op::SelectAll)
    }

    fn scroll_to_start(&mut self) -> Result<(), BrowserError> {
        self.record(Op::ScrollStart)
    }

    fn scroll_to_end(&mut self) -> Result<(), BrowserError> {
        self.record(Op::ScrollEnd)
    }

    fn scroll_by(&mut self, dx: i64, dy: i64) -> Result<(), BrowserError> {
        self.record(Op::ScrollBy(dx, dy))
    }

    fn history_back(&mut self) -> Result<(), BrowserError> {
        self.record(Op::Back)
    }

    fn history_forward(&mut self) -> Result<(), BrowserError> {
        self.record(Op::Forward)
    }

    fn screenshot(&mut self) -> Result<Vec<u8>, BrowserError> {
        self.record(Op::Screenshot)?;
        Ok(b"\x89PNG-fake".to_vec())
    }

    fn current_url(&mut self) -> Result<String, BrowserError> {
        self.record(Op::CurrentUrl)?;
        Ok(self.url.clone())
    }

    fn wait_for_settle(&mut self, _timeout: Duration) -> Result<(), BrowserError> {
        self.record(Op::Settle)
    }

    fn close(&mut self) {
        let _ = self.record(Op::Close);
    }
}

/// Holds model calls in flight until opened.
#[derive(Clone, Default)]
pub struct Gate(Arc<(Mutex<bool>, Condvar)>);

impl Gate {
    pub fn open(&self) {
        *self.0.0.lock() = true;
        self.0.1.notify_all();
    }

    fn pass(&self) {
        let mut open = self.0.0.lock();
        while !*open {
            self.0.1.wait(&mut open);
        }
    }
}

/// Returns pre-programmed replies in order and records every conversation.
///
/// Once the script runs out it answers with a finishing text so the agent
/// goes idle instead of spinning.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<ModelTurn, ModelError>>>,
    seen: Mutex<Vec<Conversation>>,
    gate: Mutex<Option<Gate>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<ModelTurn, ModelError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
        }
    }

    /// Make every following call block until the returned gate opens.
    pub fn gated(&self) -> Gate {
        let gate = Gate::default();
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn push(&self, reply: Result<ModelTurn, ModelError>) {
        self.replies.lock().push_back(reply);
    }

    pub fn seen(&self) -> Vec<Conversation> {
        self.seen.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.seen.lock().len()
    }
}

impl ModelClient for ScriptedModel {
    fn generate(&self, conversation: &Conversation) -> Result<ModelTurn, ModelError> {
        self.seen.lock().push(conversation.clone());
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.pass();
        }
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(ModelTurn::text("Nothing left to do.")))
    }
}
