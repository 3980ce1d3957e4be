//! Typed browser actions and their dispatch.
//!
//! [`Action::parse`] is the only place untyped model arguments are inspected.
//! Malformed arguments become `{error: ...}` results the model can read and
//! recover from; an action name outside the supported set is the single fatal
//! outcome, because silently skipping it would leave the model believing it
//! had acted.

use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::coords::coordinate;
use crate::error::{BrowserError, DispatchError};
use crate::hands::Browser;
use crate::types::{ActionCall, ActionResult};

const DEFAULT_SCROLL_MAGNITUDE: f64 = 800.0;
const DEFAULT_DRAG_STEPS: u32 = 10;
const MAX_DRAG_STEPS: u32 = 1000;

/// A point on the model's 0-1000 scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormPoint {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            _ => None,
        }
    }

    fn is_vertical(self) -> bool {
        matches!(self, Self::Up | Self::Down)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentEdge {
    Top,
    Bottom,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeText {
    pub at: NormPoint,
    pub text: String,
    pub press_enter: bool,
    pub clear_before_typing: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScrollAt {
    pub at: NormPoint,
    pub direction: ScrollDirection,
    pub magnitude: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DragAndDrop {
    pub from: NormPoint,
    pub to: NormPoint,
    pub steps: u32,
}

/// Every action the agent knows how to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    OpenWebBrowser,
    ClickAt(NormPoint),
    HoverAt(NormPoint),
    TypeTextAt(TypeText),
    ScrollDocument(DocumentEdge),
    ScrollAt(ScrollAt),
    Wait5Seconds,
    GoBack,
    GoForward,
    Search,
    Navigate { url: String },
    KeyCombination { keys: Vec<String> },
    DragAndDrop(DragAndDrop),
}

/// Why an action call could not be turned into an [`Action`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Unknown(String),
    Invalid(String),
}

impl Action {
    pub fn parse(name: &str, args: &Map<String, Value>) -> Result<Self, ParseError> {
        let action = match name {
            "open_web_browser" => Self::OpenWebBrowser,
            "click_at" => Self::ClickAt(point(args, "x", "y", "click")?),
            "hover_at" => Self::HoverAt(point(args, "x", "y", "hover")?),
            "type_text_at" => Self::TypeTextAt(TypeText {
                at: point(args, "x", "y", "type")?,
                text: text_arg(args.get("text"))
                    .ok_or_else(|| ParseError::Invalid("missing text".into()))?,
                press_enter: flag(args.get("press_enter"), false),
                clear_before_typing: flag(args.get("clear_before_typing"), true),
            }),
            "scroll_document" => {
                let direction = args.get("direction").and_then(Value::as_str).unwrap_or("down");
                if direction.trim().eq_ignore_ascii_case("top") {
                    Self::ScrollDocument(DocumentEdge::Top)
                } else {
                    Self::ScrollDocument(DocumentEdge::Bottom)
                }
            }
            "scroll_at" => {
                let at = point(args, "x", "y", "scroll")?;
                let raw = match args.get("direction") {
                    None | Some(Value::Null) => {
                        return Err(ParseError::Invalid("missing scroll direction".into()));
                    }
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                };
                let direction = ScrollDirection::parse(&raw).ok_or_else(|| {
                    ParseError::Invalid(format!("unknown scroll direction: {raw}"))
                })?;
                let magnitude = args
                    .get("magnitude")
                    .map(coordinate)
                    .unwrap_or(DEFAULT_SCROLL_MAGNITUDE);
                Self::ScrollAt(ScrollAt {
                    at,
                    direction,
                    magnitude,
                })
            }
            "wait_5_seconds" => Self::Wait5Seconds,
            "go_back" => Self::GoBack,
            "go_forward" => Self::GoForward,
            "search" => Self::Search,
            "navigate" => {
                let url = text_arg(args.get("url"))
                    .filter(|u| !u.trim().is_empty())
                    .ok_or_else(|| ParseError::Invalid("missing url".into()))?;
                Self::Navigate { url }
            }
            "key_combination" => {
                let raw = text_arg(args.get("keys"))
                    .filter(|k| !k.is_empty())
                    .ok_or_else(|| ParseError::Invalid("missing keys".into()))?;
                let keys = raw
                    .split('+')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(String::from)
                    .collect();
                Self::KeyCombination { keys }
            }
            "drag_and_drop" => {
                let from = point(args, "x", "y", "drag")?;
                let to = point(args, "destination_x", "destination_y", "drag")?;
                let steps = args
                    .get("steps")
                    .map(|v| coordinate(v) as u32)
                    .unwrap_or(DEFAULT_DRAG_STEPS)
                    .clamp(1, MAX_DRAG_STEPS);
                Self::DragAndDrop(DragAndDrop { from, to, steps })
            }
            other => return Err(ParseError::Unknown(other.to_string())),
        };
        Ok(action)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenWebBrowser => "open_web_browser",
            Self::ClickAt(_) => "click_at",
            Self::HoverAt(_) => "hover_at",
            Self::TypeTextAt(_) => "type_text_at",
            Self::ScrollDocument(_) => "scroll_document",
            Self::ScrollAt(_) => "scroll_at",
            Self::Wait5Seconds => "wait_5_seconds",
            Self::GoBack => "go_back",
            Self::GoForward => "go_forward",
            Self::Search => "search",
            Self::Navigate { .. } => "navigate",
            Self::KeyCombination { .. } => "key_combination",
            Self::DragAndDrop(_) => "drag_and_drop",
        }
    }
}

fn point(
    args: &Map<String, Value>,
    x_key: &str,
    y_key: &str,
    what: &str,
) -> Result<NormPoint, ParseError> {
    match (args.get(x_key), args.get(y_key)) {
        (Some(x), Some(y)) => Ok(NormPoint {
            x: coordinate(x),
            y: coordinate(y),
        }),
        _ => Err(ParseError::Invalid(format!("invalid {what} coordinates"))),
    }
}

fn text_arg(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn flag(value: Option<&Value>, default: bool) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => default,
        },
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        _ => default,
    }
}

/// Executes action calls against a [`Browser`].
#[derive(Debug, Clone)]
pub struct Dispatcher {
    /// Duration of `wait_5_seconds`.
    pub wait: Duration,
    /// Pause between intermediate pointer moves of a drag.
    pub drag_pause: Duration,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(5),
            drag_pause: Duration::from_millis(20),
        }
    }
}

impl Dispatcher {
    /// Parse and run one call.
    ///
    /// Only an unknown action name is an `Err`; argument problems and browser
    /// failures are reported inside the returned result.
    pub fn dispatch(
        &self,
        call: &ActionCall,
        browser: &mut dyn Browser,
    ) -> Result<ActionResult, DispatchError> {
        let action = match Action::parse(&call.name, &call.args) {
            Ok(action) => action,
            Err(ParseError::Invalid(message)) => {
                debug!(action = %call.name, %message, "rejected action arguments");
                return Ok(ActionResult::error(message));
            }
            Err(ParseError::Unknown(name)) => return Err(DispatchError::UnknownAction(name)),
        };
        debug!(action = action.name(), "dispatching");
        Ok(match self.execute(&action, browser) {
            Ok(result) => result,
            Err(e) => {
                warn!(action = action.name(), error = %e, "action failed");
                ActionResult::error(e.to_string())
            }
        })
    }

    pub fn execute(
        &self,
        action: &Action,
        browser: &mut dyn Browser,
    ) -> Result<ActionResult, BrowserError> {
        let viewport = browser.viewport();
        let result = match action {
            Action::OpenWebBrowser => json!({"status": "already_open"}),
            Action::ClickAt(at) => {
                let (x, y) = viewport.point(at.x, at.y);
                browser.click(x, y)?;
                json!({"clicked": [x, y]})
            }
            Action::HoverAt(at) => {
                let (x, y) = viewport.point(at.x, at.y);
                browser.move_to(x, y)?;
                json!({"hovered": [x, y]})
            }
            Action::TypeTextAt(args) => {
                let (x, y) = viewport.point(args.at.x, args.at.y);
                browser.click(x, y)?;
                if args.clear_before_typing {
                    if let Err(e) = browser.select_all().and_then(|_| browser.key("Backspace")) {
                        debug!(error = %e, "could not clear field before typing");
                    }
                }
                browser.type_text(&args.text)?;
                if args.press_enter {
                    if let Err(e) = browser.key("Enter") {
                        debug!(error = %e, "could not press Enter after typing");
                    }
                }
                json!({"typed": args.text})
            }
            Action::ScrollDocument(DocumentEdge::Top) => {
                browser.scroll_to_start()?;
                json!({"scrolled_to": "top"})
            }
            Action::ScrollDocument(DocumentEdge::Bottom) => {
                browser.scroll_to_end()?;
                json!({"scrolled_to": "bottom"})
            }
            Action::ScrollAt(args) => {
                let (x, y) = viewport.point(args.at.x, args.at.y);
                let amount = if args.direction.is_vertical() {
                    i64::from(viewport.y(args.magnitude))
                } else {
                    i64::from(viewport.x(args.magnitude))
                };
                let (dx, dy) = match args.direction {
                    ScrollDirection::Up => (0, -amount),
                    ScrollDirection::Down => (0, amount),
                    ScrollDirection::Left => (-amount, 0),
                    ScrollDirection::Right => (amount, 0),
                };
                browser.move_to(x, y)?;
                browser.scroll_by(dx, dy)?;
                json!({"scrolled_by": [dx, dy]})
            }
            Action::Wait5Seconds => {
                std::thread::sleep(self.wait);
                json!({"waited_seconds": self.wait.as_secs()})
            }
            Action::GoBack => {
                browser.history_back()?;
                json!({"navigated": "back"})
            }
            Action::GoForward => {
                browser.history_forward()?;
                json!({"navigated": "forward"})
            }
            Action::Search => json!({"search": null}),
            Action::Navigate { url } => {
                browser.navigate(url)?;
                json!({"navigated_to": url})
            }
            Action::KeyCombination { keys } => {
                let mut pressed = Vec::with_capacity(keys.len());
                for key in keys {
                    match browser.key(key) {
                        Ok(()) => pressed.push(key.clone()),
                        Err(e) => debug!(%key, error = %e, "ignoring key failure"),
                    }
                }
                json!({"pressed_keys": pressed})
            }
            Action::DragAndDrop(args) => {
                let (sx, sy) = viewport.point(args.from.x, args.from.y);
                let (dx, dy) = viewport.point(args.to.x, args.to.y);
                browser.move_to(sx, sy)?;
                browser.mouse_down(sx, sy)?;
                if let Err(e) = self.drag_path(browser, (sx, sy), (dx, dy), args.steps) {
                    let _ = browser.mouse_up(dx, dy);
                    return Err(e);
                }
                browser.mouse_up(dx, dy)?;
                json!({"dragged": [[sx, sy], [dx, dy]]})
            }
        };
        Ok(ActionResult::from(result))
    }

    fn drag_path(
        &self,
        browser: &mut dyn Browser,
        (sx, sy): (u32, u32),
        (dx, dy): (u32, u32),
        steps: u32,
    ) -> Result<(), BrowserError> {
        let steps = i64::from(steps.max(1));
        let (sx, sy, dx, dy) = (i64::from(sx), i64::from(sy), i64::from(dx), i64::from(dy));
        for i in 1..=steps {
            let nx = sx + (dx - sx) * i / steps;
            let ny = sy + (dy - sy) * i / steps;
            browser.move_to(nx as u32, ny as u32)?;
            if !self.drag_pause.is_zero() {
                std::thread::sleep(self.drag_pause);
            }
        }
        Ok(())
    }
}
