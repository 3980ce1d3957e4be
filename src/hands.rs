//! The browser capability and its headless_chrome implementation.

use std::borrow::Cow;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use headless_chrome::protocol::cdp::Input;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser as Chrome, LaunchOptions, Tab};
use tracing::{debug, info, warn};

use crate::coords::Viewport;
use crate::error::BrowserError;

/// Everything the agent needs from a live browser session.
///
/// Implementations are owned by the agent worker thread for their whole
/// lifetime and are never called concurrently. Pixel coordinates are already
/// clamped to [`Browser::viewport`].
pub trait Browser {
    fn viewport(&self) -> Viewport;

    fn navigate(&mut self, url: &str) -> Result<(), BrowserError>;
    fn click(&mut self, x: u32, y: u32) -> Result<(), BrowserError>;
    fn move_to(&mut self, x: u32, y: u32) -> Result<(), BrowserError>;
    fn mouse_down(&mut self, x: u32, y: u32) -> Result<(), BrowserError>;
    fn mouse_up(&mut self, x: u32, y: u32) -> Result<(), BrowserError>;
    fn type_text(&mut self, text: &str) -> Result<(), BrowserError>;
    fn key(&mut self, name: &str) -> Result<(), BrowserError>;
    /// Select the content of the focused field.
    fn select_all(&mut self) -> Result<(), BrowserError>;
    fn scroll_to_start(&mut self) -> Result<(), BrowserError>;
    fn scroll_to_end(&mut self) -> Result<(), BrowserError>;
    fn scroll_by(&mut self, dx: i64, dy: i64) -> Result<(), BrowserError>;
    fn history_back(&mut self) -> Result<(), BrowserError>;
    fn history_forward(&mut self) -> Result<(), BrowserError>;
    /// PNG bytes of the current viewport.
    fn screenshot(&mut self) -> Result<Vec<u8>, BrowserError>;
    fn current_url(&mut self) -> Result<String, BrowserError>;
    fn wait_for_settle(&mut self, timeout: Duration) -> Result<(), BrowserError>;

    /// Best-effort teardown. Must not panic; each step is independent.
    fn close(&mut self) {}
}

/// How to obtain a Chrome instance.
#[derive(Debug, Clone, Default)]
pub struct ChromeOptions {
    pub headless: bool,
    pub viewport: Viewport,
    pub chrome_path: Option<PathBuf>,
    pub profile_dir: Option<PathBuf>,
    /// DevTools websocket URL of an already running Chrome.
    pub attach_ws: Option<String>,
}

/// A single Chrome tab driven over the DevTools protocol.
pub struct ChromeBrowser {
    browser: Option<Chrome>,
    tab: Option<Arc<Tab>>,
    viewport: Viewport,
}

impl ChromeBrowser {
    pub fn launch(options: &ChromeOptions) -> Result<Self, BrowserError> {
        if let Some(ws) = &options.attach_ws {
            info!(url = %ws, "attaching to existing Chrome");
            match Self::attach(ws, options.viewport) {
                Ok(session) => return Ok(session),
                Err(e) => warn!(error = %e, "could not attach, launching a new Chrome"),
            }
        }

        if let Some(dir) = &options.profile_dir {
            std::fs::create_dir_all(dir)
                .map_err(|e| BrowserError::Launch(format!("profile dir {}: {e}", dir.display())))?;
        }

        let launch = LaunchOptions {
            headless: options.headless,
            path: options.chrome_path.clone(),
            user_data_dir: options.profile_dir.clone(),
            window_size: Some((options.viewport.width, options.viewport.height)),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
                OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: Duration::from_secs(600),
            ..Default::default()
        };

        info!(headless = options.headless, "starting Chrome");
        let browser = Chrome::new(launch).map_err(|e| BrowserError::Launch(e.to_string()))?;
        let tab = browser
            .new_tab()
            .map_err(|e| BrowserError::Launch(format!("new tab: {e}")))?;
        info!("Chrome ready");

        Ok(Self {
            browser: Some(browser),
            tab: Some(tab),
            viewport: options.viewport,
        })
    }

    fn attach(ws: &str, viewport: Viewport) -> Result<Self, BrowserError> {
        let browser =
            Chrome::connect(ws.to_string()).map_err(|e| BrowserError::Launch(e.to_string()))?;
        let existing = {
            let tabs = browser
                .get_tabs()
                .lock()
                .map_err(|_| BrowserError::Launch("tab list lock poisoned".into()))?;
            tabs.first().cloned()
        };
        let tab = match existing {
            Some(tab) => {
                debug!("using existing tab");
                tab
            }
            None => browser
                .new_tab()
                .map_err(|e| BrowserError::Launch(format!("new tab: {e}")))?,
        };
        Ok(Self {
            browser: Some(browser),
            tab: Some(tab),
            viewport,
        })
    }

    fn tab(&self) -> Result<&Arc<Tab>, BrowserError> {
        self.tab
            .as_ref()
            .ok_or_else(|| BrowserError::op("tab", "browser already closed"))
    }

    fn evaluate(&self, op: &'static str, js: &str) -> Result<(), BrowserError> {
        self.tab()?
            .evaluate(js, false)
            .map(|_| ())
            .map_err(|e| BrowserError::op(op, e))
    }

    fn mouse(
        &self,
        op: &'static str,
        kind: Input::DispatchMouseEventTypeOption,
        x: u32,
        y: u32,
        button: Option<Input::MouseButton>,
    ) -> Result<(), BrowserError> {
        let click_count = button.as_ref().map(|_| 1);
        self.tab()?
            .call_method(Input::DispatchMouseEvent {
                Type: kind,
                x: f64::from(x),
                y: f64::from(y),
                modifiers: None,
                timestamp: None,
                button,
                buttons: None,
                click_count,
                force: None,
                tangential_pressure: None,
                tilt_x: None,
                tilt_y: None,
                twist: None,
                delta_x: None,
                delta_y: None,
                pointer_Type: None,
            })
            .map(|_| ())
            .map_err(|e| BrowserError::op(op, e))
    }
}

impl Browser for ChromeBrowser {
    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        let target = with_scheme(url);
        let tab = self.tab()?;
        tab.navigate_to(&target)
            .map_err(|e| BrowserError::op("navigate", e))?;
        tab.wait_until_navigated()
            .map_err(|e| BrowserError::op("navigate", e))?;
        Ok(())
    }

    fn click(&mut self, x: u32, y: u32) -> Result<(), BrowserError> {
        use Input::DispatchMouseEventTypeOption::{MouseMoved, MousePressed, MouseReleased};
        self.mouse("click", MouseMoved, x, y, None)?;
        self.mouse("click", MousePressed, x, y, Some(Input::MouseButton::Left))?;
        self.mouse("click", MouseReleased, x, y, Some(Input::MouseButton::Left))
    }

    fn move_to(&mut self, x: u32, y: u32) -> Result<(), BrowserError> {
        self.mouse(
            "move",
            Input::DispatchMouseEventTypeOption::MouseMoved,
            x,
            y,
            None,
        )
    }

    fn mouse_down(&mut self, x: u32, y: u32) -> Result<(), BrowserError> {
        self.mouse(
            "mouse_down",
            Input::DispatchMouseEventTypeOption::MousePressed,
            x,
            y,
            Some(Input::MouseButton::Left),
        )
    }

    fn mouse_up(&mut self, x: u32, y: u32) -> Result<(), BrowserError> {
        self.mouse(
            "mouse_up",
            Input::DispatchMouseEventTypeOption::MouseReleased,
            x,
            y,
            Some(Input::MouseButton::Left),
        )
    }

    fn type_text(&mut self, text: &str) -> Result<(), BrowserError> {
        self.tab()?
            .type_str(text)
            .map(|_| ())
            .map_err(|e| BrowserError::op("type", e))
    }

    fn key(&mut self, name: &str) -> Result<(), BrowserError> {
        let key = chrome_key_name(name);
        self.tab()?
            .press_key(&key)
            .map(|_| ())
            .map_err(|e| BrowserError::op("key", e))
    }

    fn select_all(&mut self) -> Result<(), BrowserError> {
        self.evaluate(
            "select_all",
            "(() => { const el = document.activeElement; \
             if (el && typeof el.select === 'function') { el.select(); return true; } \
             return document.execCommand('selectAll'); })()",
        )
    }

    fn scroll_to_start(&mut self) -> Result<(), BrowserError> {
        self.evaluate("scroll", "window.scrollTo(0, 0)")
    }

    fn scroll_to_end(&mut self) -> Result<(), BrowserError> {
        self.evaluate("scroll", "window.scrollTo(0, document.body.scrollHeight)")
    }

    fn scroll_by(&mut self, dx: i64, dy: i64) -> Result<(), BrowserError> {
        self.evaluate("scroll", &format!("window.scrollBy({dx}, {dy})"))
    }

    fn history_back(&mut self) -> Result<(), BrowserError> {
        self.evaluate("go_back", "window.history.back()")
    }

    fn history_forward(&mut self) -> Result<(), BrowserError> {
        self.evaluate("go_forward", "window.history.forward()")
    }

    fn screenshot(&mut self) -> Result<Vec<u8>, BrowserError> {
        self.tab()?
            .capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
            .map_err(|e| BrowserError::op("screenshot", e))
    }

    fn current_url(&mut self) -> Result<String, BrowserError> {
        Ok(self.tab()?.get_url())
    }

    fn wait_for_settle(&mut self, timeout: Duration) -> Result<(), BrowserError> {
        self.tab()?
            .wait_for_element_with_custom_timeout("body", timeout)
            .map(|_| ())
            .map_err(|e| BrowserError::op("settle", e))
    }

    fn close(&mut self) {
        if let Some(tab) = self.tab.take() {
            if let Err(e) = tab.close(false) {
                warn!(error = %e, "failed to close tab");
            }
        }
        // Dropping the handle terminates the Chrome process we launched.
        if let Some(browser) = self.browser.take() {
            drop(browser);
            debug!("Chrome handle released");
        }
    }
}

impl Drop for ChromeBrowser {
    fn drop(&mut self) {
        self.close();
    }
}

/// Bare hosts such as `example.com` are loaded over https.
pub fn with_scheme(url: &str) -> Cow<'_, str> {
    let url = url.trim();
    let has_scheme = url.contains("://")
        || ["about:", "data:", "chrome:", "file:", "javascript:"]
            .iter()
            .any(|p| url.starts_with(p));
    if has_scheme {
        Cow::Borrowed(url)
    } else {
        Cow::Owned(format!("https://{url}"))
    }
}

/// Translate the model's key spelling to a DevTools key name.
///
/// `enter` becomes `Enter`, `ctrl` becomes `Control`, `f5` becomes `F5`; single
/// characters and unrecognized names pass through unchanged.
pub fn chrome_key_name(key: &str) -> String {
    let trimmed = key.trim();
    let lower = trimmed.to_ascii_lowercase();
    let mapped = match lower.as_str() {
        "control" | "ctrl" => "Control",
        "alt" | "option" => "Alt",
        "shift" => "Shift",
        "meta" | "cmd" | "command" | "win" | "windows" | "super" => "Meta",
        "enter" | "return" => "Enter",
        "tab" => "Tab",
        "escape" | "esc" => "Escape",
        "backspace" | "back" => "Backspace",
        "delete" | "del" => "Delete",
        "space" | "spacebar" => " ",
        "insert" | "ins" => "Insert",
        "home" => "Home",
        "end" => "End",
        "pageup" | "pgup" => "PageUp",
        "pagedown" | "pgdn" | "pgdown" => "PageDown",
        "up" | "arrowup" => "ArrowUp",
        "down" | "arrowdown" => "ArrowDown",
        "left" | "arrowleft" => "ArrowLeft",
        "right" | "arrowright" => "ArrowRight",
        s if s.len() >= 2 && s.starts_with('f') => {
            return match s[1..].parse::<u8>() {
                Ok(n @ 1..=24) => format!("F{n}"),
                _ => trimmed.to_string(),
            };
        }
        _ => return trimmed.to_string(),
    };
    mapped.to_string()
}
