use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::action::Action;
use crate::browser::{Browser, BrowserConfig};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DispatchError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("action failed: {0}")]
    Action(String),
    #[error("screenshot failed: {0}")]
    Screenshot(String),
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
    #[error("close failed: {0}")]
    Close(String),
}

/// A live browser tab the executor drives. Coordinates handed to `act` are
/// already in the session's logical viewport.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), DispatchError>;

    /// Performs one action and reports a human readable result message.
    async fn act(&self, action: &Action) -> Result<String, DispatchError>;

    /// Base64 encoded PNG of the current viewport.
    async fn screenshot(&self) -> Result<String, DispatchError>;

    async fn close(&mut self) -> Result<(), DispatchError>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    type Session: BrowserSession + 'static;

    async fn create(&self) -> Result<Self::Session, DispatchError>;
}

// ========================= Chromium Adapter =========================

pub struct ChromiumSession {
    browser: Browser,
    settle: Duration,
    screenshot_timeout: Duration,
}

impl ChromiumSession {
    pub async fn launch(
        cfg: BrowserConfig,
        settle: Duration,
        screenshot_timeout: Duration,
    ) -> Result<Self, DispatchError> {
        let browser = Browser::launch(cfg)
            .await
            .map_err(|e| DispatchError::Launch(e.to_string()))?;
        Ok(Self { browser, settle, screenshot_timeout })
    }

    async fn perform(&self, action: &Action) -> anyhow::Result<String> {
        let msg = match action {
            Action::Click { x, y, button } => {
                self.browser.click(*x, *y, *button).await?;
                format!("Clicked {button:?} at ({x}, {y})")
            }
            Action::DoubleClick { x, y } => {
                self.browser.double_click(*x, *y).await?;
                format!("Double clicked at ({x}, {y})")
            }
            Action::Move { x, y } => {
                self.browser.move_mouse(*x, *y).await?;
                format!("Mouse moved to ({x}, {y})")
            }
            Action::Type { text } => {
                // A trailing newline submits.
                match text.strip_suffix('\n') {
                    Some(body) => {
                        self.browser.type_text(body).await?;
                        self.browser.press_keys(&["Enter".to_string()]).await?;
                    }
                    None => self.browser.type_text(text).await?,
                }
                format!("Typed: {text}")
            }
            Action::Scroll { x, y, dx, dy } => {
                self.browser.scroll(*x, *y, *dx, *dy).await?;
                format!("Scrolled by dx={dx}, dy={dy} at ({x}, {y})")
            }
            Action::Key { keys } => {
                self.browser.press_keys(keys).await?;
                format!("Pressed keys: {}", keys.join(" + "))
            }
            Action::Wait { seconds } => {
                sleep(wait_duration(*seconds)?).await;
                format!("Waited {seconds}s")
            }
            Action::Screenshot => "Screenshot requested".to_string(),
            Action::Drag { from, to } => {
                self.browser.drag(*from, *to).await?;
                format!("Dragged from {from} to {to}")
            }
            Action::Terminate { status } => format!("Finished: {status}"),
        };
        Ok(msg)
    }
}

/// Model-requested pauses must be finite and non-negative.
fn wait_duration(seconds: f64) -> Result<Duration, DispatchError> {
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| DispatchError::Action(format!("bad wait of {seconds}s: {e}")))
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn navigate(&self, url: &str) -> Result<(), DispatchError> {
        self.browser
            .goto(url)
            .await
            .map_err(|e| DispatchError::Navigation(e.to_string()))?;
        sleep(self.settle).await;
        if let Ok(current) = self.browser.url().await {
            debug!(url = %current, "navigated");
        }
        Ok(())
    }

    async fn act(&self, action: &Action) -> Result<String, DispatchError> {
        let msg = self
            .perform(action)
            .await
            .map_err(|e| DispatchError::Action(e.to_string()))?;
        // Let DOM effects land before the next observation.
        sleep(self.settle).await;
        Ok(msg)
    }

    async fn screenshot(&self) -> Result<String, DispatchError> {
        timeout(self.screenshot_timeout, self.browser.screenshot_b64())
            .await
            .map_err(|_| DispatchError::Timeout("screenshot", self.screenshot_timeout))?
            .map_err(|e| DispatchError::Screenshot(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), DispatchError> {
        self.browser
            .close()
            .await
            .map_err(|e| DispatchError::Close(e.to_string()))
    }
}

/// Launches a fresh headless Chromium per pooled session.
#[derive(Clone, Debug)]
pub struct ChromiumSessionFactory {
    pub browser: BrowserConfig,
    pub settle: Duration,
    pub screenshot_timeout: Duration,
}

impl ChromiumSessionFactory {
    pub fn from_config(cfg: &crate::config::RunnerConfig) -> Self {
        Self {
            browser: BrowserConfig {
                headless: cfg.headless,
                user_agent: None,
                width: cfg.viewport.0,
                height: cfg.viewport.1,
            },
            settle: cfg.settle_delay,
            screenshot_timeout: cfg.screenshot_timeout,
        }
    }
}

#[async_trait]
impl SessionFactory for ChromiumSessionFactory {
    type Session = ChromiumSession;

    async fn create(&self) -> Result<ChromiumSession, DispatchError> {
        ChromiumSession::launch(self.browser.clone(), self.settle, self.screenshot_timeout).await
    }
}
