use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
    DispatchMouseEventType, InsertTextParams, MouseButton as CdpMouseButton,
};
use chromiumoxide::layout::Point as CdpPoint;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use nanoid::nanoid;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use crate::action::{MouseButton, Point};

const DRAG_STEPS: i64 = 10;

#[derive(Clone, Debug)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub width: u32,
    pub height: u32,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self { headless: true, user_agent: None, width: 1280, height: 720 }
    }
}

pub struct Browser {
    page: Page,
    browser: OxideBrowser,
    handler: JoinHandle<()>,
    profile_dir: PathBuf,
    width: u32,
    height: u32,
}

impl Browser {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // A private profile per instance; concurrent launches otherwise trip
        // Chromium's ProcessSingleton lock.
        let profile_dir = std::env::temp_dir().join(format!("cua-profile-{}", nanoid!(10)));
        std::fs::create_dir_all(&profile_dir)?;
        builder = builder
            .user_data_dir(profile_dir.clone())
            .window_size(cfg.width, cfg.height)
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-dev-shm-usage");
        let bcfg = builder.build().map_err(|e| anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        let handler = tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });
        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await?;
        }
        let this = Self {
            page,
            browser,
            handler,
            profile_dir,
            width: cfg.width,
            height: cfg.height,
        };
        this.apply_viewport().await?;
        Ok(this)
    }

    async fn apply_viewport(&self) -> Result<()> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(i64::from(self.width))
            .height(i64::from(self.height))
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(metrics).await?;
        Ok(())
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    pub async fn url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    pub async fn move_mouse(&self, x: i64, y: i64) -> Result<()> {
        self.page.move_mouse(cdp_point(x, y)).await?;
        Ok(())
    }

    async fn mouse_event(
        &self,
        kind: DispatchMouseEventType,
        x: i64,
        y: i64,
        button: CdpMouseButton,
        click_count: i64,
    ) -> Result<()> {
        let cmd = DispatchMouseEventParams::builder()
            .r#type(kind)
            .x(x as f64)
            .y(y as f64)
            .button(button)
            .click_count(click_count)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(cmd).await?;
        Ok(())
    }

    pub async fn click(&self, x: i64, y: i64, button: MouseButton) -> Result<()> {
        let btn = match button {
            MouseButton::Left => CdpMouseButton::Left,
            MouseButton::Right => CdpMouseButton::Right,
            MouseButton::Middle => CdpMouseButton::Middle,
        };
        self.move_mouse(x, y).await?;
        self.mouse_event(DispatchMouseEventType::MousePressed, x, y, btn.clone(), 1).await?;
        self.mouse_event(DispatchMouseEventType::MouseReleased, x, y, btn, 1).await
    }

    pub async fn double_click(&self, x: i64, y: i64) -> Result<()> {
        self.move_mouse(x, y).await?;
        for count in 1..=2 {
            self.mouse_event(DispatchMouseEventType::MousePressed, x, y, CdpMouseButton::Left, count)
                .await?;
            self.mouse_event(DispatchMouseEventType::MouseReleased, x, y, CdpMouseButton::Left, count)
                .await?;
        }
        Ok(())
    }

    /// Wheel scroll anchored at `(x, y)`.
    pub async fn scroll(&self, x: i64, y: i64, dx: i64, dy: i64) -> Result<()> {
        self.move_mouse(x, y).await?;
        let wheel = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseWheel)
            .x(x as f64)
            .y(y as f64)
            .delta_x(dx as f64)
            .delta_y(dy as f64)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(wheel).await?;
        Ok(())
    }

    pub async fn type_text(&self, text: &str) -> Result<()> {
        self.page.execute(InsertTextParams::new(text)).await?;
        Ok(())
    }

    /// Holds every key but the last, presses the last, then releases in reverse.
    pub async fn press_keys(&self, keys: &[String]) -> Result<()> {
        let Some((last, held)) = keys.split_last() else {
            return Err(anyhow!("no keys provided"));
        };
        let held: Vec<KeyDef> = held.iter().map(|k| KeyDef::lookup(k)).collect();
        let last = KeyDef::lookup(last);

        let mut modifiers = 0;
        for k in &held {
            modifiers |= k.modifier_bit();
            self.key_event(DispatchKeyEventType::RawKeyDown, k, modifiers, false).await?;
        }
        let printable = modifiers & (MOD_ALT | MOD_CTRL | MOD_META) == 0;
        self.key_event(DispatchKeyEventType::KeyDown, &last, modifiers, printable).await?;
        self.key_event(DispatchKeyEventType::KeyUp, &last, modifiers, false).await?;
        for k in held.iter().rev() {
            modifiers &= !k.modifier_bit();
            self.key_event(DispatchKeyEventType::KeyUp, k, modifiers, false).await?;
        }
        Ok(())
    }

    async fn key_event(
        &self,
        kind: DispatchKeyEventType,
        key: &KeyDef,
        modifiers: i64,
        with_text: bool,
    ) -> Result<()> {
        let mut cmd = DispatchKeyEventParams::builder()
            .r#type(kind)
            .key(key.key.clone())
            .code(key.code.clone())
            .windows_virtual_key_code(key.key_code)
            .native_virtual_key_code(key.key_code)
            .modifiers(modifiers);
        if with_text {
            if let Some(text) = &key.text {
                cmd = cmd.text(text.clone()).unmodified_text(text.clone());
            }
        }
        self.page.execute(cmd.build().map_err(|e| anyhow!(e))?).await?;
        Ok(())
    }

    pub async fn drag(&self, from: Point, to: Point) -> Result<()> {
        self.move_mouse(from.x, from.y).await?;
        self.mouse_event(DispatchMouseEventType::MousePressed, from.x, from.y, CdpMouseButton::Left, 1)
            .await?;
        for i in 1..=DRAG_STEPS {
            let (x, y) = lerp(from, to, i as f64 / DRAG_STEPS as f64);
            self.mouse_event(DispatchMouseEventType::MouseMoved, x, y, CdpMouseButton::Left, 0)
                .await?;
        }
        self.mouse_event(DispatchMouseEventType::MouseReleased, to.x, to.y, CdpMouseButton::Left, 1)
            .await
    }

    /// Viewport screenshot as base64 PNG.
    pub async fn screenshot_b64(&self) -> Result<String> {
        let take = || async {
            self.page
                .screenshot(ScreenshotParams::builder().full_page(false).build())
                .await
        };
        match take().await {
            Ok(bytes) => Ok(STANDARD.encode(bytes)),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("0 width") || msg.contains("0 height") {
                    // Force the viewport and retry once.
                    self.apply_viewport().await?;
                    sleep(Duration::from_millis(50)).await;
                    let bytes = take().await?;
                    return Ok(STANDARD.encode(bytes));
                }
                Err(anyhow!(e))
            }
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        let closed = self.browser.close().await;
        let _ = self.browser.wait().await;
        self.handler.abort();
        if let Err(e) = std::fs::remove_dir_all(&self.profile_dir) {
            debug!(dir = %self.profile_dir.display(), error = %e, "profile cleanup failed");
        }
        closed?;
        Ok(())
    }
}

fn lerp(from: Point, to: Point, t: f64) -> (i64, i64) {
    let at = |a: i64, b: i64| (a as f64 + (b as f64 - a as f64) * t).round() as i64;
    (at(from.x, to.x), at(from.y, to.y))
}

fn cdp_point(x: i64, y: i64) -> CdpPoint {
    CdpPoint { x: x as f64, y: y as f64 }
}

const MOD_ALT: i64 = 1;
const MOD_CTRL: i64 = 2;
const MOD_META: i64 = 4;
const MOD_SHIFT: i64 = 8;

/// CDP description of one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyDef {
    pub key: String,
    pub code: String,
    pub key_code: i64,
    pub text: Option<String>,
}

impl KeyDef {
    fn named(key: &str, code: &str, key_code: i64, text: Option<&str>) -> Self {
        Self {
            key: key.into(),
            code: code.into(),
            key_code,
            text: text.map(str::to_string),
        }
    }

    /// Maps model key names (`ctrl`, `return`, `arrowleft`, `f5`, `a`) onto
    /// DOM key values.
    pub fn lookup(name: &str) -> Self {
        let lower = name.trim().to_ascii_lowercase();
        match lower.as_str() {
            "enter" | "return" => Self::named("Enter", "Enter", 13, Some("\r")),
            "tab" => Self::named("Tab", "Tab", 9, None),
            "space" | " " => Self::named(" ", "Space", 32, Some(" ")),
            "escape" | "esc" => Self::named("Escape", "Escape", 27, None),
            "backspace" => Self::named("Backspace", "Backspace", 8, None),
            "delete" | "del" => Self::named("Delete", "Delete", 46, None),
            "insert" => Self::named("Insert", "Insert", 45, None),
            "home" => Self::named("Home", "Home", 36, None),
            "end" => Self::named("End", "End", 35, None),
            "pageup" => Self::named("PageUp", "PageUp", 33, None),
            "pagedown" => Self::named("PageDown", "PageDown", 34, None),
            "arrowleft" | "left" => Self::named("ArrowLeft", "ArrowLeft", 37, None),
            "arrowup" | "up" => Self::named("ArrowUp", "ArrowUp", 38, None),
            "arrowright" | "right" => Self::named("ArrowRight", "ArrowRight", 39, None),
            "arrowdown" | "down" => Self::named("ArrowDown", "ArrowDown", 40, None),
            "shift" => Self::named("Shift", "ShiftLeft", 16, None),
            "ctrl" | "control" => Self::named("Control", "ControlLeft", 17, None),
            "alt" | "option" => Self::named("Alt", "AltLeft", 18, None),
            "meta" | "cmd" | "command" | "super" | "win" => Self::named("Meta", "MetaLeft", 91, None),
            f if f.len() > 1 && f.starts_with('f') && f[1..].parse::<u8>().is_ok_and(|n| (1..=12).contains(&n)) => {
                let n: i64 = f[1..].parse().unwrap_or(1);
                let key = format!("F{n}");
                Self::named(&key, &key, 111 + n, None)
            }
            _ => {
                let mut chars = name.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) if c.is_ascii_alphabetic() => {
                        let upper = c.to_ascii_uppercase();
                        let text = c.to_string();
                        Self::named(&text, &format!("Key{upper}"), upper as i64, Some(&text))
                    }
                    (Some(c), None) if c.is_ascii_digit() => {
                        let text = c.to_string();
                        Self::named(&text, &format!("Digit{c}"), c as i64, Some(&text))
                    }
                    (Some(c), None) => {
                        let text = c.to_string();
                        Self::named(&text, "", 0, Some(&text))
                    }
                    _ => Self::named(name, name, 0, None),
                }
            }
        }
    }

    fn modifier_bit(&self) -> i64 {
        match self.key.as_str() {
            "Alt" => MOD_ALT,
            "Control" => MOD_CTRL,
            "Meta" => MOD_META,
            "Shift" => MOD_SHIFT,
            _ => 0,
        }
    }
}
