use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixels scrolled for a single directional scroll step.
pub const SCROLL_STEP_PX: i64 = 500;

/// Qwen2.5-VL patch factor used by UI-TARS style models when resizing screenshots.
pub const IMAGE_FACTOR: u32 = 28;
pub const MIN_PIXELS: u64 = 100 * 28 * 28;
pub const MAX_PIXELS: u64 = 16384 * 28 * 28;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

impl Point {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

impl MouseButton {
    /// Anything not explicitly right or middle is a left click.
    pub fn from_name(name: Option<&str>) -> Self {
        match name.map(|s| s.trim().to_ascii_lowercase()) {
            Some(s) if s == "right" => MouseButton::Right,
            Some(s) if s == "middle" || s == "wheel" => MouseButton::Middle,
            _ => MouseButton::Left,
        }
    }
}

/// Canonical, protocol independent UI action. Coordinates are in the
/// session's logical viewport space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click { x: i64, y: i64, button: MouseButton },
    DoubleClick { x: i64, y: i64 },
    Move { x: i64, y: i64 },
    Type { text: String },
    Scroll { x: i64, y: i64, dx: i64, dy: i64 },
    Key { keys: Vec<String> },
    Wait { seconds: f64 },
    Screenshot,
    Drag { from: Point, to: Point },
    Terminate { status: String },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Click { .. } => "click",
            Action::DoubleClick { .. } => "double_click",
            Action::Move { .. } => "move",
            Action::Type { .. } => "type",
            Action::Scroll { .. } => "scroll",
            Action::Key { .. } => "key",
            Action::Wait { .. } => "wait",
            Action::Screenshot => "screenshot",
            Action::Drag { .. } => "drag",
            Action::Terminate { .. } => "terminate",
        }
    }

    pub fn is_terminate(&self) -> bool {
        matches!(self, Action::Terminate { .. })
    }

    /// Coordinate of a left or right single click.
    pub fn click_point(&self) -> Option<Point> {
        match self {
            Action::Click { x, y, .. } => Some(Point::new(*x, *y)),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Click { x, y, button: MouseButton::Left } => write!(f, "click({x}, {y})"),
            Action::Click { x, y, button } => write!(f, "click({x}, {y}, {button:?})"),
            Action::DoubleClick { x, y } => write!(f, "double_click({x}, {y})"),
            Action::Move { x, y } => write!(f, "move({x}, {y})"),
            Action::Type { text } => write!(f, "type({text:?})"),
            Action::Scroll { x, y, dx, dy } => write!(f, "scroll({x}, {y}, dx={dx}, dy={dy})"),
            Action::Key { keys } => write!(f, "key({})", keys.join("+")),
            Action::Wait { seconds } => write!(f, "wait({seconds}s)"),
            Action::Screenshot => write!(f, "screenshot()"),
            Action::Drag { from, to } => write!(f, "drag({from} -> {to})"),
            Action::Terminate { status } => write!(f, "terminate({status})"),
        }
    }
}

/// Maps model-space coordinates onto the logical viewport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizationParams {
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub model_width: u32,
    pub model_height: u32,
}

impl NormalizationParams {
    /// Model coordinates already live in the viewport.
    pub fn identity(viewport_width: u32, viewport_height: u32) -> Self {
        Self {
            viewport_width,
            viewport_height,
            model_width: viewport_width,
            model_height: viewport_height,
        }
    }

    /// Model coordinates live in the screenshot space produced by `smart_resize`.
    pub fn resized(viewport_width: u32, viewport_height: u32, factor: u32) -> Self {
        let (model_height, model_width) =
            smart_resize(viewport_height, viewport_width, factor, MIN_PIXELS, MAX_PIXELS);
        Self {
            viewport_width,
            viewport_height,
            model_width,
            model_height,
        }
    }

    pub fn scale_x(&self, x: f64) -> i64 {
        scale(x, self.viewport_width, self.model_width)
    }

    pub fn scale_y(&self, y: f64) -> i64 {
        scale(y, self.viewport_height, self.model_height)
    }

    /// Rescaled point, clamped into the viewport.
    pub fn scale_point(&self, x: f64, y: f64) -> Point {
        Point::new(
            clamp_axis(self.scale_x(x), self.viewport_width),
            clamp_axis(self.scale_y(y), self.viewport_height),
        )
    }

    /// Inverse of [`scale_point`](Self::scale_point).
    pub fn to_model(&self, p: Point) -> Point {
        Point::new(
            scale(p.x as f64, self.model_width, self.viewport_width),
            scale(p.y as f64, self.model_height, self.viewport_height),
        )
    }

    pub fn center(&self) -> Point {
        Point::new(
            i64::from(self.viewport_width / 2),
            i64::from(self.viewport_height / 2),
        )
    }
}

fn clamp_axis(v: i64, extent: u32) -> i64 {
    v.min(i64::from(extent) - 1).max(0)
}

fn scale(v: f64, viewport: u32, model: u32) -> i64 {
    if model == 0 {
        return v.round() as i64;
    }
    (v * f64::from(viewport) / f64::from(model)).round() as i64
}

/// Qwen2.5-VL resize: both sides divisible by `factor`, total pixels within
/// `[min_pixels, max_pixels]`, aspect ratio kept as close as possible.
/// Returns `(height, width)`.
pub fn smart_resize(
    height: u32,
    width: u32,
    factor: u32,
    min_pixels: u64,
    max_pixels: u64,
) -> (u32, u32) {
    let f = f64::from(factor.max(1));
    let (h, w) = (f64::from(height), f64::from(width));
    let round_by = |v: f64| ((v / f).round() * f).max(f);
    let floor_by = |v: f64| ((v / f).floor() * f).max(f);
    let ceil_by = |v: f64| ((v / f).ceil() * f).max(f);

    let mut h_bar = round_by(h);
    let mut w_bar = round_by(w);
    if h_bar * w_bar > max_pixels as f64 {
        let beta = (h * w / max_pixels as f64).sqrt();
        h_bar = floor_by(h / beta);
        w_bar = floor_by(w / beta);
    } else if h_bar * w_bar < min_pixels as f64 {
        let beta = (min_pixels as f64 / (h * w)).sqrt();
        h_bar = ceil_by(h * beta);
        w_bar = ceil_by(w * beta);
    }
    (h_bar as u32, w_bar as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smart_resize_rounds_to_factor() {
        assert_eq!(smart_resize(720, 1280, 28, MIN_PIXELS, MAX_PIXELS), (728, 1288));
        assert_eq!(smart_resize(1080, 1920, 28, MIN_PIXELS, MAX_PIXELS), (1092, 1932));
    }

    #[test]
    fn smart_resize_grows_tiny_images() {
        let (h, w) = smart_resize(20, 20, 28, MIN_PIXELS, MAX_PIXELS);
        assert!(u64::from(h) * u64::from(w) >= MIN_PIXELS);
        assert_eq!(h % 28, 0);
        assert_eq!(w % 28, 0);
    }

    #[test]
    fn rescales_into_viewport() {
        let p = NormalizationParams {
            viewport_width: 1280,
            viewport_height: 720,
            model_width: 640,
            model_height: 360,
        };
        assert_eq!(p.scale_point(100.0, 50.0), Point::new(200, 100));
        assert_eq!(p.to_model(Point::new(200, 100)), Point::new(100, 50));
        assert_eq!(NormalizationParams::identity(1280, 720).scale_point(7.0, 9.0), Point::new(7, 9));
    }

    #[test]
    fn out_of_range_points_are_clamped() {
        let p = NormalizationParams::identity(1280, 720);
        assert_eq!(p.scale_point(-5.0, 9e18), Point::new(0, 719));
        assert_eq!(p.scale_point(1e300, f64::NAN), Point::new(1279, 0));
        assert_eq!(p.scale_point(1279.0, 719.0), Point::new(1279, 719));
    }

    #[test]
    fn button_defaults_to_left() {
        assert_eq!(MouseButton::from_name(None), MouseButton::Left);
        assert_eq!(MouseButton::from_name(Some("left")), MouseButton::Left);
        assert_eq!(MouseButton::from_name(Some("back")), MouseButton::Left);
        assert_eq!(MouseButton::from_name(Some("Right")), MouseButton::Right);
    }
}
