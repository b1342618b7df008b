//! Turns raw model output into a canonical [`Action`].
//!
//! Two families are understood: the free-text `Thought:` / `Action:` grammar
//! spoken by local UI-TARS style models, and API-native action objects such
//! as the Responses API `computer_call`. Vendor field-name quirks stay in the
//! adapters below.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;
use thiserror::Error;

use crate::action::{Action, MouseButton, NormalizationParams, Point, SCROLL_STEP_PX};
use crate::gateway::{ContinuationState, ModelResponse};

const TEXT_WAIT_SECS: f64 = 5.0;
const OBJECT_WAIT_SECS: f64 = 2.0;
/// Longest wait a model may request.
pub const MAX_WAIT_SECS: f64 = 60.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    TextGrammar,
    StructuredObject,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error("model output has no Action line")]
    MissingActionLine,
    #[error("unrecognized action verb `{0}`")]
    UnknownVerb(String),
    #[error("malformed action expression: {0}")]
    Malformed(String),
    #[error("action object has no `type` field")]
    MissingType,
    #[error("unsupported action type `{0}`")]
    UnsupportedType(String),
    #[error("`{kind}` action is missing `{field}`")]
    MissingField { kind: String, field: &'static str },
    #[error("response contains no computer_call")]
    NoComputerCall,
    #[error("expected a {expected} response")]
    ProtocolMismatch { expected: &'static str },
}

/// One decoded model turn.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedTurn {
    pub action: Action,
    pub thought: Option<String>,
    /// Present only for stateful-continuation responses.
    pub continuation: Option<ContinuationState>,
}

pub fn decode(
    raw: &ModelResponse,
    kind: ProtocolKind,
    params: &NormalizationParams,
) -> Result<DecodedTurn, DecodeError> {
    match (kind, raw) {
        (ProtocolKind::TextGrammar, ModelResponse::Text(text)) => decode_text(text, params),
        (ProtocolKind::TextGrammar, ModelResponse::Object(_)) => {
            Err(DecodeError::ProtocolMismatch { expected: "text" })
        }
        (ProtocolKind::StructuredObject, ModelResponse::Object(v)) => decode_object(v, params),
        (ProtocolKind::StructuredObject, ModelResponse::Text(text)) => {
            // Some gateways hand the JSON back as a string.
            let v: Value = serde_json::from_str(text.trim())
                .map_err(|_| DecodeError::ProtocolMismatch { expected: "object" })?;
            decode_object(&v, params)
        }
    }
}

// ========================= Text grammar =========================

pub fn decode_text(text: &str, params: &NormalizationParams) -> Result<DecodedTurn, DecodeError> {
    let (thought, action_line) = split_sections(text);
    let action_line = action_line.ok_or(DecodeError::MissingActionLine)?;
    let call = parse_call(&action_line)?;
    let action = text_call_to_action(&call, params)?;
    Ok(DecodedTurn { action, thought, continuation: None })
}

/// Returns the thought (possibly multi-line) and the first action expression.
fn split_sections(text: &str) -> (Option<String>, Option<String>) {
    let mut thought: Vec<&str> = Vec::new();
    let mut in_thought = false;
    let mut action: Option<String> = None;
    let mut lines = text.lines().map(str::trim);
    while let Some(line) = lines.next() {
        if let Some(rest) = line.strip_prefix("Thought:") {
            in_thought = true;
            thought.push(rest.trim());
        } else if let Some(rest) = line.strip_prefix("Action:") {
            let rest = rest.trim();
            action = if rest.is_empty() {
                lines.find(|l| !l.is_empty()).map(str::to_string)
            } else {
                Some(rest.to_string())
            };
            break;
        } else if in_thought && !line.is_empty() {
            thought.push(line);
        }
    }
    let thought = Some(thought.join(" ").trim().to_string()).filter(|t| !t.is_empty());
    (thought, action)
}

#[derive(Debug, Clone, PartialEq)]
struct Call {
    verb: String,
    args: Vec<(Option<String>, String)>,
}

impl Call {
    /// First keyword argument among `names`, else the positional one at `pos`.
    fn arg(&self, names: &[&str], pos: usize) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k.as_deref().is_some_and(|k| names.contains(&k)))
            .or_else(|| self.args.iter().filter(|(k, _)| k.is_none()).nth(pos))
            .map(|(_, v)| v.as_str())
    }
}

/// Parses `verb(a='x', b=(1,2), 'c')`. Anything after the closing paren is
/// ignored, so only the first call on a line is used.
fn parse_call(expr: &str) -> Result<Call, DecodeError> {
    let expr = expr.trim();
    let verb_len = expr
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(expr.len());
    let verb = &expr[..verb_len];
    if verb.is_empty() {
        return Err(DecodeError::Malformed(expr.to_string()));
    }
    let rest = expr[verb_len..].trim_start();
    let body = rest
        .strip_prefix('(')
        .ok_or_else(|| DecodeError::Malformed(expr.to_string()))?;

    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut depth = 0usize;
    let mut closed = false;
    for c in body.chars() {
        if let Some(q) = quote {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                current.push(c);
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(c);
            }
            ')' if depth == 0 => {
                closed = true;
                break;
            }
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                push_arg(&mut args, &current);
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !closed {
        return Err(DecodeError::Malformed(expr.to_string()));
    }
    push_arg(&mut args, &current);
    Ok(Call { verb: verb.to_ascii_lowercase(), args })
}

fn push_arg(args: &mut Vec<(Option<String>, String)>, raw: &str) {
    let raw = raw.trim();
    if raw.is_empty() {
        return;
    }
    let key_end = raw.find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'));
    match key_end {
        Some(i) if i > 0 && raw[i..].trim_start().starts_with('=') => {
            let value = raw[i..].trim_start()[1..].trim();
            args.push((Some(raw[..i].to_string()), unquote(value)));
        }
        _ => args.push((None, unquote(raw))),
    }
}

fn unquote(v: &str) -> String {
    let inner = ['\'', '"']
        .iter()
        .find_map(|q| v.strip_prefix(*q).and_then(|s| s.strip_suffix(*q)))
        .unwrap_or(v);
    unescape(inner)
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("static regex"))
}

/// Accepts `<point>x y</point>`, `(x,y)`, `[x, y]` or a 4-number box whose
/// center is used.
fn parse_coords(value: &str) -> Option<(f64, f64)> {
    let nums: Vec<f64> = number_re()
        .find_iter(value)
        .filter_map(|m| m.as_str().parse().ok())
        .collect();
    match nums.as_slice() {
        [x, y] => Some((*x, *y)),
        [x1, y1, x2, y2] => Some(((x1 + x2) / 2.0, (y1 + y2) / 2.0)),
        _ => None,
    }
}

const POINT_ARGS: &[&str] = &["point", "start_box", "start_point"];
const END_ARGS: &[&str] = &["end_point", "end_box"];

fn required_point(
    call: &Call,
    names: &[&str],
    pos: usize,
    field: &'static str,
    params: &NormalizationParams,
) -> Result<Point, DecodeError> {
    let raw = call.arg(names, pos).ok_or_else(|| DecodeError::MissingField {
        kind: call.verb.clone(),
        field,
    })?;
    let (x, y) = parse_coords(raw)
        .ok_or_else(|| DecodeError::Malformed(format!("{}: bad coordinates `{raw}`", call.verb)))?;
    Ok(params.scale_point(x, y))
}

fn text_call_to_action(call: &Call, params: &NormalizationParams) -> Result<Action, DecodeError> {
    let action = match call.verb.as_str() {
        "click" | "left_single" => {
            let p = required_point(call, POINT_ARGS, 0, "point", params)?;
            Action::Click { x: p.x, y: p.y, button: MouseButton::Left }
        }
        "left_double" | "double_click" => {
            let p = required_point(call, POINT_ARGS, 0, "point", params)?;
            Action::DoubleClick { x: p.x, y: p.y }
        }
        "right_single" | "right_click" => {
            let p = required_point(call, POINT_ARGS, 0, "point", params)?;
            Action::Click { x: p.x, y: p.y, button: MouseButton::Right }
        }
        "hover" | "mouse_move" | "move" => {
            let p = required_point(call, POINT_ARGS, 0, "point", params)?;
            Action::Move { x: p.x, y: p.y }
        }
        "drag" | "select" => {
            let from = required_point(call, POINT_ARGS, 0, "start_point", params)?;
            let to = required_point(call, END_ARGS, 1, "end_point", params)?;
            Action::Drag { from, to }
        }
        "hotkey" | "press" | "keydown" | "key" => {
            let raw = call.arg(&["key", "keys", "hotkey"], 0).unwrap_or_default();
            let keys: Vec<String> = raw
                .split(|c: char| c.is_whitespace() || c == '+')
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
            if keys.is_empty() {
                return Err(DecodeError::MissingField { kind: call.verb.clone(), field: "key" });
            }
            Action::Key { keys }
        }
        "type" => {
            let text = call.arg(&["content", "text"], 0).ok_or_else(|| DecodeError::MissingField {
                kind: call.verb.clone(),
                field: "content",
            })?;
            Action::Type { text: text.to_string() }
        }
        "scroll" => {
            let anchor = match call.arg(POINT_ARGS, usize::MAX) {
                Some(raw) => {
                    let (x, y) = parse_coords(raw).ok_or_else(|| {
                        DecodeError::Malformed(format!("scroll: bad coordinates `{raw}`"))
                    })?;
                    params.scale_point(x, y)
                }
                None => params.center(),
            };
            let direction = call.arg(&["direction"], 0).unwrap_or("down").to_ascii_lowercase();
            let (dx, dy) = match direction.trim() {
                "up" => (0, -SCROLL_STEP_PX),
                "left" => (-SCROLL_STEP_PX, 0),
                "right" => (SCROLL_STEP_PX, 0),
                _ => (0, SCROLL_STEP_PX),
            };
            Action::Scroll { x: anchor.x, y: anchor.y, dx, dy }
        }
        "wait" => Action::Wait { seconds: TEXT_WAIT_SECS },
        "finished" | "finish" => {
            let status = call
                .arg(&["content", "status"], 0)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or("success");
            Action::Terminate { status: status.to_string() }
        }
        other => return Err(DecodeError::UnknownVerb(other.to_string())),
    };
    Ok(action)
}

// ========================= Structured objects =========================

/// Accepts either a full Responses API payload (`{ id, output: [...] }`) or
/// a bare action object carrying a `type` field.
pub fn decode_object(v: &Value, params: &NormalizationParams) -> Result<DecodedTurn, DecodeError> {
    match v.get("output").and_then(Value::as_array) {
        Some(output) => decode_responses_payload(v, output, params),
        None => Ok(DecodedTurn {
            action: decode_action_object(v, params)?,
            thought: None,
            continuation: None,
        }),
    }
}

fn decode_responses_payload(
    v: &Value,
    output: &[Value],
    params: &NormalizationParams,
) -> Result<DecodedTurn, DecodeError> {
    let item_type = |o: &Value| o.get("type").and_then(Value::as_str).map(str::to_string);

    // Only the first computer_call is acted upon.
    let call = output
        .iter()
        .find(|o| item_type(o).as_deref() == Some("computer_call"))
        .ok_or(DecodeError::NoComputerCall)?;
    let action_obj = call.get("action").ok_or_else(|| DecodeError::MissingField {
        kind: "computer_call".into(),
        field: "action",
    })?;
    let action = decode_action_object(action_obj, params)?;

    let turn_id = v.get("id").and_then(Value::as_str).ok_or_else(|| DecodeError::MissingField {
        kind: "response".into(),
        field: "id",
    })?;
    let call_id = call.get("call_id").and_then(Value::as_str).ok_or_else(|| {
        DecodeError::MissingField { kind: "computer_call".into(), field: "call_id" }
    })?;
    let safety_checks = call
        .get("pending_safety_checks")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let reasoning = output
        .iter()
        .filter(|o| item_type(o).as_deref() == Some("reasoning"))
        .filter_map(|o| o.get("summary").and_then(Value::as_array))
        .flatten()
        .filter_map(|s| s.get("text").and_then(Value::as_str))
        .find(|t| !t.trim().is_empty());
    let message = || {
        output
            .iter()
            .filter(|o| matches!(item_type(o).as_deref(), Some("message" | "assistant_message")))
            .filter_map(|o| o.get("content").and_then(Value::as_array))
            .flatten()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .find(|t| !t.trim().is_empty())
    };
    let thought = reasoning.or_else(message).map(|t| t.trim().to_string());

    Ok(DecodedTurn {
        action,
        thought,
        continuation: Some(ContinuationState {
            last_turn_id: turn_id.to_string(),
            last_pending_call_id: call_id.to_string(),
            pending_safety_checks: safety_checks,
        }),
    })
}

fn field_f64(v: &Value, names: &[&str]) -> Option<f64> {
    names.iter().find_map(|n| v.get(*n)).and_then(|x| {
        x.as_f64()
            .or_else(|| x.as_str().and_then(|s| s.trim().parse().ok()))
    })
}

fn point_from(v: &Value) -> Option<(f64, f64)> {
    Some((field_f64(v, &["x"])?, field_f64(v, &["y"])?))
}

fn required_xy(
    v: &Value,
    kind: &str,
    params: &NormalizationParams,
) -> Result<Point, DecodeError> {
    let missing = |field| DecodeError::MissingField { kind: kind.to_string(), field };
    let x = field_f64(v, &["x"]).ok_or_else(|| missing("x"))?;
    let y = field_f64(v, &["y"]).ok_or_else(|| missing("y"))?;
    Ok(params.scale_point(x, y))
}

/// Maps one vendor action object onto the canonical [`Action`]. Never
/// returns a partially populated action.
pub fn decode_action_object(v: &Value, params: &NormalizationParams) -> Result<Action, DecodeError> {
    let kind = v.get("type").and_then(Value::as_str).ok_or(DecodeError::MissingType)?;
    let missing = |field| DecodeError::MissingField { kind: kind.to_string(), field };

    let action = match kind {
        "click" => {
            let p = required_xy(v, kind, params)?;
            let button = MouseButton::from_name(v.get("button").and_then(Value::as_str));
            Action::Click { x: p.x, y: p.y, button }
        }
        "double_click" | "left_double" => {
            let p = required_xy(v, kind, params)?;
            Action::DoubleClick { x: p.x, y: p.y }
        }
        "right_click" | "right_single" => {
            let p = required_xy(v, kind, params)?;
            Action::Click { x: p.x, y: p.y, button: MouseButton::Right }
        }
        "move" | "mousemove" | "mouse_move" | "pointer_move" => {
            let p = required_xy(v, kind, params)?;
            Action::Move { x: p.x, y: p.y }
        }
        "type" => {
            let text = v.get("text").and_then(Value::as_str).ok_or_else(|| missing("text"))?;
            Action::Type { text: text.to_string() }
        }
        "scroll" => {
            let anchor = point_from(v)
                .map(|(x, y)| params.scale_point(x, y))
                .unwrap_or_else(|| params.center());
            let dx = field_f64(v, &["scroll_x", "delta_x", "dx"]).unwrap_or(0.0).round() as i64;
            let dy = field_f64(v, &["scroll_y", "delta_y", "dy"]).unwrap_or(0.0).round() as i64;
            Action::Scroll { x: anchor.x, y: anchor.y, dx, dy }
        }
        "keypress" | "key_press" | "keydown" | "key_down" | "keyup" | "key_up" | "key" => {
            let keys: Vec<String> = match v.get("keys").and_then(Value::as_array) {
                Some(arr) => arr
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                None => v
                    .get("key")
                    .and_then(Value::as_str)
                    .map(|k| vec![k.to_string()])
                    .unwrap_or_default(),
            };
            if keys.is_empty() {
                return Err(missing("keys"));
            }
            Action::Key { keys }
        }
        "wait" => {
            let seconds = field_f64(v, &["seconds"])
                .or_else(|| field_f64(v, &["ms"]).map(|ms| ms / 1000.0))
                .unwrap_or(OBJECT_WAIT_SECS);
            if !seconds.is_finite() || seconds < 0.0 {
                return Err(DecodeError::Malformed(format!("wait: bad duration `{seconds}`")));
            }
            Action::Wait { seconds: seconds.min(MAX_WAIT_SECS) }
        }
        "screenshot" => Action::Screenshot,
        "drag" => {
            let (from, to) = drag_endpoints(v).ok_or_else(|| missing("from/to"))?;
            Action::Drag {
                from: params.scale_point(from.0, from.1),
                to: params.scale_point(to.0, to.1),
            }
        }
        "terminate" | "finished" | "done" => {
            let status = v.get("status").and_then(Value::as_str).unwrap_or("success");
            Action::Terminate { status: status.to_string() }
        }
        other => return Err(DecodeError::UnsupportedType(other.to_string())),
    };
    Ok(action)
}

type Pair = (f64, f64);

fn drag_endpoints(v: &Value) -> Option<(Pair, Pair)> {
    let explicit = || {
        let fx = field_f64(v, &["from_x", "start_x"])?;
        let fy = field_f64(v, &["from_y", "start_y"])?;
        let tx = field_f64(v, &["to_x", "end_x"])?;
        let ty = field_f64(v, &["to_y", "end_y"])?;
        Some(((fx, fy), (tx, ty)))
    };
    let path = || {
        let points: Vec<Pair> = ["path", "points"]
            .iter()
            .find_map(|n| v.get(*n).and_then(Value::as_array))?
            .iter()
            .filter_map(point_from)
            .collect();
        match points.as_slice() {
            [first, .., last] => Some((*first, *last)),
            _ => None,
        }
    };
    explicit().or_else(path)
}
