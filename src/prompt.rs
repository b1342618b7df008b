//! Per-step prompt construction from the rolling trajectory window.

use crate::action::{Action, NormalizationParams, Point};
use crate::agent::{TaskSpec, TrajectoryStep};
use crate::decode::ProtocolKind;

/// Steps of history shown to text-grammar models.
pub const TEXT_HISTORY_WINDOW: usize = 5;
/// Steps of history shown to structured-object models; the service keeps
/// the rest server side.
pub const OBJECT_HISTORY_WINDOW: usize = 3;

pub const REPEAT_WARNING_PREFIX: &str = "**CRITICAL**: You clicked point";

pub struct PromptContext<'a> {
    pub task: &'a TaskSpec,
    pub history: &'a [TrajectoryStep],
    /// One based index of the step about to run.
    pub current_step: usize,
    pub max_steps: usize,
}

pub fn build_prompt(protocol: ProtocolKind, ctx: &PromptContext<'_>, params: &NormalizationParams) -> String {
    match protocol {
        ProtocolKind::TextGrammar => text_grammar_prompt(ctx, params),
        ProtocolKind::StructuredObject => structured_prompt(ctx),
    }
}

/// Advisory only: fires when the two most recent steps clicked the exact
/// same coordinate.
pub fn repeat_warning(history: &[TrajectoryStep]) -> Option<String> {
    let [.., prev, last] = history else {
        return None;
    };
    match (prev.action.click_point(), last.action.click_point()) {
        (Some(a), Some(b)) if a == b => Some(format!(
            "{REPEAT_WARNING_PREFIX} [{}, {}] twice! Check if task is complete before clicking again.",
            b.x, b.y
        )),
        _ => None,
    }
}

fn recent(history: &[TrajectoryStep], window: usize) -> &[TrajectoryStep] {
    &history[history.len().saturating_sub(window)..]
}

fn task_block(task: &TaskSpec) -> String {
    let mut s = task.description.trim().to_string();
    if !task.success_criteria.trim().is_empty() {
        s.push_str("\n\nSuccess criteria: ");
        s.push_str(task.success_criteria.trim());
    }
    s
}

fn outcome_suffix(step: &TrajectoryStep, arrow: &str) -> String {
    if step.result.success {
        format!(" {arrow} Success")
    } else {
        let err = step.result.error.as_deref().unwrap_or("unknown error");
        format!(" {arrow} Failed: {err}")
    }
}

fn grammar_point(p: Point) -> String {
    format!("'<point>{} {}</point>'", p.x, p.y)
}

fn text_history_line(action: &Action, params: &NormalizationParams) -> String {
    let m = |x: i64, y: i64| grammar_point(params.to_model(Point::new(x, y)));
    match action {
        Action::Click { x, y, button: crate::action::MouseButton::Right } => {
            format!("Action: right_single(point={})", m(*x, *y))
        }
        Action::Click { x, y, .. } => format!("Action: click(point={})", m(*x, *y)),
        Action::DoubleClick { x, y } => format!("Action: left_double(point={})", m(*x, *y)),
        Action::Move { x, y } => format!("Action: hover(point={})", m(*x, *y)),
        Action::Type { text } => format!("Action: type(content='{}')", text.escape_default()),
        Action::Scroll { dx, dy, .. } => {
            let direction = match (dx.signum(), dy.signum()) {
                (_, -1) => "up",
                (-1, 0) => "left",
                (1, 0) => "right",
                _ => "down",
            };
            format!("Action: scroll(direction='{direction}')")
        }
        Action::Key { keys } => format!("Action: hotkey(key='{}')", keys.join(" ").to_lowercase()),
        Action::Wait { .. } => "Action: wait()".to_string(),
        Action::Screenshot => "Action: screenshot".to_string(),
        Action::Drag { from, to } => format!(
            "Action: drag(start_point={}, end_point={})",
            m(from.x, from.y),
            m(to.x, to.y)
        ),
        Action::Terminate { status } => format!("Action: finished(content='{status}')"),
    }
}

fn text_grammar_prompt(ctx: &PromptContext<'_>, params: &NormalizationParams) -> String {
    let history: String = recent(ctx.history, TEXT_HISTORY_WINDOW)
        .iter()
        .map(|s| format!("{}{}\n", text_history_line(&s.action, params), outcome_suffix(s, "->")))
        .collect();
    let instruction = format!(
        "{task}\n\n{warning}\n\nAction history:\n{history}\n\nCurrent step: {step}/{max}",
        task = task_block(ctx.task),
        warning = repeat_warning(ctx.history).map(|w| format!("\n{w}")).unwrap_or_default(),
        history = if history.is_empty() { "No previous actions".to_string() } else { history },
        step = ctx.current_step,
        max = ctx.max_steps,
    );
    format!("{GUI_AGENT_PREAMBLE}{instruction}")
}

fn structured_history_line(number: usize, action: &Action) -> String {
    let what = match action {
        Action::Click { x, y, .. } => format!("Clicked at ({x}, {y})"),
        Action::DoubleClick { x, y } => format!("Double clicked at ({x}, {y})"),
        Action::Move { x, y } => format!("Moved mouse to ({x}, {y})"),
        Action::Type { text } => format!("Typed '{text}'"),
        Action::Scroll { dy, .. } if *dy < 0 => "Scrolled up".to_string(),
        Action::Scroll { .. } => "Scrolled down".to_string(),
        Action::Key { keys } => format!("Pressed {}", keys.join("+")),
        Action::Wait { seconds } => format!("Waited {seconds}s"),
        Action::Screenshot => "Took a screenshot".to_string(),
        Action::Drag { from, to } => format!("Dragged from {from} to {to}"),
        Action::Terminate { status } => format!("Finished ({status})"),
    };
    format!("Step {number}: {what}")
}

fn structured_prompt(ctx: &PromptContext<'_>) -> String {
    let window = recent(ctx.history, OBJECT_HISTORY_WINDOW);
    let first_number = ctx.history.len() - window.len() + 1;
    let history: String = window
        .iter()
        .enumerate()
        .map(|(i, s)| format!("{}{}\n", structured_history_line(first_number + i, &s.action), outcome_suffix(s, "→")))
        .collect();
    format!(
        "Complete this task: {task}\n\n{warning}\n\nContext from previous actions:\n{history}\n\nCurrent step: {step}/{max}\n\n\
         Please analyze the current state and take the next action to complete the task. \
         If the task appears to be completed successfully, you may finish.",
        task = task_block(ctx.task),
        warning = repeat_warning(ctx.history).map(|w| format!("\n{w}")).unwrap_or_default(),
        history = if history.is_empty() { "No previous actions".to_string() } else { history },
        step = ctx.current_step,
        max = ctx.max_steps,
    )
}

const GUI_AGENT_PREAMBLE: &str = r#"You are a GUI agent. You are given a task and your action history, with screenshots. You need to perform the next action to complete the task.

## Output Format
```
Thought: ...
Action: ...
```

## Action Space

click(point='<point>x1 y1</point>')
left_double(point='<point>x1 y1</point>')
right_single(point='<point>x1 y1</point>')
drag(start_point='<point>x1 y1</point>', end_point='<point>x2 y2</point>')
hotkey(key='ctrl c') # Split keys with a space and use lowercase. Also, do not use more than 3 keys in one hotkey action.
type(content='xxx') # Use escape characters \\, \', and \n in content part to ensure we can parse the content in normal python string format. If you want to submit your input, use \n at the end of content.
scroll(point='<point>x1 y1</point>', direction='down or up or right or left') # Show more information on the `direction` side.
wait() #Sleep for 5s and take a screenshot to check for any changes.
finished(content='xxx') # Use escape characters \\, \', and \n in content part to ensure we can parse the content in normal python string format.


## Note
- Use English in `Thought` part.
- Write a small plan and finally summarize your next action (with its target element) in one sentence in `Thought` part.

## User Instruction
"#;
