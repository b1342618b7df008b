mod common;

use common::*;
use serde_json::json;
use std::sync::atomic::Ordering;
use trajectory_runner::prompt::REPEAT_WARNING_PREFIX;
use trajectory_runner::{Action, InvocationMode, ModelResponse, MouseButton, Outcome, PoolConfig};

#[tokio::test]
async fn terminate_on_first_call_completes() {
    let h = Harness::new(ScriptedService::new().always("tars", finished_text()), FakeFactory::default());
    let r = h.executor.execute(&local_text("tars"), &task("todo", 3)).await;

    assert_eq!(r.outcome, Outcome::Completed);
    assert_eq!(r.trajectory.len(), 1);
    assert!(r.trajectory.steps()[0].action.is_terminate());
    assert_eq!(r.trajectory.steps()[0].thought.as_deref(), Some("all good"));
    assert!(r.error.is_none());
    assert_eq!(h.pool.idle_count().await, 1);
    assert_eq!(h.sink.results.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn endless_clicks_hit_step_ceiling() {
    let h = Harness::new(ScriptedService::new().always("tars", click_text(100, 200)), FakeFactory::default());
    let r = h.executor.execute(&local_text("tars"), &task("todo", 3)).await;

    assert_eq!(r.outcome, Outcome::MaxStepsReached);
    assert_eq!(r.trajectory.len(), 3);
    assert_eq!(h.service.calls(), 3);
    assert_eq!(h.factory.actions().len(), 3);
    let indices: Vec<_> = r.trajectory.steps().iter().map(|s| s.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(h.sink.screenshots.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn undecodable_output_records_nothing() {
    let service = ScriptedService::new().script(
        "tars",
        vec![
            text("I am not sure what to do"),
            text("Action: teleport(point='<point>1 1</point>')"),
            click_text(10, 10),
            text("Thought: hmm"),
            finished_text(),
        ],
    );
    let h = Harness::new(service, FakeFactory::default());
    let r = h.executor.execute(&local_text("tars"), &task("todo", 5)).await;

    assert_eq!(r.outcome, Outcome::Completed);
    assert_eq!(r.trajectory.len(), 2);
    assert_eq!(h.service.calls(), 5);
    // Retries reuse the step's prompt.
    assert_eq!(h.service.request(0).prompt, h.service.request(2).prompt);
}

#[tokio::test]
async fn local_decode_failures_retry_past_remote_ceiling() {
    let mut replies = vec![text("Thought: still looking"); 6];
    replies.push(finished_text());
    let h = Harness::new(ScriptedService::new().script("tars", replies), FakeFactory::default());
    let r = h.executor.execute(&local_text("tars"), &task("todo", 3)).await;

    assert_eq!(r.outcome, Outcome::Completed);
    assert_eq!(r.trajectory.len(), 1);
    assert_eq!(h.service.calls(), 7);
}

#[tokio::test]
async fn remote_decode_failures_are_bounded() {
    let service = ScriptedService::new().always("op", Ok(ModelResponse::Object(json!({ "x": 1, "y": 2 }))));
    let h = Harness::new(service, FakeFactory::default());
    let r = h.executor.execute(&remote_object("op"), &task("todo", 5)).await;

    assert_eq!(r.outcome, Outcome::FatalError);
    assert!(r.trajectory.is_empty());
    assert_eq!(h.service.calls(), 5);
    assert!(r.error.unwrap().contains("no decodable action"));
    assert_eq!(h.pool.idle_count().await, 1);
}

#[tokio::test]
async fn gateway_failure_is_fatal_but_releases_session() {
    let service = ScriptedService::new()
        .script("op", vec![computer_call("resp_1", "call_1", json!({ "type": "click", "x": 5, "y": 5 }))])
        .always("op", rate_limited());
    let h = Harness::new(service, FakeFactory::default());
    let r = h.executor.execute(&remote_object("op"), &task("todo", 5)).await;

    assert_eq!(r.outcome, Outcome::FatalError);
    assert_eq!(r.trajectory.len(), 1);
    assert!(r.error.as_deref().unwrap().contains("gave up after 5 attempt(s)"));
    assert_eq!(h.pool.idle_count().await, 1);
    assert_eq!(h.factory.closed(), 0);
    assert_eq!(h.sink.results.lock().unwrap()[0].outcome, Outcome::FatalError);
}

#[tokio::test]
async fn continuation_state_is_threaded_between_turns() {
    let service = ScriptedService::new().script(
        "op",
        vec![
            computer_call("resp_1", "call_1", json!({ "type": "click", "x": 5, "y": 5 })),
            computer_call("resp_2", "call_2", json!({ "type": "type", "text": "milk" })),
            computer_call("resp_3", "call_3", json!({ "type": "terminate" })),
        ],
    );
    let h = Harness::new(service, FakeFactory::default());
    let model = remote_object("op");
    let r = h.executor.execute(&model, &task("todo", 5)).await;
    assert_eq!(r.outcome, Outcome::Completed);
    assert_eq!(r.trajectory.steps()[0].thought.as_deref(), Some("next move"));

    assert_eq!(h.service.request(0).mode, InvocationMode::Initial);
    match h.service.request(1).mode {
        InvocationMode::Continuation(s) => {
            assert_eq!(s.last_turn_id, "resp_1");
            assert_eq!(s.last_pending_call_id, "call_1");
        }
        other => panic!("expected continuation, got {other:?}"),
    }
    match h.service.request(2).mode {
        InvocationMode::Continuation(s) => assert_eq!(s.last_pending_call_id, "call_2"),
        other => panic!("expected continuation, got {other:?}"),
    }

    // A new attempt starts from a fresh context.
    let h2 = Harness::new(ScriptedService::new().always("op", rate_limited()), FakeFactory::default());
    h2.executor.execute(&model, &task("again", 2)).await;
    assert_eq!(h2.service.request(0).mode, InvocationMode::Initial);
}

#[tokio::test]
async fn text_models_never_continue() {
    let service = ScriptedService::new().script("tars", vec![click_text(1, 1), finished_text()]);
    let h = Harness::new(service, FakeFactory::default());
    h.executor.execute(&local_text("tars"), &task("todo", 3)).await;
    assert_eq!(h.service.request(1).mode, InvocationMode::Initial);
}

#[tokio::test]
async fn failed_dispatch_is_recorded_and_loop_continues() {
    let factory = FakeFactory::new(FakeState { fail_clicks: true, ..Default::default() });
    let service = ScriptedService::new().script("tars", vec![click_text(1, 1), finished_text()]);
    let h = Harness::new(service, factory);
    let r = h.executor.execute(&local_text("tars"), &task("todo", 3)).await;

    assert_eq!(r.outcome, Outcome::Completed);
    let first = &r.trajectory.steps()[0];
    assert!(!first.result.success);
    assert!(first.result.error.as_deref().unwrap().contains("not clickable"));
    assert!(r.trajectory.steps()[1].result.success);
    assert!(h.service.request(1).prompt.contains("Failed: action failed: element is not clickable"));
}

#[tokio::test]
async fn broken_screenshot_discards_session() {
    let factory = FakeFactory::new(FakeState { fail_screenshot: true, ..Default::default() });
    let h = Harness::new(ScriptedService::new().always("tars", finished_text()), factory);
    let r = h.executor.execute(&local_text("tars"), &task("todo", 3)).await;

    assert_eq!(r.outcome, Outcome::FatalError);
    assert!(r.error.unwrap().contains("screenshot"));
    assert_eq!(h.service.calls(), 0);
    assert_eq!(h.factory.closed(), 1);
    assert_eq!(h.pool.idle_count().await, 0);
    assert_eq!(h.pool.live(), 0);
}

#[tokio::test]
async fn repeated_click_warns_the_model() {
    let h = Harness::new(ScriptedService::new().always("tars", click_text(100, 200)), FakeFactory::default());
    h.executor.execute(&local_text("tars"), &task("todo", 4)).await;

    assert!(!h.service.request(0).prompt.contains(REPEAT_WARNING_PREFIX));
    assert!(!h.service.request(1).prompt.contains(REPEAT_WARNING_PREFIX));
    assert!(h.service.request(2).prompt.contains(REPEAT_WARNING_PREFIX));
    assert!(h.service.request(2).prompt.contains("Current step: 3/4"));
}

#[tokio::test]
async fn text_coordinates_land_in_viewport() {
    // 1280x720 is presented to the model as 1288x728.
    let service = ScriptedService::new().script("tars", vec![click_text(644, 364), finished_text()]);
    let h = Harness::new(service, FakeFactory::default());
    h.executor.execute(&local_text("tars"), &task("todo", 3)).await;

    assert_eq!(
        h.factory.actions()[0],
        Action::Click { x: 640, y: 360, button: MouseButton::Left }
    );
}

#[tokio::test]
async fn attempts_wait_for_a_free_session() {
    let h = Harness::with_pool(
        ScriptedService::new().always("tars", finished_text()),
        FakeFactory::default(),
        PoolConfig { idle_capacity: 1, max_live: 1 },
    );
    let model = local_text("tars");
    let (ta, tb) = (task("a", 2), task("b", 2));
    let (a, b) = tokio::join!(h.executor.execute(&model, &ta), h.executor.execute(&model, &tb));
    assert_eq!(a.outcome, Outcome::Completed);
    assert_eq!(b.outcome, Outcome::Completed);
    assert_eq!(h.factory.created(), 1);
}
