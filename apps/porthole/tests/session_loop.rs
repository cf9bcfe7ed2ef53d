//! Session-core scenarios: frame pacing, full/diff classification,
//! input injection, and lifecycle, driven against a scripted renderer
//! on a paused clock.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use common::{assert_silent, next_message, MockFactory, SharedMock};
use porthole::model::Line;
use porthole::protocol::{ClientMessage, ServerMessage, MouseAction};
use porthole::renderer::{SelectionEvent, WheelDirection};
use porthole::session::{
    ConnectionHooks, HookHandle, NoHooks, Session, SessionConfig, SessionError, SessionHandle,
    SessionId,
};

fn config(cols: u16, rows: u16) -> SessionConfig {
    SessionConfig {
        initial_cols: cols,
        initial_rows: rows,
        ..SessionConfig::default()
    }
}

async fn start(
    cols: u16,
    rows: u16,
) -> (SessionHandle, broadcast::Receiver<ServerMessage>, SharedMock) {
    let (factory, state) = MockFactory::new();
    let handle = Session::create(
        SessionId::random(),
        config(cols, rows),
        &factory,
        Arc::new(NoHooks),
    )
    .await
    .expect("session should start");
    let rx = handle.subscribe();
    (handle, rx, state)
}

#[tokio::test(start_paused = true)]
async fn first_frame_is_full() {
    let (_handle, mut rx, _state) = start(80, 24).await;
    match next_message(&mut rx).await {
        ServerMessage::Full { data } => {
            assert_eq!(data.cols, 80);
            assert_eq!(data.rows, 24);
            assert_eq!(data.total_lines, 24);
            assert_eq!(data.lines.len(), 24);
            assert!(data.lines.iter().all(Line::is_empty));
            assert_eq!((data.cursor.x, data.cursor.y), (1, 1));
            assert!(data.cursor_visible);
        }
        other => panic!("expected full, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn single_line_change_emits_diff() {
    let (_handle, mut rx, state) = start(80, 24).await;
    assert!(matches!(next_message(&mut rx).await, ServerMessage::Full { .. }));

    state.lock().unwrap().set_line(5, "hi");
    match next_message(&mut rx).await {
        ServerMessage::Diff { changes } => {
            assert_eq!(changes.len(), 1);
            assert_eq!(changes[0].index, 5);
            let span = &changes[0].line.spans[0];
            assert_eq!(span.text, "hi");
            assert_eq!(span.fg, None);
            assert_eq!(span.flags.0, 0);
            assert_eq!(span.width, 2);
        }
        other => panic!("expected diff, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn majority_change_escalates_to_full() {
    let (_handle, mut rx, state) = start(80, 24).await;
    assert!(matches!(next_message(&mut rx).await, ServerMessage::Full { .. }));

    {
        let mut state = state.lock().unwrap();
        for row in 0..13 {
            state.set_line(row, "changed");
        }
    }
    assert!(matches!(next_message(&mut rx).await, ServerMessage::Full { .. }));
}

#[tokio::test(start_paused = true)]
async fn half_change_stays_a_diff() {
    let (_handle, mut rx, state) = start(80, 24).await;
    assert!(matches!(next_message(&mut rx).await, ServerMessage::Full { .. }));

    {
        let mut state = state.lock().unwrap();
        for row in 0..12 {
            state.set_line(row, "changed");
        }
    }
    match next_message(&mut rx).await {
        ServerMessage::Diff { changes } => assert_eq!(changes.len(), 12),
        other => panic!("expected diff, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn resize_forces_full_with_new_dims() {
    let (handle, mut rx, state) = start(80, 24).await;
    assert!(matches!(next_message(&mut rx).await, ServerMessage::Full { .. }));

    handle.handle_message(ClientMessage::Resize {
        cols: 100,
        rows: 30,
    });
    match next_message(&mut rx).await {
        ServerMessage::Full { data } => {
            assert_eq!(data.cols, 100);
            assert_eq!(data.rows, 30);
            assert_eq!(data.lines.len(), 30);
        }
        other => panic!("expected full, got {other:?}"),
    }
    assert!(state.lock().unwrap().resizes.contains(&(100, 30)));
}

#[tokio::test(start_paused = true)]
async fn resize_is_clamped_to_maxima() {
    let (handle, mut rx, state) = start(80, 24).await;
    assert!(matches!(next_message(&mut rx).await, ServerMessage::Full { .. }));

    handle.handle_message(ClientMessage::Resize {
        cols: 10_000,
        rows: 10_000,
    });
    assert!(matches!(next_message(&mut rx).await, ServerMessage::Full { .. }));
    assert!(state.lock().unwrap().resizes.contains(&(500, 200)));
}

#[tokio::test(start_paused = true)]
async fn pings_answer_pongs_and_nothing_else() {
    let (handle, mut rx, _state) = start(80, 24).await;
    assert!(matches!(next_message(&mut rx).await, ServerMessage::Full { .. }));

    for _ in 0..10 {
        handle.handle_message(ClientMessage::Ping);
    }
    for _ in 0..10 {
        assert!(matches!(next_message(&mut rx).await, ServerMessage::Pong));
    }
    handle.handle_message(ClientMessage::Resize { cols: 90, rows: 25 });
    match next_message(&mut rx).await {
        ServerMessage::Full { data } => assert_eq!((data.cols, data.rows), (90, 25)),
        other => panic!("expected full after resize, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn cursor_emitted_only_on_change() {
    let (_handle, mut rx, state) = start(80, 24).await;
    assert!(matches!(next_message(&mut rx).await, ServerMessage::Full { .. }));

    state.lock().unwrap().cursor = (3, 1);
    match next_message(&mut rx).await {
        ServerMessage::Cursor { x, y, visible } => {
            assert_eq!((x, y), (4, 2));
            assert!(visible);
        }
        other => panic!("expected cursor, got {other:?}"),
    }

    // Unchanged cursor stays silent across ticks.
    assert_silent(&mut rx, Duration::from_millis(200)).await;

    state.lock().unwrap().cursor_visible = false;
    match next_message(&mut rx).await {
        ServerMessage::Cursor { visible, .. } => assert!(!visible),
        other => panic!("expected cursor, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn selection_events_pass_through_one_based() {
    let (_handle, mut rx, state) = start(80, 24).await;
    assert!(matches!(next_message(&mut rx).await, ServerMessage::Full { .. }));

    state
        .lock()
        .unwrap()
        .selections
        .push_back(SelectionEvent::Changed {
            anchor: (0, 0),
            focus: (4, 0),
        });
    match next_message(&mut rx).await {
        ServerMessage::Selection { anchor, focus } => {
            assert_eq!((anchor.x, anchor.y), (1, 1));
            assert_eq!((focus.x, focus.y), (5, 1));
        }
        other => panic!("expected selection, got {other:?}"),
    }

    state
        .lock()
        .unwrap()
        .selections
        .push_back(SelectionEvent::Cleared);
    assert!(matches!(
        next_message(&mut rx).await,
        ServerMessage::SelectionClear
    ));
}

#[tokio::test(start_paused = true)]
async fn render_failure_emits_error_and_continues() {
    let (_handle, mut rx, state) = start(80, 24).await;
    assert!(matches!(next_message(&mut rx).await, ServerMessage::Full { .. }));

    state.lock().unwrap().fail_next_render = Some("boom".into());
    match next_message(&mut rx).await {
        ServerMessage::Error { message } => assert!(message.contains("boom")),
        other => panic!("expected error, got {other:?}"),
    }

    state.lock().unwrap().set_line(1, "recovered");
    assert!(matches!(
        next_message(&mut rx).await,
        ServerMessage::Diff { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn key_names_are_mapped_and_characters_pass_through() {
    let (handle, mut rx, state) = start(80, 24).await;
    assert!(matches!(next_message(&mut rx).await, ServerMessage::Full { .. }));

    handle.handle_message(ClientMessage::Key {
        key: "ArrowUp".into(),
        modifiers: None,
    });
    handle.handle_message(ClientMessage::Key {
        key: "x".into(),
        modifiers: None,
    });
    handle.handle_message(ClientMessage::Mouse {
        action: MouseAction::Down,
        x: 2,
        y: 3,
        button: Some(0),
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    let state = state.lock().unwrap();
    assert_eq!(state.keys, vec!["up".to_string(), "x".to_string()]);
    assert_eq!(state.mouse, vec!["down 2,3 Left".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn both_wheel_encodings_are_accepted() {
    let (handle, _rx, state) = start(80, 24).await;

    // Legacy form: a mouse action with button 4 (up) or 5 (down).
    handle.handle_message(ClientMessage::Mouse {
        action: MouseAction::Scroll,
        x: 1,
        y: 1,
        button: Some(4),
    });
    // Explicit form, signed and clamped.
    handle.handle_message(ClientMessage::Scroll { x: 1, y: 1, lines: -3 });
    handle.handle_message(ClientMessage::Scroll { x: 1, y: 1, lines: 200 });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let wheels = state.lock().unwrap().wheels.clone();
    assert_eq!(
        wheels,
        vec![
            (WheelDirection::Up, 1),
            (WheelDirection::Up, 3),
            (WheelDirection::Down, 50),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn invalid_sizes_are_rejected() {
    let (factory, _state) = MockFactory::new();
    let error = Session::create(
        SessionId::random(),
        config(0, 24),
        &factory,
        Arc::new(NoHooks),
    )
    .await
    .unwrap_err();
    assert!(matches!(error, SessionError::InvalidSize { .. }));

    let (factory, _state) = MockFactory::new();
    let error = Session::create(
        SessionId::random(),
        config(501, 24),
        &factory,
        Arc::new(NoHooks),
    )
    .await
    .unwrap_err();
    assert!(matches!(error, SessionError::InvalidSize { .. }));
}

#[tokio::test(start_paused = true)]
async fn renderer_create_failure_propagates() {
    let (mut factory, _state) = MockFactory::new();
    factory.fail_create = true;
    let error = Session::create(
        SessionId::random(),
        config(80, 24),
        &factory,
        Arc::new(NoHooks),
    )
    .await
    .unwrap_err();
    assert!(matches!(error, SessionError::Renderer(_)));
}

#[derive(Default)]
struct CountingHooks {
    connected: AtomicUsize,
    disposed: AtomicUsize,
}

impl ConnectionHooks for CountingHooks {
    fn connected(&self, _id: &SessionId) -> Option<HookHandle> {
        self.connected.fetch_add(1, Ordering::SeqCst);
        Some(HookHandle(7))
    }

    fn disconnected(&self, handle: HookHandle) {
        assert_eq!(handle, HookHandle(7));
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn destroy_is_idempotent_and_disposes_once() {
    let (factory, state) = MockFactory::new();
    let hooks = Arc::new(CountingHooks::default());
    let handle = Session::create(
        SessionId::random(),
        config(80, 24),
        &factory,
        hooks.clone(),
    )
    .await
    .unwrap();
    let mut rx = handle.subscribe();
    assert!(matches!(next_message(&mut rx).await, ServerMessage::Full { .. }));

    handle.destroy();
    handle.destroy();
    handle.closed().await;

    assert_eq!(hooks.connected.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.disposed.load(Ordering::SeqCst), 1);
    assert!(state.lock().unwrap().destroyed);

    // Messages after destroy are silently ignored and emit nothing.
    handle.handle_message(ClientMessage::Ping);
    assert_silent(&mut rx, Duration::from_millis(200)).await;
}

#[tokio::test(start_paused = true)]
async fn slow_renders_never_overlap() {
    let (mut factory, state) = MockFactory::new();
    // Render takes longer than a tick period; ticks must coalesce.
    factory.render_delay = Duration::from_millis(50);
    let handle = Session::create(
        SessionId::random(),
        config(80, 24),
        &factory,
        Arc::new(NoHooks),
    )
    .await
    .unwrap();

    for _ in 0..5 {
        handle.handle_message(ClientMessage::Key {
            key: "a".into(),
            modifiers: None,
        });
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    let state = state.lock().unwrap();
    assert!(state.render_count >= 2);
    assert!(!state.overlapped, "tick bodies overlapped");
}
