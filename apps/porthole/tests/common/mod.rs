//! Scripted renderer shared by the session integration tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::timeout;

use porthole::model::{Line, Span};
use porthole::protocol::{Modifiers, ServerMessage};
use porthole::renderer::{
    FrameCapture, MouseButton, Renderer, RendererError, RendererFactory, SelectionEvent,
    WheelDirection,
};

#[derive(Default)]
pub struct MockState {
    pub cols: u16,
    pub rows: u16,
    pub lines: Vec<Line>,
    pub cursor: (u16, u16),
    pub cursor_visible: bool,
    pub fail_next_render: Option<String>,
    pub render_count: usize,
    rendering: bool,
    pub overlapped: bool,
    pub keys: Vec<String>,
    pub wheels: Vec<(WheelDirection, u32)>,
    pub resizes: Vec<(u16, u16)>,
    pub mouse: Vec<String>,
    pub selections: VecDeque<SelectionEvent>,
    pub destroyed: bool,
}

impl MockState {
    pub fn set_line(&mut self, index: usize, text: &str) {
        self.lines[index] = Line::from(Span::plain(text));
    }
}

pub type SharedMock = Arc<Mutex<MockState>>;

pub struct MockRenderer {
    state: SharedMock,
    render_delay: Duration,
}

#[async_trait]
impl Renderer for MockRenderer {
    async fn render_once(&mut self) -> Result<(), RendererError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.rendering {
                state.overlapped = true;
            }
            state.rendering = true;
            if let Some(message) = state.fail_next_render.take() {
                state.rendering = false;
                return Err(RendererError::Render(message));
            }
        }
        if !self.render_delay.is_zero() {
            tokio::time::sleep(self.render_delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.rendering = false;
        state.render_count += 1;
        Ok(())
    }

    fn capture(&self) -> FrameCapture {
        let state = self.state.lock().unwrap();
        FrameCapture {
            cols: state.cols,
            rows: state.rows,
            cursor_col: state.cursor.0,
            cursor_row: state.cursor.1,
            cursor_visible: state.cursor_visible,
            offset: 0,
            lines: state.lines.clone(),
        }
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        let mut state = self.state.lock().unwrap();
        state.cols = cols;
        state.rows = rows;
        state.lines.resize_with(rows as usize, Line::empty);
        state.resizes.push((cols, rows));
    }

    fn press_key(&mut self, key: &str, _modifiers: Modifiers) {
        self.state.lock().unwrap().keys.push(key.to_string());
    }

    fn mouse_down(&mut self, x: u16, y: u16, button: MouseButton) {
        self.state
            .lock()
            .unwrap()
            .mouse
            .push(format!("down {x},{y} {button:?}"));
    }

    fn mouse_up(&mut self, x: u16, y: u16, button: MouseButton) {
        self.state
            .lock()
            .unwrap()
            .mouse
            .push(format!("up {x},{y} {button:?}"));
    }

    fn mouse_move(&mut self, x: u16, y: u16) {
        self.state.lock().unwrap().mouse.push(format!("move {x},{y}"));
    }

    fn wheel(&mut self, _x: u16, _y: u16, direction: WheelDirection, lines: u32) {
        self.state.lock().unwrap().wheels.push((direction, lines));
    }

    fn poll_selection(&mut self) -> Option<SelectionEvent> {
        self.state.lock().unwrap().selections.pop_front()
    }

    fn set_cursor(&mut self, col: u16, row: u16, visible: bool) {
        let mut state = self.state.lock().unwrap();
        state.cursor = (col, row);
        state.cursor_visible = visible;
    }

    fn destroy(&mut self) {
        self.state.lock().unwrap().destroyed = true;
    }
}

pub struct MockFactory {
    state: SharedMock,
    pub render_delay: Duration,
    pub fail_create: bool,
}

impl MockFactory {
    pub fn new() -> (Self, SharedMock) {
        let state: SharedMock = Arc::default();
        (
            Self {
                state: state.clone(),
                render_delay: Duration::ZERO,
                fail_create: false,
            },
            state,
        )
    }
}

#[async_trait]
impl RendererFactory for MockFactory {
    async fn create(&self, cols: u16, rows: u16) -> Result<Box<dyn Renderer>, RendererError> {
        if self.fail_create {
            return Err(RendererError::Create("scripted create failure".into()));
        }
        {
            let mut state = self.state.lock().unwrap();
            state.cols = cols;
            state.rows = rows;
            state.lines = vec![Line::empty(); rows as usize];
            state.cursor = (0, 0);
            state.cursor_visible = true;
        }
        Ok(Box::new(MockRenderer {
            state: self.state.clone(),
            render_delay: self.render_delay,
        }))
    }
}

/// Await the next outbound message, failing the test after a second of
/// (auto-advanced) time.
pub async fn next_message(rx: &mut broadcast::Receiver<ServerMessage>) -> ServerMessage {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("session output closed")
}

/// Assert that nothing arrives within the given window. A closed stream
/// counts as silence.
pub async fn assert_silent(rx: &mut broadcast::Receiver<ServerMessage>, window: Duration) {
    match timeout(window, rx.recv()).await {
        Ok(Ok(message)) => panic!("expected silence, got {message:?}"),
        Ok(Err(_)) | Err(_) => {}
    }
}
