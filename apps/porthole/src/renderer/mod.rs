//! The boundary between the session core and the host application's
//! rendering engine. The core interacts with the engine only through
//! [`Renderer`] and [`RendererFactory`]; nothing else about the engine is
//! assumed.

pub mod echo;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::Line;
use crate::protocol::Modifiers;

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("renderer creation failed: {0}")]
    Create(String),
    #[error("render failed: {0}")]
    Render(String),
}

/// What the engine reports for one rendered frame. Cursor coordinates are
/// 0-based here; the session converts to the 1-based wire basis when it
/// emits.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameCapture {
    pub cols: u16,
    pub rows: u16,
    pub cursor_col: u16,
    pub cursor_row: u16,
    pub cursor_visible: bool,
    /// First visible line index, 0 when no scrollback is exposed.
    pub offset: u64,
    pub lines: Vec<Line>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WheelDirection {
    Up,
    Down,
}

/// A selection change reported by the engine, in 0-based cell coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionEvent {
    Changed {
        anchor: (u16, u16),
        focus: (u16, u16),
    },
    Cleared,
}

/// One in-process virtual terminal.
///
/// `render_once` is the only suspension point; every other capability is
/// non-yielding state mutation on the engine.
#[async_trait]
pub trait Renderer: Send {
    async fn render_once(&mut self) -> Result<(), RendererError>;

    fn capture(&self) -> FrameCapture;

    fn resize(&mut self, cols: u16, rows: u16);

    /// Inject a key press. `key` uses the engine's key-code vocabulary
    /// (see [`crate::session::keymap`] for the wire-name mapping).
    fn press_key(&mut self, key: &str, modifiers: Modifiers);

    fn mouse_down(&mut self, x: u16, y: u16, button: MouseButton);

    fn mouse_up(&mut self, x: u16, y: u16, button: MouseButton);

    fn mouse_move(&mut self, x: u16, y: u16);

    fn wheel(&mut self, x: u16, y: u16, direction: WheelDirection, lines: u32);

    /// Drain the next pending selection event, if any. Polled once per
    /// tick after rendering.
    fn poll_selection(&mut self) -> Option<SelectionEvent>;

    fn set_cursor(&mut self, col: u16, row: u16, visible: bool);

    fn destroy(&mut self);
}

/// Creates renderers for new sessions. Creation may suspend (engines load
/// fonts, spawn worker state, etc.); failures propagate to the caller and
/// the session is never recorded.
#[async_trait]
pub trait RendererFactory: Send + Sync {
    async fn create(&self, cols: u16, rows: u16) -> Result<Box<dyn Renderer>, RendererError>;
}
