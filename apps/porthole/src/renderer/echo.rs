//! A minimal line-echo console implementing the renderer façade. It is
//! what `porthole host` serves when no real application is wired in, and
//! it exercises every capability the session core relies on.

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::model::{Line, Span, StyleFlags};
use crate::protocol::Modifiers;

use super::{
    FrameCapture, MouseButton, Renderer, RendererError, RendererFactory, SelectionEvent,
    WheelDirection,
};

const PROMPT: &str = "porthole> ";
const BANNER: &str = "porthole echo console";

pub struct EchoRenderer {
    cols: u16,
    rows: u16,
    history: VecDeque<String>,
    input: String,
    cursor_visible: bool,
    drag_anchor: Option<(u16, u16)>,
    selection: Option<((u16, u16), (u16, u16))>,
    pending_selection: VecDeque<SelectionEvent>,
    scroll_offset: u64,
}

impl EchoRenderer {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            cols,
            rows,
            history: VecDeque::new(),
            input: String::new(),
            cursor_visible: true,
            drag_anchor: None,
            selection: None,
            pending_selection: VecDeque::new(),
            scroll_offset: 0,
        }
    }

    fn visible_history(&self) -> impl Iterator<Item = &String> {
        // One row is reserved for the banner and one for the prompt.
        let capacity = self.rows.saturating_sub(2) as usize;
        let skip = self.history.len().saturating_sub(capacity);
        self.history.iter().skip(skip)
    }

    fn clamp_text(&self, text: &str) -> String {
        text.chars().take(self.cols as usize).collect()
    }

    fn clear_selection(&mut self) {
        if self.selection.take().is_some() {
            self.pending_selection.push_back(SelectionEvent::Cleared);
        }
    }
}

#[async_trait]
impl Renderer for EchoRenderer {
    async fn render_once(&mut self) -> Result<(), RendererError> {
        // State is applied synchronously as input arrives; rendering is
        // just the capture below.
        Ok(())
    }

    fn capture(&self) -> FrameCapture {
        let mut lines = Vec::with_capacity(self.rows as usize);
        lines.push(Line::from(Span::new(
            self.clamp_text(BANNER),
            None,
            None,
            StyleFlags::BOLD,
            BANNER.chars().count().min(self.cols as usize) as u32,
        )));
        for entry in self.visible_history() {
            lines.push(Line::from(Span::plain(self.clamp_text(entry))));
        }
        let prompt_row = lines.len() as u16;
        let prompt = format!("{PROMPT}{}", self.input);
        lines.push(Line::from(Span::plain(self.clamp_text(&prompt))));
        lines.resize_with(self.rows as usize, Line::empty);

        let cursor_col = (PROMPT.chars().count() + self.input.chars().count())
            .min(self.cols.saturating_sub(1) as usize) as u16;
        FrameCapture {
            cols: self.cols,
            rows: self.rows,
            cursor_col,
            cursor_row: prompt_row.min(self.rows.saturating_sub(1)),
            cursor_visible: self.cursor_visible,
            offset: self.scroll_offset,
            lines,
        }
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
    }

    fn press_key(&mut self, key: &str, _modifiers: Modifiers) {
        match key {
            "return" => {
                let entry = std::mem::take(&mut self.input);
                self.history.push_back(format!("{PROMPT}{entry}"));
                if !entry.is_empty() {
                    self.history.push_back(entry);
                }
                while self.history.len() > 512 {
                    self.history.pop_front();
                }
            }
            "backspace" => {
                self.input.pop();
            }
            "escape" => self.input.clear(),
            "tab" => self.input.push_str("    "),
            "up" | "down" | "left" | "right" | "home" | "end" | "pageup" | "pagedown"
            | "insert" | "delete" => {}
            key if key.len() >= 2
                && key.starts_with('f')
                && key[1..].chars().all(|c| c.is_ascii_digit()) => {}
            key => {
                let mut chars = key.chars();
                if let (Some(ch), None) = (chars.next(), chars.next()) {
                    self.input.push(ch);
                }
            }
        }
    }

    fn mouse_down(&mut self, x: u16, y: u16, button: MouseButton) {
        if button == MouseButton::Left {
            self.clear_selection();
            self.drag_anchor = Some((x, y));
        }
    }

    fn mouse_up(&mut self, _x: u16, _y: u16, button: MouseButton) {
        if button == MouseButton::Left {
            self.drag_anchor = None;
        }
    }

    fn mouse_move(&mut self, x: u16, y: u16) {
        if let Some(anchor) = self.drag_anchor {
            let focus = (x, y);
            if self.selection != Some((anchor, focus)) {
                self.selection = Some((anchor, focus));
                self.pending_selection
                    .push_back(SelectionEvent::Changed { anchor, focus });
            }
        }
    }

    fn wheel(&mut self, _x: u16, _y: u16, direction: WheelDirection, lines: u32) {
        match direction {
            WheelDirection::Up => {
                self.scroll_offset = self.scroll_offset.saturating_sub(lines as u64);
            }
            WheelDirection::Down => {
                let max = self.history.len() as u64;
                self.scroll_offset = (self.scroll_offset + lines as u64).min(max);
            }
        }
    }

    fn poll_selection(&mut self) -> Option<SelectionEvent> {
        self.pending_selection.pop_front()
    }

    fn set_cursor(&mut self, _col: u16, _row: u16, visible: bool) {
        self.cursor_visible = visible;
    }

    fn destroy(&mut self) {
        self.history.clear();
        self.input.clear();
    }
}

/// Factory handed to the registry and tunnel client by the CLI.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoRendererFactory;

#[async_trait]
impl RendererFactory for EchoRendererFactory {
    async fn create(&self, cols: u16, rows: u16) -> Result<Box<dyn Renderer>, RendererError> {
        if cols == 0 || rows == 0 {
            return Err(RendererError::Create(format!(
                "cannot build a {cols}x{rows} console"
            )));
        }
        Ok(Box::new(EchoRenderer::new(cols, rows)))
    }
}
