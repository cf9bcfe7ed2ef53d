use serde::{Deserialize, Serialize};

use crate::model::{CellPos, FrameSnapshot, LineDiff};

fn is_false(value: &bool) -> bool {
    !*value
}

/// Keyboard modifier state. Absent means false on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modifiers {
    #[serde(default, skip_serializing_if = "is_false")]
    pub shift: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub ctrl: bool,
    /// Browser Alt/Option.
    #[serde(default, skip_serializing_if = "is_false")]
    pub meta: bool,
    /// Browser Cmd/Win.
    #[serde(rename = "super", default, skip_serializing_if = "is_false")]
    pub super_key: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub hyper: bool,
}

impl Modifiers {
    pub const NONE: Self = Self {
        shift: false,
        ctrl: false,
        meta: false,
        super_key: false,
        hyper: false,
    };

    pub fn shift() -> Self {
        Self {
            shift: true,
            ..Self::NONE
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseAction {
    Down,
    Up,
    Move,
    /// Legacy wheel form; direction is carried in `button` (4 = up, 5 = down).
    Scroll,
}

/// Messages flowing from a viewer to the session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Key {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        modifiers: Option<Modifiers>,
    },
    Mouse {
        action: MouseAction,
        x: u16,
        y: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        button: Option<u8>,
    },
    /// Explicit wheel form. Positive `lines` scrolls downward; senders
    /// batch sub-line wheel deltas so receivers only see whole lines.
    Scroll { x: u16, y: u16, lines: i32 },
    Resize { cols: u16, rows: u16 },
    Ping,
}

/// Messages flowing from the session to its viewers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Full redraw; resets the viewer's line state.
    Full { data: FrameSnapshot },
    /// Only the lines that changed since the last transmission.
    Diff { changes: Vec<LineDiff> },
    Cursor { x: u16, y: u16, visible: bool },
    Selection { anchor: CellPos, focus: CellPos },
    SelectionClear,
    Pong,
    Error { message: String },
}
