use serde::{Deserialize, Serialize};

use super::line::Line;

/// A cell coordinate on the wire. Cursor and selection positions are
/// 1-based; the top-left cell is (1, 1).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellPos {
    pub x: u16,
    pub y: u16,
}

impl CellPos {
    pub fn new(x: u16, y: u16) -> Self {
        Self { x, y }
    }
}

/// The full visible state of a terminal at one instant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameSnapshot {
    pub cols: u16,
    pub rows: u16,
    pub cursor: CellPos,
    pub cursor_visible: bool,
    /// First visible line index; 0 when no scrollback is exposed.
    pub offset: u64,
    pub total_lines: u64,
    pub lines: Vec<Line>,
}

impl FrameSnapshot {
    pub fn new(
        cols: u16,
        rows: u16,
        cursor: CellPos,
        cursor_visible: bool,
        offset: u64,
        lines: Vec<Line>,
    ) -> Self {
        Self {
            cols,
            rows,
            cursor,
            cursor_visible,
            offset,
            total_lines: lines.len() as u64,
            lines,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_lines_tracks_lines() {
        let frame = FrameSnapshot::new(
            80,
            24,
            CellPos::new(1, 1),
            true,
            0,
            vec![Line::empty(); 24],
        );
        assert_eq!(frame.total_lines, 24);
        assert_eq!(frame.lines.len(), 24);
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let frame = FrameSnapshot::new(2, 1, CellPos::new(1, 1), false, 0, vec![Line::empty()]);
        let value = serde_json::to_value(&frame).unwrap();
        assert!(value.get("cursorVisible").is_some());
        assert!(value.get("totalLines").is_some());
        assert_eq!(value["cursor"]["x"], 1);
    }
}
