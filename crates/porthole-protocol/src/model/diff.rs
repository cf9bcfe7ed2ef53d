use serde::{Deserialize, Serialize};

use super::line::Line;

/// A replacement for one line, applied over the most recently
/// transmitted full snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineDiff {
    pub index: u64,
    pub line: Line,
}

impl LineDiff {
    pub fn new(index: u64, line: Line) -> Self {
        Self { index, line }
    }
}

/// Compute the set of lines that changed between two frames.
///
/// For every index in `[0, max(prev.len(), next.len()))` a record is
/// emitted iff the lines are structurally unequal; indices past the end
/// of `next` diff against the empty line. Output is ordered ascending.
pub fn diff(prev: &[Line], next: &[Line]) -> Vec<LineDiff> {
    let len = prev.len().max(next.len());
    let empty = Line::empty();
    let mut changes = Vec::new();
    for index in 0..len {
        let before = prev.get(index).unwrap_or(&empty);
        let after = next.get(index).unwrap_or(&empty);
        if before != after {
            changes.push(LineDiff::new(index as u64, after.clone()));
        }
    }
    changes
}

/// Apply a diff over `base`, replacing changed indices and extending
/// with empty lines when a change lands past the end.
pub fn apply(base: &[Line], changes: &[LineDiff]) -> Vec<Line> {
    let mut lines = base.to_vec();
    for change in changes {
        let index = change.index as usize;
        if index >= lines.len() {
            lines.resize_with(index + 1, Line::empty);
        }
        lines[index] = change.line.clone();
    }
    lines
}
