//! Property tests for the line differ: the round-trip law, the
//! empty-diff characterization, and minimality of the change set.

use porthole_protocol::model::{apply, diff, Line, Span, StyleFlags};
use proptest::prelude::*;

fn span_strategy() -> impl Strategy<Value = Span> {
    (
        "[a-z ]{0,6}",
        proptest::option::of("#[0-9a-f]{6}"),
        proptest::option::of("#[0-9a-f]{6}"),
        0u8..64,
    )
        .prop_map(|(text, fg, bg, flags)| {
            let width = text.chars().count() as u32;
            Span {
                text,
                fg,
                bg,
                flags: StyleFlags(flags),
                width,
            }
        })
}

fn line_strategy() -> impl Strategy<Value = Line> {
    proptest::collection::vec(span_strategy(), 0..4).prop_map(Line::new)
}

fn lines_strategy(max: usize) -> impl Strategy<Value = Vec<Line>> {
    proptest::collection::vec(line_strategy(), 0..max)
}

/// Frames are fixed-length per terminal size, so missing trailing lines
/// are indistinguishable from empty ones.
fn trim_trailing_empty(lines: &[Line]) -> &[Line] {
    let mut len = lines.len();
    while len > 0 && lines[len - 1].is_empty() {
        len -= 1;
    }
    &lines[..len]
}

proptest! {
    #[test]
    fn round_trip_restores_next(prev in lines_strategy(12), next in lines_strategy(12)) {
        prop_assume!(next.len() >= prev.len());
        prop_assert_eq!(apply(&prev, &diff(&prev, &next)), next);
    }

    #[test]
    fn round_trip_modulo_trailing_blanks(prev in lines_strategy(12), next in lines_strategy(12)) {
        let applied = apply(&prev, &diff(&prev, &next));
        prop_assert_eq!(trim_trailing_empty(&applied), trim_trailing_empty(&next));
    }

    #[test]
    fn empty_diff_iff_equal(a in lines_strategy(8), b in lines_strategy(8)) {
        let equal = trim_trailing_empty(&a) == trim_trailing_empty(&b);
        prop_assert_eq!(diff(&a, &b).is_empty(), equal);
    }

    #[test]
    fn self_diff_is_empty(a in lines_strategy(10)) {
        prop_assert!(diff(&a, &a).is_empty());
    }

    #[test]
    fn changes_are_ascending_and_minimal(prev in lines_strategy(10), next in lines_strategy(10)) {
        let changes = diff(&prev, &next);
        let empty = Line::empty();
        let mut last_index = None;
        for change in &changes {
            if let Some(last) = last_index {
                prop_assert!(change.index > last);
            }
            last_index = Some(change.index);
            let index = change.index as usize;
            let before = prev.get(index).unwrap_or(&empty);
            let after = next.get(index).unwrap_or(&empty);
            prop_assert_ne!(before, after);
            prop_assert_eq!(&change.line, after);
        }
    }
}
