use serde::{Deserialize, Serialize};

use super::span::Span;

/// One terminal row as an ordered run of styled spans.
///
/// Equality is structural: same span count and pairwise equality on text,
/// colors, flags, and width. A row with no spans is the empty line.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub spans: Vec<Span>,
}

impl Line {
    pub fn new(spans: Vec<Span>) -> Self {
        Self { spans }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Total displayed width of the row in cells.
    pub fn width(&self) -> u32 {
        self.spans.iter().map(|span| span.width).sum()
    }
}

impl From<Span> for Line {
    fn from(span: Span) -> Self {
        Self { spans: vec![span] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StyleFlags;

    #[test]
    fn width_sums_spans() {
        let line = Line::new(vec![Span::plain("ab"), Span::plain("cde")]);
        assert_eq!(line.width(), 5);
    }

    #[test]
    fn equality_is_structural() {
        let a = Line::new(vec![Span::plain("x")]);
        let b = Line::new(vec![Span::plain("x")]);
        assert_eq!(a, b);
        let c = Line::new(vec![Span::new("x", None, None, StyleFlags::BOLD, 1)]);
        assert_ne!(a, c);
    }
}
