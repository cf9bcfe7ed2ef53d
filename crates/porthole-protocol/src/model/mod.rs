pub mod diff;
pub mod frame;
pub mod line;
pub mod span;

pub use diff::{apply, diff, LineDiff};
pub use frame::{CellPos, FrameSnapshot};
pub use line::Line;
pub use span::{Span, StyleFlags};
