use serde::{Deserialize, Serialize};

/// Bitfield of visual attributes carried by a span.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StyleFlags(pub u8);

impl StyleFlags {
    pub const NONE: Self = Self(0);
    pub const BOLD: Self = Self(1);
    pub const ITALIC: Self = Self(2);
    pub const UNDERLINE: Self = Self(4);
    pub const STRIKETHROUGH: Self = Self(8);
    pub const INVERSE: Self = Self(16);
    pub const FAINT: Self = Self(32);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn is_plain(self) -> bool {
        self.0 == 0
    }
}

/// A run of characters sharing visual attributes.
///
/// `width` is the displayed width in cells and may exceed the character
/// count when the run contains wide glyphs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub text: String,
    pub fg: Option<String>,
    pub bg: Option<String>,
    pub flags: StyleFlags,
    pub width: u32,
}

impl Span {
    pub fn new(
        text: impl Into<String>,
        fg: Option<String>,
        bg: Option<String>,
        flags: StyleFlags,
        width: u32,
    ) -> Self {
        Self {
            text: text.into(),
            fg,
            bg,
            flags,
            width,
        }
    }

    /// An unstyled span whose width equals its character count.
    pub fn plain(text: impl Into<String>) -> Self {
        let text = text.into();
        let width = text.chars().count() as u32;
        Self {
            text,
            fg: None,
            bg: None,
            flags: StyleFlags::NONE,
            width,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_compose() {
        let flags = StyleFlags::BOLD.with(StyleFlags::UNDERLINE);
        assert!(flags.contains(StyleFlags::BOLD));
        assert!(flags.contains(StyleFlags::UNDERLINE));
        assert!(!flags.contains(StyleFlags::ITALIC));
        assert_eq!(flags.0, 5);
    }

    #[test]
    fn plain_span_width_matches_chars() {
        let span = Span::plain("hello");
        assert_eq!(span.width, 5);
        assert!(span.flags.is_plain());
        assert_eq!(span.fg, None);
    }

    #[test]
    fn span_serializes_absent_colors_as_null() {
        let json = serde_json::to_string(&Span::plain("hi")).unwrap();
        assert_eq!(
            json,
            r#"{"text":"hi","fg":null,"bg":null,"flags":0,"width":2}"#
        );
    }
}
