//! Translation from the wire's logical key names (browser
//! `KeyboardEvent.key` vocabulary) to the renderer façade's key codes.

/// Map a logical wire key name to the renderer vocabulary. Names outside
/// the table pass through unchanged and are treated as single-character
/// keys by the engine.
pub fn map_key(key: &str) -> &str {
    match key {
        "ArrowUp" => "up",
        "ArrowDown" => "down",
        "ArrowLeft" => "left",
        "ArrowRight" => "right",
        "Enter" => "return",
        "Backspace" => "backspace",
        "Tab" => "tab",
        "Escape" => "escape",
        "Delete" => "delete",
        "Home" => "home",
        "End" => "end",
        "PageUp" => "pageup",
        "PageDown" => "pagedown",
        "Insert" => "insert",
        "F1" => "f1",
        "F2" => "f2",
        "F3" => "f3",
        "F4" => "f4",
        "F5" => "f5",
        "F6" => "f6",
        "F7" => "f7",
        "F8" => "f8",
        "F9" => "f9",
        "F10" => "f10",
        "F11" => "f11",
        "F12" => "f12",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_keys_map_to_renderer_codes() {
        assert_eq!(map_key("ArrowUp"), "up");
        assert_eq!(map_key("Enter"), "return");
        assert_eq!(map_key("PageDown"), "pagedown");
        assert_eq!(map_key("F12"), "f12");
    }

    #[test]
    fn characters_pass_through() {
        assert_eq!(map_key("a"), "a");
        assert_eq!(map_key("ß"), "ß");
        assert_eq!(map_key("ArrowSideways"), "ArrowSideways");
    }
}
