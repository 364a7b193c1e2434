//! Strips terminal escape sequences from server console output.

use std::sync::LazyLock;

use regex::Regex;

static ANSI_ESCAPE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \x1b\[[0-9;?]*[\x20-\x2f]*[\x40-\x7e]  # CSI sequences (colors, cursor movement)
        | \x1b\][^\x07\x1b]*(?:\x07|\x1b\\)  # OSC sequences (titles, hyperlinks)
        | \x1b[\x40-\x5a\x5c-\x5f]            # two-byte escapes
        ",
    )
    .expect("ANSI regex pattern is valid")
});

/// Removes every recognized escape sequence. Idempotent.
pub fn strip_ansi(input: &str) -> String {
    let mut out = ANSI_ESCAPE_PATTERN.replace_all(input, "").into_owned();
    // Removing one sequence can splice the bytes around it into a new one.
    while ANSI_ESCAPE_PATTERN.is_match(&out) {
        out = ANSI_ESCAPE_PATTERN.replace_all(&out, "").into_owned();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_codes() {
        assert_eq!(strip_ansi("\x1B[32mHello\x1B[0m"), "Hello");
    }

    #[test]
    fn strips_256_color_and_bold() {
        let input = "\x1b[1m\x1b[38;5;12m[Server thread/INFO]\x1b[0m: Done (3.2s)!";
        assert_eq!(strip_ansi(input), "[Server thread/INFO]: Done (3.2s)!");
    }

    #[test]
    fn strips_cursor_and_erase_sequences() {
        assert_eq!(strip_ansi("\x1b[2K\x1b[1G> list"), "> list");
    }

    #[test]
    fn strips_osc_title() {
        assert_eq!(strip_ansi("\x1b]0;server console\x07ready"), "ready");
    }

    #[test]
    fn stripping_is_idempotent() {
        let once = strip_ansi("\x1b[31mred\x1b[0m and \x1b[4mplain\x1b[24m");
        assert_eq!(strip_ansi(&once), once);
        assert_eq!(once, "red and plain");
    }

    #[test]
    fn spliced_sequences_are_removed_too() {
        let input = "\x1b\x1b[0m[31mwarn";
        assert_eq!(strip_ansi(input), "warn");
    }

    #[test]
    fn plain_text_is_untouched() {
        let input = "[12:00:01] [Server thread/INFO]: Starting minecraft server version 1.21";
        assert_eq!(strip_ansi(input), input);
    }
}
