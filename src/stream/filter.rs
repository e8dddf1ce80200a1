//! Filtergraph escaping for paths embedded in `-vf`
//!
//! ffmpeg splits filter chains on `,`, options on `:` and treats quotes,
//! brackets and whitespace specially, so a subtitle path must be escaped
//! before it becomes part of `subtitles=<path>`.

use std::path::Path;

/// Characters that need a backslash inside a filter argument
const SPECIAL: &[char] = &['\\', ':', ',', '\'', '[', ']', '(', ')', ' '];

/// Backslash-escape every filtergraph special character
pub fn escape_filter_path(path: &str) -> String {
    let mut escaped = String::with_capacity(path.len() + 8);
    for c in path.chars() {
        if SPECIAL.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Inverse of [`escape_filter_path`]
pub fn unescape_filter_path(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Burn-in filter for a subtitle file
pub fn subtitle_filter(path: &Path) -> String {
    format!("subtitles={}", escape_filter_path(&path.to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_path_untouched() {
        assert_eq!(escape_filter_path("/home/me/subs.srt"), "/home/me/subs.srt");
    }

    #[test]
    fn test_escapes_every_special_character() {
        assert_eq!(
            escape_filter_path(r"C:\My Subs\it's [x],(y).srt"),
            r"C\:\\My\ Subs\\it\'s\ \[x\]\,\(y\).srt"
        );
    }

    #[test]
    fn test_subtitle_filter_prefix() {
        let filter = subtitle_filter(Path::new("/media/Movie (2020)/en.srt"));
        assert_eq!(filter, r"subtitles=/media/Movie\ \(2020\)/en.srt");
    }

    #[test]
    fn test_trailing_backslash_kept() {
        assert_eq!(unescape_filter_path("abc\\"), "abc\\");
    }
}
