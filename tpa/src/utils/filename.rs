//! Output file naming.
//!
//! Titles come from release names and lookup services, so they can carry
//! characters no filesystem accepts. Names produced here are valid on
//! Windows, Linux and macOS; non-ASCII letters are kept as they are.

/// Characters rejected by at least one supported filesystem.
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Device names Windows refuses as file stems.
const RESERVED_STEMS: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Fallback used when nothing usable is left of a title.
const FALLBACK_NAME: &str = "untitled";

/// Longest stem we produce, in characters. Leaves room for an extension.
const MAX_STEM_CHARS: usize = 200;

/// Turn a display title into a portable file stem.
///
/// Invalid and control characters become `_` (runs collapse to one), runs of
/// whitespace collapse to one space, leading/trailing dots and spaces are
/// trimmed and Windows device names get a `_` prefix.
///
/// ```
/// use tpa::utils::filename::sanitize_filename;
///
/// assert_eq!(sanitize_filename("Who? What: When"), "Who_ What_ When");
/// assert_eq!(sanitize_filename("  "), "untitled");
/// assert_eq!(sanitize_filename("nul"), "_nul");
/// ```
pub fn sanitize_filename(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut prev: Option<char> = None;

    for c in title.chars() {
        let mapped = if c.is_whitespace() {
            ' '
        } else if c.is_control() || INVALID_CHARS.contains(&c) {
            '_'
        } else {
            c
        };

        if (mapped == '_' || mapped == ' ') && prev == Some(mapped) {
            continue;
        }
        out.push(mapped);
        prev = Some(mapped);
    }

    let trimmed: String = out
        .trim_matches(|c| c == ' ' || c == '.')
        .chars()
        .take(MAX_STEM_CHARS)
        .collect();
    let trimmed = trimmed.trim_end_matches(|c| c == ' ' || c == '.');

    if trimmed.is_empty() {
        return FALLBACK_NAME.to_string();
    }

    let stem_upper = trimmed
        .split('.')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    if RESERVED_STEMS.contains(&stem_upper.as_str()) {
        return format!("_{}", trimmed);
    }

    trimmed.to_string()
}

/// Sanitized `title` joined with `extension` (given without the dot).
pub fn output_file_name(title: &str, extension: &str) -> String {
    let extension = extension.trim_start_matches('.');
    if extension.is_empty() {
        sanitize_filename(title)
    } else {
        format!("{}.{}", sanitize_filename(title), extension)
    }
}
