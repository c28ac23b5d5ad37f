//! Small helpers shared across modules.

use std::borrow::Cow;
use std::path::Path;

/// Expand a leading `~` to `$HOME`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/foo"` → `"/home/user/foo"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            if path == "~" {
                return Cow::Owned(home);
            }
            return Cow::Owned(format!("{}{}", home, &path[1..]));
        }
    }
    Cow::Borrowed(path)
}

/// Make an identifier safe for use inside a file name.
///
/// Anything outside `[A-Za-z0-9._-]` becomes `_`. Returns `None` for an
/// identifier that is empty or consists only of dots.
pub fn file_safe(identifier: &str) -> Option<String> {
    let cleaned: String = identifier
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        None
    } else {
        Some(cleaned)
    }
}

/// Last `n` lines of `text`, joined with `\n`.
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Read the last `n` lines of a file, or an empty string if it is unreadable.
pub async fn tail_file(path: &Path, n: usize) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => tail_lines(&String::from_utf8_lossy(&bytes), n),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_safe() {
        assert_eq!(file_safe("work1").as_deref(), Some("work1"));
        assert_eq!(file_safe("my vpn/2").as_deref(), Some("my_vpn_2"));
        assert_eq!(file_safe(" .. "), None);
        assert_eq!(file_safe(""), None);
    }

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail_lines("a", 5), "a");
        assert_eq!(tail_lines("", 3), "");
    }

    #[test]
    fn test_expand_tilde_passthrough() {
        assert_eq!(expand_tilde("/etc/holocron"), "/etc/holocron");
        assert_eq!(expand_tilde("x~/y"), "x~/y");
    }
}
