//! Path validation
//!
//! Handles filename validation and security checks. This is the only place the
//! service decides whether a client-supplied name is safe to hand to a backend.

use crate::error::ValidationError;

fn is_separator(c: char) -> bool {
    c == '/' || c == std::path::MAIN_SEPARATOR
}

/// Lexically normalizes a name: collapses repeated separators, drops `.` segments
/// and resolves `..` against preceding segments. Never touches the filesystem.
fn normalize(name: &str) -> String {
    let rooted = name.starts_with(is_separator);
    let mut parts: Vec<&str> = Vec::new();

    for segment in name.split(is_separator) {
        match segment {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if rooted => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }

    let body = parts.join("/");
    if rooted {
        format!("/{body}")
    } else if body.is_empty() {
        ".".to_string()
    } else {
        body
    }
}

/// Returns the last component of a name, ignoring trailing separators.
///
/// Storage backends derive their on-disk path or object key from this, never from the raw name.
pub fn base_name(name: &str) -> &str {
    let trimmed = name.trim_end_matches(is_separator);
    if trimmed.is_empty() {
        return if name.is_empty() { "." } else { "/" };
    }
    match trimmed.rfind(is_separator) {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Validates a client-supplied filename.
///
/// Rejects empty names and any name whose normalized form differs from its base component,
/// which covers parent-directory segments, absolute paths and nested directories.
pub fn validate_filename(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::Empty);
    }

    let base = base_name(name);
    if normalize(name) != base || base == "." || base == ".." || base.contains(is_separator) {
        return Err(ValidationError::Traversal(name.to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        for name in ["a.txt", "b.log", "archive.tar.gz", "no_extension", ".hidden", "./a.txt", "a.txt/"] {
            assert_eq!(validate_filename(name), Ok(()), "{name} should be accepted");
        }
    }

    #[test]
    fn rejects_empty_name() {
        assert_eq!(validate_filename(""), Err(ValidationError::Empty));
    }

    #[test]
    fn rejects_traversal_and_absolute_names() {
        for name in [
            "..",
            ".",
            "/",
            "../secrets/pass.txt",
            "../../etc/passwd",
            "/etc/passwd",
            "dir/../../x",
            "a/b.txt",
            "a/../b.txt",
            "//double",
        ] {
            assert!(
                matches!(validate_filename(name), Err(ValidationError::Traversal(_))),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn base_name_takes_last_component() {
        assert_eq!(base_name("a.txt"), "a.txt");
        assert_eq!(base_name("dir/a.txt"), "a.txt");
        assert_eq!(base_name("../../a.txt"), "a.txt");
        assert_eq!(base_name("a.txt/"), "a.txt");
        assert_eq!(base_name("///"), "/");
        assert_eq!(base_name(""), ".");
    }

    #[test]
    fn normalize_resolves_segments() {
        assert_eq!(normalize("./a.txt"), "a.txt");
        assert_eq!(normalize("a//b/./c"), "a/b/c");
        assert_eq!(normalize("a/../b"), "b");
        assert_eq!(normalize("../a"), "../a");
        assert_eq!(normalize("/../a"), "/a");
        assert_eq!(normalize("a/.."), ".");
    }
}
