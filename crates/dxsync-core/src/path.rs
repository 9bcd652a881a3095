//! Logical path validation and normalization.

use crate::error::SyncError;

const INVALID_CHARS: [char; 7] = ['<', '>', ':', '"', '|', '?', '*'];

/// Validate a logical artifact path. Paths are `/`-separated, may not
/// escape the working tree, and may not smuggle URLs or characters that
/// are unrepresentable on common filesystems.
pub fn validate_path(path: &str) -> Result<(), SyncError> {
    let reject = |reason| {
        Err(SyncError::InvalidPath {
            path: path.to_string(),
            reason,
        })
    };

    if path.is_empty() {
        return reject("path is empty");
    }
    if path.chars().any(char::is_control) {
        return reject("path contains control characters");
    }
    let lower = path.to_ascii_lowercase();
    if lower.contains("http:") || lower.contains("https:") {
        return reject("path contains a URL scheme");
    }
    if path
        .split(['/', '\\'])
        .any(|segment| segment == "..")
    {
        return reject("path contains parent-directory segments");
    }
    if path.chars().any(|c| INVALID_CHARS.contains(&c)) {
        return reject("path contains characters invalid on some platforms");
    }
    Ok(())
}

/// Normalize separators and root the path at `/`.
pub fn normalize_path(path: &str) -> String {
    let forward = path.replace('\\', "/");
    if forward.starts_with('/') {
        forward
    } else {
        format!("/{forward}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_paths() {
        validate_path("/images/banner.png").unwrap();
        validate_path("dxdam/ab/cd/photo.jpg").unwrap();
        validate_path("/a b/c-d_e.txt").unwrap();
    }

    #[test]
    fn rejects_empty_and_control_characters() {
        assert!(validate_path("").is_err());
        assert!(validate_path("/a\u{0007}b").is_err());
        assert!(validate_path("/a\nb").is_err());
    }

    #[test]
    fn rejects_url_schemes_case_insensitively() {
        assert!(validate_path("http://host/x").is_err());
        assert!(validate_path("/x/HTTPS://host").is_err());
    }

    #[test]
    fn rejects_parent_traversal_segments() {
        assert!(validate_path("/a/../b").is_err());
        assert!(validate_path("..\\secrets").is_err());
        // Dots inside a name are fine.
        validate_path("/a..b/c.txt").unwrap();
    }

    #[test]
    fn rejects_platform_invalid_characters() {
        for bad in ["/a<b", "/a>b", "/a:b", "/a\"b", "/a|b", "/a?b", "/a*b"] {
            assert!(validate_path(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn normalization_roots_and_flips_separators() {
        assert_eq!(normalize_path("images\\logo.svg"), "/images/logo.svg");
        assert_eq!(normalize_path("/already/rooted"), "/already/rooted");
    }
}
