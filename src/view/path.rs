//! Lexical path helpers. Nothing here touches the namespace.

/// Split a slash-separated path into its non-empty segments.
///
/// ```rust
/// use namespace_md::split_path;
///
/// assert_eq!(split_path("//a/b//c/"), vec!["a", "b", "c"]);
/// assert!(split_path("/").is_empty());
/// ```
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Normalize `.` and `..` segments and repeated slashes.
///
/// The result is always absolute, `..` never climbs above the root, and only
/// the root keeps a trailing slash.
///
/// ```rust
/// use namespace_md::abs_path;
///
/// assert_eq!(abs_path("/a/./b/../c"), "/a/c");
/// assert_eq!(abs_path("/../.."), "/");
/// assert_eq!(abs_path("a//b/"), "/a/b");
/// ```
pub fn abs_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            name => segments.push(name),
        }
    }
    if segments.is_empty() {
        return "/".to_string();
    }
    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in segments {
        normalized.push('/');
        normalized.push_str(segment);
    }
    normalized
}

/// Validate a single entry name.
pub(crate) fn check_name(operation: &'static str, name: &str) -> Result<(), crate::NsError> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name.contains('/') {
        "name contains '/'"
    } else if name == "." || name == ".." {
        "name is reserved"
    } else {
        return Ok(());
    };
    Err(crate::NsError::InvalidArgument {
        operation,
        reason: format!("{reason}: {name:?}"),
    })
}
