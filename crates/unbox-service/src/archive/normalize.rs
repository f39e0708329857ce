use std::borrow::Cow;

/// Normalizes a path as listed inside an archive.
///
/// Backslashes are treated as separators, empty and `.` segments are dropped and `..` segments
/// are resolved against their parent. A leading `/` and a trailing `/` are kept. `..` segments
/// that would leave a relative path are kept, and an empty result becomes `.`.
///
/// Returns the input unchanged (and without allocating) if it is already normalized.
pub fn normalize_path(path: &str) -> Cow<'_, str> {
    if is_normalized(path) {
        return Cow::Borrowed(path);
    }

    let path = path.replace('\\', "/");
    let absolute = path.starts_with('/');
    let trailing = path.ends_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                // `/..` is just `/`
                _ if absolute => {}
                _ => segments.push(".."),
            },
            segment => segments.push(segment),
        }
    }

    let mut normalized = String::with_capacity(path.len());
    if absolute {
        normalized.push('/');
    }
    normalized.push_str(&segments.join("/"));
    if normalized.is_empty() {
        normalized.push('.');
    }
    if trailing && !normalized.ends_with('/') {
        normalized.push('/');
    }

    Cow::Owned(normalized)
}

fn is_normalized(path: &str) -> bool {
    if path.is_empty() || path.contains('\\') {
        return false;
    }
    let inner = path.strip_prefix('/').unwrap_or(path);
    let inner = inner.strip_suffix('/').unwrap_or(inner);
    if inner.is_empty() {
        return path == "/";
    }

    let mut seen_name = false;
    for segment in inner.split('/') {
        match segment {
            "" | "." => return false,
            ".." if seen_name || path.starts_with('/') => return false,
            ".." => {}
            _ => seen_name = true,
        }
    }
    true
}
