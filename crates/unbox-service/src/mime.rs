//! Content types of files inside archives.
//!
//! Well known extensions are looked up in a fixed table. Everything else, as well as the types
//! for which [`needs_detection`] is true, has to be sniffed from the file contents.

/// Maps familiar file extensions to MIME types, sorted by extension.
const COMMON_FILE_TYPES: &[(&str, &str)] = &[
    ("blb", "application/x-blorb"),
    ("blorb", "application/x-blorb"),
    ("css", "text/css"),
    ("gam", "application/x-tads"),
    ("gblorb", "application/x-blorb;profile=\"glulx\""),
    ("gif", "image/gif"),
    ("glb", "application/x-blorb;profile=\"glulx\""),
    ("htm", "text/html"),
    ("html", "text/html"),
    ("jpeg", "image/jpeg"),
    ("jpg", "image/jpeg"),
    ("js", "application/javascript"),
    ("png", "image/png"),
    ("t3", "application/x-t3vm-image"),
    ("txt", "text/plain"),
    ("ulx", "application/x-glulx"),
    ("z3", "application/x-zmachine"),
    ("z4", "application/x-zmachine"),
    ("z5", "application/x-zmachine"),
    ("z6", "application/x-zmachine"),
    ("z7", "application/x-zmachine"),
    ("z8", "application/x-zmachine"),
    ("zblorb", "application/x-blorb;profile=\"zcode\""),
    ("zlb", "application/x-blorb;profile=\"zcode\""),
];

/// Types that are too vague to be served as they are, most importantly because their charset
/// is unknown.
const TYPES_TO_DETECT: &[&str] = &["application/octet-stream", "text/html", "text/plain"];

/// The extension of the last component of `path`, if it has a non-empty stem.
fn extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
        _ => None,
    }
}

/// Looks up the MIME type of `path` by its extension.
pub fn from_extension(path: &str) -> Option<&'static str> {
    let ext = extension(path)?.to_ascii_lowercase();
    COMMON_FILE_TYPES
        .binary_search_by(|(probe, _)| (*probe).cmp(ext.as_str()))
        .ok()
        .map(|idx| COMMON_FILE_TYPES[idx].1)
}

/// Whether `mime` should be refined by sniffing the file contents.
pub fn needs_detection(mime: &str) -> bool {
    let essence = mime.split(';').next().unwrap_or(mime).trim();
    TYPES_TO_DETECT
        .iter()
        .any(|ty| ty.eq_ignore_ascii_case(essence))
}
