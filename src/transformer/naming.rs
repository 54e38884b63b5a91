// Display names for resource transformers

const PACKAGE_DIR: &str = "/node_modules/";

/// Assumed package name of the transformer at `path`
///
/// The path is canonicalized (`\` becomes `/`). If it lies under a
/// `node_modules` directory, the first segment after the last one is the
/// package name, or the first two for a scoped `@scope/name` package.
/// Otherwise the whole canonical path is the name.
///
/// ```
/// use hooktime::transformer::display_name;
///
/// assert_eq!(display_name("/a/b/c"), "/a/b/c");
/// assert_eq!(display_name(r"\a\b\c"), "/a/b/c");
/// assert_eq!(display_name("/a/node_modules/b/c"), "b");
/// assert_eq!(display_name("/a/node_modules/@b/c/d"), "@b/c");
/// ```
pub fn display_name(path: &str) -> String {
    let canonical = path.replace('\\', "/");
    let Some(index) = canonical.rfind(PACKAGE_DIR) else {
        return canonical;
    };
    let rest = &canonical[index + PACKAGE_DIR.len()..];
    let mut segments = rest.split('/');
    let first = segments.next().unwrap_or_default();
    if !first.starts_with('@') {
        return first.to_string();
    }
    match segments.next() {
        Some(second) if !second.is_empty() => format!("{first}/{second}"),
        _ => canonical,
    }
}
