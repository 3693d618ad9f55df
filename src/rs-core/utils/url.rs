use url::Url;

/// Resolve `relative` against `base`, absolute URLs being returned as is.
///
/// Returns `None` when the result is not a valid URL.
pub fn resolve_url(base: &Url, relative: &str) -> Option<Url> {
    base.join(relative.trim()).ok()
}

/// Returns the extension of the last path segment of `url`, lowercased, without its query
/// string or fragment.
pub fn extension(url: &Url) -> Option<String> {
    let filename = url.path_segments()?.last()?;
    let (_, ext) = filename.rsplit_once('.')?;
    if ext.is_empty() {
        None
    } else {
        Some(ext.to_ascii_lowercase())
    }
}
