//! Cache key normalization.

use url::Url;

/// Key under which the entry document is stored, whatever query it was requested with.
pub const ROOT_KEY: &str = "/";

/// Paths that all name the entry document.
const ENTRY_PATHS: &[&str] = &["/", "/index.html"];

/// Stable lookup key for an (already rewritten) request target.
///
/// Entry-point requests on the local `origin` collapse to [`ROOT_KEY`] so
/// cache-busting or session query parameters don't fragment the shell
/// document. Everything else, including another site's root, is keyed by the
/// full URL, query included.
pub fn cache_key(target: &Url, origin: &Url) -> String {
  if target.origin() == origin.origin() && ENTRY_PATHS.contains(&target.path()) {
    ROOT_KEY.to_string()
  } else {
    target.as_str().to_string()
  }
}
