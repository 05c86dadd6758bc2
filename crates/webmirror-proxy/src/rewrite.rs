//! Shared URL-rewriting logic for the HTML and CSS rewriters.
//!
//! A reference is rewritten only when it resolves (against the final upstream
//! URL) to the mirror's registered origin; everything else is left verbatim.
//! Rewritten references keep only path + query, so fragments and the upstream
//! authority never leak into mirror paths.

use url::Url;
use webmirror_core::origin_of;

/// `/m/<url-encoded-slug>` — the prefix every rewritten reference starts with.
pub fn mirror_prefix(slug: &str) -> String {
    format!("/m/{}", urlencoding::encode(slug))
}

/// Mirror path for a resolved in-origin URL: prefix + path (omitted when `/`)
/// + query.
pub fn mirror_path(slug: &str, resolved: &Url) -> String {
    let mut out = mirror_prefix(slug);
    if resolved.path() != "/" {
        out.push_str(resolved.path());
    }
    if let Some(q) = resolved.query() {
        out.push('?');
        out.push_str(q);
    }
    out
}

/// True when `value` already points under this mirror's prefix. Rewriting is
/// a fixed point because such values are skipped.
pub fn is_already_mirrored(value: &str, slug: &str) -> bool {
    let prefix = mirror_prefix(slug);
    match value.strip_prefix(&prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with(['/', '?', '#']),
        None => false,
    }
}

/// Resolve `value` against `base_url`; if the result lands exactly on
/// `target_origin`, return its mirror path. `None` means "leave verbatim".
pub fn rewrite_in_origin(
    value: &str,
    base_url: &Url,
    target_origin: &str,
    slug: &str,
) -> Option<String> {
    if is_already_mirrored(value, slug) {
        return None;
    }
    let resolved = base_url.join(value).ok()?;
    if origin_of(&resolved) != target_origin {
        return None;
    }
    Some(mirror_path(slug, &resolved))
}
