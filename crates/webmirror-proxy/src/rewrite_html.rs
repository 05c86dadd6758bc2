//! HTML rewriter: keeps mirrored navigation under `/m/<slug>/…`.
//!
//! Streaming rewrite via `lol_html`. A streaming rewriter cannot look ahead,
//! so the robots-meta decision comes from a cheap DOM pre-scan; bodies here
//! are already bounded by the size guard, so parsing twice is fine.

use lol_html::html_content::ContentType;
use lol_html::{element, HtmlRewriter, Settings};
use url::Url;
use webmirror_core::{Error, Result};

use crate::rewrite::rewrite_in_origin;

const ROBOTS_META: &str = r#"<meta name="robots" content="noindex,nofollow">"#;

/// Attribute set subject to rewriting, per tag.
const REWRITE_ATTRS: &[(&str, &[&str])] = &[
    ("a", &["href"]),
    ("link", &["href"]),
    ("script", &["src"]),
    ("img", &["src", "srcset"]),
    ("source", &["src", "srcset"]),
    ("video", &["src", "poster"]),
    ("audio", &["src"]),
    ("iframe", &["src"]),
    ("form", &["action"]),
];

/// Values never rewritten regardless of resolution.
const SKIP_PREFIXES: &[&str] = &["#", "data:", "mailto:", "tel:", "javascript:"];

/// Rewrite every in-origin reference in `html` to its mirror path, drop
/// `<base>` elements, and ensure `<head>` carries a robots meta.
pub fn rewrite_html(html: &str, base_url: &Url, target_origin: &str, slug: &str) -> Result<String> {
    let needs_robots_meta = !has_robots_meta(html);
    let mut output = Vec::with_capacity(html.len() + ROBOTS_META.len());

    let mut handlers = vec![element!("base", |el| {
        el.remove();
        Ok(())
    })];
    if needs_robots_meta {
        handlers.push(element!("head", |el| {
            el.prepend(ROBOTS_META, ContentType::Html);
            Ok(())
        }));
    }
    for (tag, attrs) in REWRITE_ATTRS {
        let base_url = base_url.clone();
        let target_origin = target_origin.to_string();
        let slug = slug.to_string();
        handlers.push(element!(*tag, move |el| {
            for &attr in *attrs {
                let Some(value) = el.get_attribute(attr) else {
                    continue;
                };
                let rewritten = if attr == "srcset" {
                    rewrite_srcset(&value, &base_url, &target_origin, &slug)
                } else {
                    rewrite_attr_value(&value, &base_url, &target_origin, &slug)
                };
                if let Some(new_value) = rewritten {
                    el.set_attribute(attr, &new_value)?;
                }
            }
            Ok(())
        }));
    }

    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: handlers,
            ..Settings::default()
        },
        |c: &[u8]| output.extend_from_slice(c),
    );
    rewriter
        .write(html.as_bytes())
        .map_err(|e| Error::Upstream(format!("html rewrite: {e}")))?;
    rewriter
        .end()
        .map_err(|e| Error::Upstream(format!("html rewrite: {e}")))?;

    Ok(String::from_utf8_lossy(&output).into_owned())
}

fn rewrite_attr_value(
    value: &str,
    base_url: &Url,
    target_origin: &str,
    slug: &str,
) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    if SKIP_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return None;
    }
    rewrite_in_origin(trimmed, base_url, target_origin, slug)
}

/// Rewrite the URL half of each srcset candidate. Commas split candidates
/// only outside parentheses (data URLs and future syntax carry commas).
fn rewrite_srcset(value: &str, base_url: &Url, target_origin: &str, slug: &str) -> Option<String> {
    let mut segments: Vec<String> = Vec::new();
    let mut changed = false;
    for segment in split_outside_parens(value, ',') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let (candidate_url, descriptor) = match segment.split_once(char::is_whitespace) {
            Some((u, d)) => (u, Some(d.trim())),
            None => (segment, None),
        };
        let rewritten = rewrite_attr_value(candidate_url, base_url, target_origin, slug);
        if rewritten.is_some() {
            changed = true;
        }
        let out_url = rewritten.unwrap_or_else(|| candidate_url.to_string());
        match descriptor {
            Some(d) if !d.is_empty() => segments.push(format!("{out_url} {d}")),
            _ => segments.push(out_url),
        }
    }
    if changed {
        Some(segments.join(", "))
    } else {
        None
    }
}

fn split_outside_parens(s: &str, sep: char) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            c if c == sep && depth == 0 => {
                out.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

/// Does `<head>` already carry a `<meta name="robots">`?
fn has_robots_meta(html: &str) -> bool {
    let doc = html_scraper::Html::parse_document(html);
    let sel = match html_scraper::Selector::parse("head meta[name]") {
        Ok(s) => s,
        Err(_) => return false,
    };
    doc.select(&sel)
        .any(|el| el.value().attr("name").is_some_and(|n| n.eq_ignore_ascii_case("robots")))
}
