//! CSS rewriter: `url(...)` arguments and `@import` string params.
//!
//! A single bounded pass over the stylesheet text, aware of comments and
//! string literals so `content: "url(x)"` stays untouched. Everything that is
//! not a rewritten token is emitted verbatim, whitespace included. This is
//! intentionally a small hand scanner rather than a CSS parser dependency:
//! the grammar we care about is two token shapes.

use url::Url;

use crate::rewrite::rewrite_in_origin;

/// Values never rewritten in CSS regardless of resolution.
const SKIP_PREFIXES: &[&str] = &["#", "data:"];

/// Rewrite in-origin `url(...)` and `@import "..."` references to mirror
/// paths. Never fails: unparseable stretches are copied through unchanged.
pub fn rewrite_css(css: &str, base_url: &Url, target_origin: &str, slug: &str) -> String {
    let bytes = css.as_bytes();
    let mut out = String::with_capacity(css.len());
    let mut i = 0usize;

    while i < bytes.len() {
        // Comments pass through verbatim.
        if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
            let end = find_subslice(bytes, i + 2, b"*/")
                .map(|p| p + 2)
                .unwrap_or(bytes.len());
            out.push_str(&css[i..end]);
            i = end;
            continue;
        }

        // `@import` may carry a bare string token; rewrite it in place.
        if bytes[i] == b'@' && starts_with_ignore_case(&css[i..], "@import") {
            let after_kw = i + "@import".len();
            let ws_end = skip_whitespace(bytes, after_kw);
            if matches!(bytes.get(ws_end), Some(b'"') | Some(b'\'')) {
                out.push_str(&css[i..ws_end]);
                let (emitted, next) = rewrite_string_token(
                    css,
                    ws_end,
                    base_url,
                    target_origin,
                    slug,
                );
                out.push_str(&emitted);
                i = next;
                continue;
            }
            // `@import url(...)` falls through to the url() arm below.
            out.push_str(&css[i..after_kw]);
            i = after_kw;
            continue;
        }

        // String literals outside @import are opaque.
        if bytes[i] == b'"' || bytes[i] == b'\'' {
            let end = string_end(bytes, i);
            out.push_str(&css[i..end]);
            i = end;
            continue;
        }

        // `url(` must not be the tail of a longer identifier.
        if starts_with_ignore_case(&css[i..], "url(")
            && (i == 0 || !is_ident_char(bytes[i - 1]))
        {
            match rewrite_url_function(css, i, base_url, target_origin, slug) {
                Some((emitted, next)) => {
                    out.push_str(&emitted);
                    i = next;
                    continue;
                }
                // Unterminated function: copy the rest verbatim.
                None => {
                    out.push_str(&css[i..]);
                    break;
                }
            }
        }

        let ch_len = char_len_at(css, i);
        out.push_str(&css[i..i + ch_len]);
        i += ch_len;
    }

    out
}

/// Rewrite one `url(...)` occurrence starting at `start`. Returns the emitted
/// text and the index just past the closing paren, or `None` when the
/// function never closes.
fn rewrite_url_function(
    css: &str,
    start: usize,
    base_url: &Url,
    target_origin: &str,
    slug: &str,
) -> Option<(String, usize)> {
    let bytes = css.as_bytes();
    let open = start + "url(".len();
    let close = find_unescaped_close_paren(bytes, open)?;
    let raw = &css[open..close];
    let trimmed = raw.trim();

    let (quote, inner) = match trimmed.as_bytes().first().copied() {
        Some(q @ (b'"' | b'\'')) if trimmed.len() >= 2 && trimmed.ends_with(q as char) => {
            (Some(q as char), &trimmed[1..trimmed.len() - 1])
        }
        _ => (None, trimmed),
    };

    let emitted = match rewrite_css_value(inner, base_url, target_origin, slug) {
        Some(mirrored) => match quote {
            Some(q) => format!("url({q}{mirrored}{q})"),
            None => format!("url({mirrored})"),
        },
        None => css[start..close + 1].to_string(),
    };
    Some((emitted, close + 1))
}

/// Rewrite the string token at `start` (`"..."` or `'...'`). Returns emitted
/// text and the index just past the closing quote.
fn rewrite_string_token(
    css: &str,
    start: usize,
    base_url: &Url,
    target_origin: &str,
    slug: &str,
) -> (String, usize) {
    let bytes = css.as_bytes();
    let quote = bytes[start] as char;
    let end = string_end(bytes, start);
    // `end` sits just past the closing quote when one exists.
    let closed = end > start + 1 && bytes[end - 1] == quote as u8;
    if !closed {
        return (css[start..end].to_string(), end);
    }
    let inner = &css[start + 1..end - 1];
    match rewrite_css_value(inner, base_url, target_origin, slug) {
        Some(mirrored) => (format!("{quote}{mirrored}{quote}"), end),
        None => (css[start..end].to_string(), end),
    }
}

fn rewrite_css_value(
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

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn skip_whitespace(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

fn char_len_at(s: &str, i: usize) -> usize {
    s[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1)
}

fn find_subslice(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= bytes.len() {
        return None;
    }
    bytes[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| from + p)
}

/// Index of the closing `)` for a url() argument, honoring quotes and
/// backslash escapes inside the argument.
fn find_unescaped_close_paren(bytes: &[u8], mut i: usize) -> Option<usize> {
    let mut in_quote: Option<u8> = None;
    while i < bytes.len() {
        let b = bytes[i];
        match in_quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    in_quote = None;
                }
            }
            None => {
                if b == b'"' || b == b'\'' {
                    in_quote = Some(b);
                } else if b == b')' {
                    return Some(i);
                } else if b == b'\\' {
                    i += 1;
                }
            }
        }
        i += 1;
    }
    None
}

/// Index just past the string literal starting at `start` (or end of input
/// when unterminated).
fn string_end(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == quote {
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rewrite(css: &str) -> String {
        let base = Url::parse("https://example.com/styles/site.css").unwrap();
        rewrite_css(css, &base, "https://example.com", "example-com")
    }

    #[test]
    fn rewrites_unquoted_and_quoted_url_functions() {
        assert_eq!(
            rewrite("body{background:url(/bg.png)}"),
            "body{background:url(/m/example-com/bg.png)}"
        );
        assert_eq!(
            rewrite(r#"body{background:url("/bg.png")}"#),
            r#"body{background:url("/m/example-com/bg.png")}"#
        );
        assert_eq!(
            rewrite("body{background:url('fonts/a.woff2')}"),
            "body{background:url('/m/example-com/styles/fonts/a.woff2')}"
        );
    }

    #[test]
    fn cross_origin_and_data_urls_stay_verbatim() {
        let css = "a{background:url(https://cdn.other.test/x.png)}\
                   b{background:url(data:image/png;base64,AA)}\
                   c{mask:url(#clip)}";
        assert_eq!(rewrite(css), css);
    }

    #[test]
    fn import_string_and_url_forms_rewrite() {
        assert_eq!(
            rewrite(r#"@import "/base.css";"#),
            r#"@import "/m/example-com/base.css";"#
        );
        assert_eq!(
            rewrite("@import url(/base.css) screen;"),
            "@import url(/m/example-com/base.css) screen;"
        );
        assert_eq!(
            rewrite(r#"@import 'theme.css';"#),
            r#"@import '/m/example-com/styles/theme.css';"#
        );
    }

    #[test]
    fn comments_and_plain_strings_are_opaque() {
        let css = r#"/* url(/not-me.png) */ .x{content:"url(/also-not-me.png)"}"#;
        assert_eq!(rewrite(css), css);
    }

    #[test]
    fn identifier_tails_are_not_url_functions() {
        let css = ".x{background:-moz-url(/y.png)}";
        assert_eq!(rewrite(css), css);
    }

    #[test]
    fn whitespace_inside_url_is_tolerated() {
        assert_eq!(
            rewrite("a{background:url(  /bg.png  )}"),
            "a{background:url(/m/example-com/bg.png)}"
        );
    }

    #[test]
    fn case_insensitive_url_keyword() {
        assert_eq!(
            rewrite("a{background:URL(/bg.png)}"),
            "a{background:url(/m/example-com/bg.png)}"
        );
    }

    #[test]
    fn unterminated_url_copies_the_rest_verbatim() {
        let css = "a{background:url(/bg.png";
        assert_eq!(rewrite(css), css);
    }

    #[test]
    fn rewriting_twice_is_a_fixed_point() {
        let css = concat!(
            "@import \"/base.css\";\n",
            "a{background:url(/bg.png)}\n",
            "b{background:url(https://cdn.other.test/x.png)}\n",
            "/* url(/comment.png) */\n"
        );
        let once = rewrite(css);
        let twice = rewrite(&once);
        assert_eq!(once, twice);
    }

    proptest! {
        #[test]
        fn never_panics_on_arbitrary_input(css in any::<String>()) {
            let base = Url::parse("https://example.com/").unwrap();
            let _ = rewrite_css(&css, &base, "https://example.com", "s");
        }
    }
}
