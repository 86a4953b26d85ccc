//! Parsing of the `X-Matrix` authorization header.
//!
//! ```text
//! Authorization: X-Matrix origin="a.example",destination="b.example",key="ed25519:1",sig="..."
//! ```

use hyper::HeaderMap;
use hyper::header::AUTHORIZATION;

/// Authorization scheme carrying federation claims. Matched case-insensitively.
pub const X_MATRIX_SCHEME: &str = "X-Matrix";

/// Value of parameter `name` from the first `X-Matrix` authorization header.
///
/// Parameter names match case-insensitively. Returns `None` when no header
/// uses the scheme or the parameter is absent.
pub fn x_matrix_param(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(AUTHORIZATION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| {
            let value = value.trim_start();
            let (scheme, params) = value.split_once(char::is_whitespace)?;
            scheme
                .eq_ignore_ascii_case(X_MATRIX_SCHEME)
                .then_some(params)
        })
        .next()
        .and_then(|params| {
            parse_params(params)
                .into_iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
}

/// Normalize a claimed server name for allow-list lookup.
///
/// Strips surrounding whitespace and quotes and an `http://`/`https://`
/// prefix. Case is preserved.
pub fn clean_domain(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches(|c| c == '"' || c == '\'');
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    without_scheme.trim().to_string()
}

/// Split `k1="v1", k2=v2` into pairs. Quoted values may contain commas and
/// backslash escapes; parameters without `=` are skipped.
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace() || *c == ',').is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut name = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && *c != ',') {
            name.push(c);
        }
        if chars.next_if_eq(&'=').is_none() {
            continue;
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'"').is_some() {
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    c => value.push(c),
                }
            }
            while chars.next_if(|c| *c != ',').is_some() {}
        } else {
            while let Some(c) = chars.next_if(|c| *c != ',') {
                value.push(c);
            }
            value = value.trim_end().to_string();
        }

        let name = name.trim();
        if !name.is_empty() {
            params.push((name.to_string(), value));
        }
    }

    params
}
