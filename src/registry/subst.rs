//! `${VAR}` / `${VAR:default}` substitution for configured env and header
//! values, resolved against the broker's own environment once at connection
//! time.

use std::collections::HashMap;

/// Expand `${NAME}` and `${NAME:default}` placeholders in a single value.
///
/// A placeholder whose variable is unset and has no default is left
/// unchanged, so a typo surfaces verbatim in the upstream error instead of
/// silently becoming an empty string.
pub fn expand_placeholders(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let body = &after[..end];
                let (name, default) = match body.split_once(':') {
                    Some((name, default)) => (name, Some(default)),
                    None => (body, None),
                };
                match lookup(name).or_else(|| default.map(str::to_string)) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push_str("${");
                        out.push_str(body);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated placeholder: emit as-is
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Expand a whole value map against the process environment
pub fn expand_env_map(map: &HashMap<String, String>) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| {
            (
                k.clone(),
                expand_placeholders(v, |name| std::env::var(name).ok()),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "TOKEN" => Some("secret".to_string()),
            "EMPTY" => Some(String::new()),
            _ => None,
        }
    }

    #[test]
    fn test_plain_substitution() {
        assert_eq!(expand_placeholders("${TOKEN}", lookup), "secret");
        assert_eq!(
            expand_placeholders("Bearer ${TOKEN}!", lookup),
            "Bearer secret!"
        );
    }

    #[test]
    fn test_default_used_when_unset() {
        assert_eq!(expand_placeholders("${MISSING:fallback}", lookup), "fallback");
        // Set variables win over defaults
        assert_eq!(expand_placeholders("${TOKEN:fallback}", lookup), "secret");
        // An empty value is still a value
        assert_eq!(expand_placeholders("${EMPTY:fallback}", lookup), "");
    }

    #[test]
    fn test_unset_without_default_is_left_verbatim() {
        assert_eq!(expand_placeholders("${MISSING}", lookup), "${MISSING}");
    }

    #[test]
    fn test_multiple_and_literal_text() {
        assert_eq!(
            expand_placeholders("a=${TOKEN} b=${MISSING:x} c", lookup),
            "a=secret b=x c"
        );
        assert_eq!(expand_placeholders("no placeholders", lookup), "no placeholders");
    }

    #[test]
    fn test_unterminated_placeholder() {
        assert_eq!(expand_placeholders("${TOKEN", lookup), "${TOKEN");
    }

    #[test]
    fn test_default_may_contain_colon() {
        assert_eq!(
            expand_placeholders("${MISSING:http://localhost:8080}", lookup),
            "http://localhost:8080"
        );
    }
}
