//! `{{key}}` and `{{key:default}}` substitution.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use routeflow_core::PropertiesResolver;

use crate::error::{CompileError, CompileResult};

static PLACEHOLDER: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"\{\{([^}:]+)(?::([^}]*))?\}\}"));

/// Returns `input` with every placeholder replaced by its resolved value,
/// or its default when the resolver has none. The input is never modified.
///
/// # Errors
///
/// Returns [`CompileError::UnresolvedPlaceholder`] for the first
/// placeholder with neither a value nor a default.
pub fn resolve_placeholders(input: &str, resolver: &dyn PropertiesResolver) -> CompileResult<String> {
    if !input.contains("{{") {
        return Ok(input.to_string());
    }
    let pattern = PLACEHOLDER
        .as_ref()
        .map_err(|err| CompileError::invalid("placeholder", err.to_string()))?;

    let mut missing = None;
    let resolved = pattern.replace_all(input, |caps: &Captures<'_>| {
        let key = caps[1].trim();
        match resolver.resolve(key) {
            Some(value) => value,
            None => match caps.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing.get_or_insert_with(|| key.to_string());
                    String::new()
                }
            },
        }
    });
    match missing {
        Some(key) => Err(CompileError::UnresolvedPlaceholder {
            key,
            input: input.to_string(),
        }),
        None => Ok(resolved.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn props() -> HashMap<String, String> {
        HashMap::from([
            ("host".to_string(), "broker".to_string()),
            ("period".to_string(), "250".to_string()),
        ])
    }

    #[test]
    fn substitutes_values_and_defaults() {
        let props = props();
        assert_eq!(resolve_placeholders("direct:{{host}}", &props).unwrap(), "direct:broker");
        assert_eq!(
            resolve_placeholders("{{ host }}-{{port:9092}}", &props).unwrap(),
            "broker-9092"
        );
        assert_eq!(resolve_placeholders("{{empty:}}x", &props).unwrap(), "x");
        assert_eq!(resolve_placeholders("plain", &props).unwrap(), "plain");
    }

    #[test]
    fn reports_first_unresolved_key() {
        let err = resolve_placeholders("{{host}}/{{missing}}/{{other}}", &props()).unwrap_err();
        match err {
            CompileError::UnresolvedPlaceholder { key, input } => {
                assert_eq!(key, "missing");
                assert_eq!(input, "{{host}}/{{missing}}/{{other}}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
