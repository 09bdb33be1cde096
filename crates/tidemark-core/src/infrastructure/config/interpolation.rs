use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InterpolationError {
    #[error("Required environment variable not found: {0}")]
    RequiredVarNotFound(String),

    #[error("Recursive interpolation limit exceeded")]
    RecursionLimit,
}

pub type InterpolationResult<T> = Result<T, InterpolationError>;

const MAX_RECURSION_DEPTH: usize = 10;

// `${VAR}` or `${VAR:-default}`; the default may itself hold one level of
// `${...}`
static VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-((?:[^{}]|\$\{[^}]*\})*))?\}")
        .expect("Invalid regex pattern")
});

pub fn interpolate(input: &str) -> InterpolationResult<String> {
    interpolate_with_depth(input, 0)
}

fn interpolate_with_depth(input: &str, depth: usize) -> InterpolationResult<String> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(InterpolationError::RecursionLimit);
    }
    let mut result = String::with_capacity(input.len());
    let mut last = 0;

    for cap in VAR_PATTERN.captures_iter(input) {
        let (Some(full), Some(name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };

        result.push_str(&input[last..full.start()]);

        let replacement = match std::env::var(name.as_str()) {
            Ok(value) => value,
            Err(_) => match cap.get(2) {
                Some(default) => interpolate_with_depth(default.as_str(), depth + 1)?,
                None => {
                    return Err(InterpolationError::RequiredVarNotFound(
                        name.as_str().to_string(),
                    ))
                }
            },
        };

        result.push_str(&replacement);
        last = full.end();
    }

    result.push_str(&input[last..]);
    Ok(result)
}

pub fn interpolate_toml(value: &mut toml::Value) -> InterpolationResult<()> {
    match value {
        toml::Value::String(s) => {
            *s = interpolate(s)?;
        }
        toml::Value::Array(arr) => {
            for item in arr {
                interpolate_toml(item)?;
            }
        }
        toml::Value::Table(table) => {
            for (_, v) in table.iter_mut() {
                interpolate_toml(v)?;
            }
        }
        _ => {}
    }
    Ok(())
}

pub fn has_variables(input: &str) -> bool {
    VAR_PATTERN.is_match(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_var() {
        std::env::set_var("TIDEMARK_TEST_SIMPLE", "hello");
        let result = interpolate("${TIDEMARK_TEST_SIMPLE}").unwrap();
        assert_eq!(result, "hello");
        std::env::remove_var("TIDEMARK_TEST_SIMPLE");
    }

    #[test]
    fn test_var_inside_path() {
        std::env::set_var("TIDEMARK_TEST_HOME", "/srv/data");
        let result = interpolate("${TIDEMARK_TEST_HOME}/orders.db").unwrap();
        assert_eq!(result, "/srv/data/orders.db");
        std::env::remove_var("TIDEMARK_TEST_HOME");
    }

    #[test]
    fn test_missing_var_error() {
        let result = interpolate("${TIDEMARK_TEST_DOES_NOT_EXIST_1}");
        assert!(matches!(
            result,
            Err(InterpolationError::RequiredVarNotFound(_))
        ));
    }

    #[test]
    fn test_default_value() {
        let result = interpolate("${TIDEMARK_TEST_DOES_NOT_EXIST_2:-fallback}").unwrap();
        assert_eq!(result, "fallback");

        let empty = interpolate("a${TIDEMARK_TEST_DOES_NOT_EXIST_3:-}b").unwrap();
        assert_eq!(empty, "ab");
    }

    #[test]
    fn test_nested_default() {
        std::env::set_var("TIDEMARK_TEST_INNER", "inner");
        let result = interpolate("${TIDEMARK_TEST_MISSING_4:-${TIDEMARK_TEST_INNER}}").unwrap();
        assert_eq!(result, "inner");
        std::env::remove_var("TIDEMARK_TEST_INNER");
    }

    #[test]
    fn test_pattern_builds() {
        assert_eq!(VAR_PATTERN.captures_len(), 3);
    }

    #[test]
    fn test_has_variables() {
        assert!(has_variables("${VAR}"));
        assert!(has_variables("x${VAR:-1}"));
        assert!(!has_variables("$VAR"));
        assert!(!has_variables("plain"));
    }

    #[test]
    fn test_interpolate_toml() {
        std::env::set_var("TIDEMARK_TEST_TOML", "orders");

        let mut value: toml::Value = toml::from_str(
            r#"
            table = "${TIDEMARK_TEST_TOML}"
            nested = { path = "${TIDEMARK_TEST_MISSING_5:-/tmp/x.db}" }
            list = ["${TIDEMARK_TEST_TOML}", "static"]
            "#,
        )
        .unwrap();
        interpolate_toml(&mut value).unwrap();

        assert_eq!(value["table"].as_str().unwrap(), "orders");
        assert_eq!(value["nested"]["path"].as_str().unwrap(), "/tmp/x.db");
        assert_eq!(value["list"][0].as_str().unwrap(), "orders");
        assert_eq!(value["list"][1].as_str().unwrap(), "static");

        std::env::remove_var("TIDEMARK_TEST_TOML");
    }
}
