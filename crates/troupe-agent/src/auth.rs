//! Credential lookup for LLM providers

use std::env;
use troupe_core::{Result, TroupeError};

/// Environment variables checked for an Anthropic credential, in priority order
pub const ANTHROPIC_KEY_VARS: &[&str] = &["CLAUDE_CODE_OAUTH_TOKEN", "ANTHROPIC_API_KEY"];

/// Return the first non-empty value among `vars`
pub fn resolve_api_key(vars: &[&str]) -> Result<String> {
    for var in vars {
        if let Ok(value) = env::var(var) {
            if !value.trim().is_empty() {
                tracing::debug!("Using credential from {}", var);
                return Ok(value);
            }
        }
    }

    Err(TroupeError::Auth(format!(
        "No credential found. Set one of: {}",
        vars.join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serializes env var mutation across tests
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env_vars<F, R>(vars: &[(&str, Option<&str>)], f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = ENV_LOCK.lock().unwrap();
        let originals: Vec<_> = vars.iter().map(|(k, _)| (*k, env::var(k).ok())).collect();

        for (key, value) in vars {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        let result = f();

        for (key, original) in originals {
            match original {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        result
    }

    #[test]
    fn test_priority_order() {
        with_env_vars(
            &[("TROUPE_TEST_A", Some("first")), ("TROUPE_TEST_B", Some("second"))],
            || assert_eq!(resolve_api_key(&["TROUPE_TEST_A", "TROUPE_TEST_B"]).unwrap(), "first"),
        );
    }

    #[test]
    fn test_blank_value_skipped() {
        with_env_vars(
            &[("TROUPE_TEST_A", Some("  ")), ("TROUPE_TEST_B", Some("second"))],
            || assert_eq!(resolve_api_key(&["TROUPE_TEST_A", "TROUPE_TEST_B"]).unwrap(), "second"),
        );
    }

    #[test]
    fn test_missing_is_auth_error() {
        with_env_vars(&[("TROUPE_TEST_A", None)], || {
            assert!(matches!(
                resolve_api_key(&["TROUPE_TEST_A"]),
                Err(TroupeError::Auth(_))
            ));
        });
    }
}
