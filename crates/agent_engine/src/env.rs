use std::collections::BTreeMap;

use crate::EngineError;

/// Checks session environment overrides before they reach the subprocess:
/// keys must be non-empty and free of `=`/NUL, values free of NUL.
pub(crate) fn validate_env(env: &BTreeMap<String, String>) -> Result<(), EngineError> {
    for (key, value) in env {
        if key.is_empty() {
            return Err(EngineError::InvalidEnv {
                reason: "empty key".to_string(),
            });
        }
        if key.contains('=') || key.contains('\0') {
            return Err(EngineError::InvalidEnv {
                reason: format!("key `{key}` contains `=` or NUL"),
            });
        }
        if value.contains('\0') {
            return Err(EngineError::InvalidEnv {
                reason: format!("value for `{key}` contains NUL"),
            });
        }
    }
    Ok(())
}

/// Merges session overrides over a snapshot of the parent environment.
///
/// Pure: the parent snapshot is captured once at start and reused verbatim
/// for every per-turn respawn. Overrides are appended after the snapshot,
/// so duplicate keys resolve last-wins. `None` means "no overrides" and the
/// child inherits the parent environment untouched.
pub(crate) fn merge_env(
    parent: &[(String, String)],
    overrides: &BTreeMap<String, String>,
) -> Option<Vec<(String, String)>> {
    if overrides.is_empty() {
        return None;
    }
    let mut merged = parent.to_vec();
    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    Some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn no_overrides_means_inherit() {
        let parent = vec![("PATH".to_string(), "/bin".to_string())];
        assert!(merge_env(&parent, &BTreeMap::new()).is_none());
    }

    #[test]
    fn override_appends_after_parent() {
        let parent = vec![("PATH".to_string(), "/bin".to_string())];
        let merged = merge_env(&parent, &overrides(&[("FOO", "bar")])).unwrap();
        assert_eq!(merged.len(), parent.len() + 1);
        assert_eq!(
            merged.last().unwrap(),
            &("FOO".to_string(), "bar".to_string())
        );
    }

    #[test]
    fn duplicate_key_resolves_last_wins() {
        let parent = vec![
            ("PATH".to_string(), "/bin".to_string()),
            ("FOO".to_string(), "old".to_string()),
        ];
        let merged = merge_env(&parent, &overrides(&[("FOO", "new")])).unwrap();
        // Both occurrences stay in the vector; the last one is authoritative.
        assert_eq!(merged.len(), 3);
        let last_foo = merged
            .iter()
            .rev()
            .find(|(k, _)| k == "FOO")
            .map(|(_, v)| v.as_str());
        assert_eq!(last_foo, Some("new"));
    }

    #[test]
    fn rejects_malformed_keys_and_values() {
        assert!(validate_env(&overrides(&[("", "v")])).is_err());
        assert!(validate_env(&overrides(&[("A=B", "v")])).is_err());
        assert!(validate_env(&overrides(&[("A\0", "v")])).is_err());
        assert!(validate_env(&overrides(&[("A", "v\0")])).is_err());
        assert!(validate_env(&overrides(&[("A", "v")])).is_ok());
    }
}
