//! Process-level configuration read from environment variables.

/// Interpret a string value such as "1" or "no" as a boolean.
///
/// Returns `None` for unrecognized values.
pub fn str_as_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Return whether a feature flag controlled by an environment variable is
/// enabled.
///
/// Unset variables and unrecognized values yield `default`. An unrecognized
/// value is logged as a warning.
pub fn env_flag(name: &str, default: bool) -> bool {
    let Ok(value) = std::env::var(name) else {
        return default;
    };
    str_as_bool(&value).unwrap_or_else(|| {
        tracing::warn!(
            "unrecognized boolean value \"{}\" for {}, using {}",
            value,
            name,
            default
        );
        default
    })
}

/// Return the value of a numeric environment variable, if set and valid.
pub fn env_usize(name: &str) -> Option<usize> {
    let value = std::env::var_os(name)?;
    match value.to_string_lossy().trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!("ignoring invalid value {:?} for {}", value, name);
            None
        }
    }
}

/// Name of the variable which forces kernels to use their generic
/// (offset-engine driven) strategies even when a layout has a cheaper
/// closed-form path.
pub const FORCE_GENERIC_VAR: &str = "VKERN_FORCE_GENERIC";

/// Return true if generic kernel strategies are forced.
///
/// This is read each time a primitive is created, so tests and tools can
/// toggle it between primitives.
pub fn force_generic() -> bool {
    env_flag(FORCE_GENERIC_VAR, false)
}

#[cfg(test)]
mod tests {
    use super::str_as_bool;

    #[test]
    fn test_str_as_bool() {
        for s in ["1", "true", "YES", "y", " on "] {
            assert_eq!(str_as_bool(s), Some(true), "{}", s);
        }
        for s in ["0", "False", "no", "off"] {
            assert_eq!(str_as_bool(s), Some(false), "{}", s);
        }
        assert_eq!(str_as_bool("maybe"), None);
    }
}
