//! Environment-variable parsing for the producer-side layer.

use tracing::warn;

/// Parses an integer environment variable, enforcing `[min, max]`.
///
/// Unset and empty both mean "not configured". Anything unparsable or out
/// of range is ignored with a warning rather than failing the process the
/// layer is injected into.
pub fn parse_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    let raw = std::env::var(name).ok()?;
    if raw.is_empty() {
        return None;
    }
    match raw.trim().parse::<i64>() {
        Ok(v) if v >= i64::from(min) && v <= i64::from(max) => Some(v as u32),
        Ok(v) => {
            warn!("{name}={v} is out of range [{min}, {max}], ignoring");
            None
        }
        Err(_) => {
            warn!("{name}='{raw}' is not a valid integer, ignoring");
            None
        }
    }
}

/// True when `name` is set to anything other than `"0"`.
pub fn env_flag(name: &str) -> bool {
    matches!(std::env::var(name), Ok(v) if v != "0")
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env vars are process-global; give each test its own name.

    #[test]
    fn parses_in_range_value() {
        std::env::set_var("GOGGLES_TEST_WIDTH", "2560");
        assert_eq!(parse_env_u32("GOGGLES_TEST_WIDTH", 1, 16384), Some(2560));
        std::env::remove_var("GOGGLES_TEST_WIDTH");
    }

    #[test]
    fn rejects_out_of_range_and_garbage() {
        std::env::set_var("GOGGLES_TEST_HEIGHT", "0");
        assert_eq!(parse_env_u32("GOGGLES_TEST_HEIGHT", 1, 16384), None);
        std::env::set_var("GOGGLES_TEST_HEIGHT", "banana");
        assert_eq!(parse_env_u32("GOGGLES_TEST_HEIGHT", 1, 16384), None);
        std::env::remove_var("GOGGLES_TEST_HEIGHT");
    }

    #[test]
    fn unset_and_empty_mean_unconfigured() {
        std::env::remove_var("GOGGLES_TEST_FPS");
        assert_eq!(parse_env_u32("GOGGLES_TEST_FPS", 0, 1000), None);
        std::env::set_var("GOGGLES_TEST_FPS", "");
        assert_eq!(parse_env_u32("GOGGLES_TEST_FPS", 0, 1000), None);
        std::env::remove_var("GOGGLES_TEST_FPS");
    }

    #[test]
    fn flag_semantics_match_layer_contract() {
        std::env::set_var("GOGGLES_TEST_FLAG", "1");
        assert!(env_flag("GOGGLES_TEST_FLAG"));
        std::env::set_var("GOGGLES_TEST_FLAG", "0");
        assert!(!env_flag("GOGGLES_TEST_FLAG"));
        std::env::remove_var("GOGGLES_TEST_FLAG");
        assert!(!env_flag("GOGGLES_TEST_FLAG"));
    }
}
