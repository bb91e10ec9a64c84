//! Package-level constants.

/// Current version of the gateway (sourced from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service name reported by health checks and logs.
pub const NAME: &str = "blpgw";

/// Service used for subscriptions whose security does not name one.
pub const DEFAULT_SUBSCRIPTION_SERVICE: &str = "//blp/mktdata";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_semver() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert_eq!(parts.len(), 3, "VERSION must be semver (MAJOR.MINOR.PATCH)");
        for part in parts {
            let _: u32 = part.parse().expect("each semver segment must be a number");
        }
    }

    #[test]
    fn name_is_lowercase() {
        assert_eq!(NAME, NAME.to_lowercase());
    }

    #[test]
    fn default_service_is_a_service_uri() {
        assert!(DEFAULT_SUBSCRIPTION_SERVICE.starts_with("//"));
    }
}
