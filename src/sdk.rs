//! Active SDK version lookup.
//!
//! Real SDK detection belongs to the host program; this crate only needs a
//! version to check package `sdk` constraints against. Tests (and embedders)
//! override it through the `_PUB_TEST_SDK_VERSION` environment variable.

use anyhow::Result;

use crate::version::Version;

/// Environment variable overriding the detected SDK version.
pub const SDK_VERSION_OVERRIDE: &str = "_PUB_TEST_SDK_VERSION";

/// Version reported when no override is present.
const HOST_SDK_VERSION: &str = "1.0.0";

/// The SDK version the current process is running against.
pub fn active_version() -> Result<Version> {
    match std::env::var(SDK_VERSION_OVERRIDE) {
        Ok(text) => Version::parse(&text),
        Err(_) => Version::parse(HOST_SDK_VERSION),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn override_wins() {
        // SAFETY: test is serialized; no other thread reads the environment.
        unsafe { std::env::set_var(SDK_VERSION_OVERRIDE, "2.3.4") };
        assert_eq!(active_version().unwrap(), Version::new(2, 3, 4));
        unsafe { std::env::remove_var(SDK_VERSION_OVERRIDE) };
    }

    #[test]
    #[serial]
    fn default_without_override() {
        unsafe { std::env::remove_var(SDK_VERSION_OVERRIDE) };
        assert_eq!(active_version().unwrap(), Version::new(1, 0, 0));
    }
}
