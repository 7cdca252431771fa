//! Integration tests for settings loading
//!
//! Settings files are written to temporary directories and loaded through
//! `ResilienceSettings::from_file`, then turned into live policies by the
//! registry.

use std::io::Write;
use std::time::Duration;

use bulwark::config::ResilienceSettings;
use bulwark::resilience::{ConfigError, ResilienceRegistry};
use tempfile::{Builder, TempDir};

fn write_file(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

const PAYMENTS_TOML: &str = r#"
[defaults.circuit_breaker]
failure_rate_threshold = 50.0
wait_duration_in_open_state = "30s"

[defaults.retry]
max_attempts = 3
initial_wait_duration = "500ms"

[services.payment-service.circuit_breaker]
failure_rate_threshold = 25.0
minimum_number_of_calls = 5

[services.payment-service.retry]
max_attempts = 5

[services.inventory-service.bulkhead]
max_concurrent_calls = 4
max_wait_duration = 0
"#;

// ============================================================================
// File Loading
// ============================================================================

/// Validates loading a TOML settings file.
///
/// Assertions:
/// - Defaults and per-service overrides are parsed.
/// - Merged settings inherit every field the service does not set.
#[test]
fn test_load_toml_file_with_service_overrides() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "resilience.toml", PAYMENTS_TOML);

    let settings = ResilienceSettings::from_file(&path).unwrap();

    let breaker = settings.circuit_breaker("payment-service").unwrap();
    assert_eq!(breaker.failure_rate_threshold, 25.0);
    assert_eq!(breaker.minimum_number_of_calls, 5);
    assert_eq!(breaker.wait_duration_in_open_state, Duration::from_secs(30));
    assert_eq!(settings.retry("payment-service").unwrap().max_attempts, 5);
    assert_eq!(
        settings.retry("payment-service").unwrap().initial_wait_duration,
        Duration::from_millis(500)
    );

    let bulkhead = settings.bulkhead("inventory-service").unwrap();
    assert_eq!(bulkhead.max_concurrent_calls, 4);
    assert_eq!(bulkhead.max_wait_duration, Duration::ZERO);
    assert_eq!(settings.circuit_breaker("inventory-service").unwrap().failure_rate_threshold, 50.0);
}

#[test]
fn test_load_json_file() {
    let dir = TempDir::new().unwrap();
    let path = write_file(
        &dir,
        "resilience.json",
        r#"{
            "defaults": {"rate_limiter": {"limit_for_period": 20, "limit_refresh_period": "1s"}},
            "services": {"search-service": {"rate_limiter": {"timeout_duration": "2s"}}}
        }"#,
    );

    let settings = ResilienceSettings::from_file(&path).unwrap();
    let limiter = settings.rate_limiter("search-service").unwrap();

    assert_eq!(limiter.limit_for_period, 20);
    assert_eq!(limiter.limit_refresh_period, Duration::from_secs(1));
    assert_eq!(limiter.timeout_duration, Duration::from_secs(2));
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    let result = ResilienceSettings::from_file(dir.path().join("absent.toml"));

    assert!(matches!(result, Err(ConfigError::Io { .. })));
}

#[test]
fn test_unsupported_extension_rejected() {
    let file = Builder::new().suffix(".yaml").tempfile().unwrap();

    let result = ResilienceSettings::from_file(file.path());

    assert!(matches!(result, Err(ConfigError::Parse { .. })));
}

/// Validates rejection of unknown keys.
///
/// Assertions:
/// - A misspelled field in the defaults fails to parse.
/// - A misspelled field in a service override fails when merged.
#[test]
fn test_unknown_fields_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "typo.toml", "[defaults.retry]\nmax_attempt = 4\n");
    assert!(matches!(ResilienceSettings::from_file(&path), Err(ConfigError::Parse { .. })));

    let settings = ResilienceSettings::from_toml_str(
        "[services.payment-service.retry]\nmax_attempt = 4\n",
    )
    .unwrap();
    assert!(settings.retry("payment-service").is_err());
}

// ============================================================================
// Environment Overrides
// ============================================================================

#[test]
fn test_env_style_overrides_after_file_load() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "resilience.toml", PAYMENTS_TOML);
    let mut settings = ResilienceSettings::from_file(&path).unwrap();

    settings
        .apply_overrides_from(|key| match key {
            "BULWARK_RETRY_MAX_ATTEMPTS" => Some("2".to_string()),
            "BULWARK_CIRCUIT_BREAKER_WAIT_DURATION_IN_OPEN_STATE" => Some("1m".to_string()),
            _ => None,
        })
        .unwrap();

    assert_eq!(settings.defaults.retry.max_attempts, 2);
    assert_eq!(
        settings.circuit_breaker("inventory-service").unwrap().wait_duration_in_open_state,
        Duration::from_secs(60)
    );
    // Service overrides still win over the patched defaults
    assert_eq!(settings.retry("payment-service").unwrap().max_attempts, 5);
}

// ============================================================================
// Registry Construction
// ============================================================================

/// Validates registry construction from loaded settings.
///
/// Assertions:
/// - Services with override sections get their policies created eagerly.
/// - Created instances carry the merged configuration.
#[test]
fn test_registry_from_loaded_settings() {
    let settings = ResilienceSettings::from_toml_str(PAYMENTS_TOML).unwrap();

    let registry = ResilienceRegistry::from_settings(settings).unwrap();

    assert_eq!(registry.circuit_breakers().names(), vec!["payment-service".to_string()]);
    assert!(registry.retries().contains("payment-service"));
    assert!(registry.bulkheads().contains("inventory-service"));

    let breaker = registry.circuit_breakers().require("payment-service").unwrap();
    assert_eq!(breaker.config().failure_rate_threshold, 25.0);
    let bulkhead = registry.bulkheads().require("inventory-service").unwrap();
    assert_eq!(bulkhead.metrics().max_concurrent_calls, 4);
}

/// Validates fail-fast construction.
///
/// Assertions:
/// - An invalid override is reported with the service name.
#[test]
fn test_registry_rejects_invalid_service_settings() {
    let settings = ResilienceSettings::from_toml_str(
        "[services.payment-service.circuit_breaker]\nfailure_rate_threshold = 150.0\n",
    )
    .unwrap();

    let err = ResilienceRegistry::from_settings(settings).unwrap_err();

    assert!(matches!(err, ConfigError::Invalid { .. }));
    assert!(err.to_string().contains("payment-service"), "got: {err}");
}
