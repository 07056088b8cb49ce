//! # Structured Logging Module
//!
//! Environment-aware structured logging for the coordination layer. Console output is
//! human-readable by default; set `API_TOOLKIT_LOG_FORMAT=json` for one JSON object per
//! line. `RUST_LOG` always wins over the environment-derived level.

use chrono::Utc;
use std::sync::OnceLock;
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
///
/// Safe to call repeatedly and alongside a host application's own subscriber.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));

        let console = if use_json_format() {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_filter(filter)
                .boxed()
        };

        // Use try_init to avoid panic if global subscriber already set
        if tracing_subscriber::registry().with(console).try_init().is_err() {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("API_TOOLKIT_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        "test" | "development" => "debug".to_string(),
        _ => "debug".to_string(),
    }
}

fn use_json_format() -> bool {
    std::env::var("API_TOOLKIT_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Log structured data for cache operations
pub fn log_cache_operation(
    operation: &str,
    namespace: &str,
    fingerprint: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        namespace = %namespace,
        fingerprint = fingerprint,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "💾 CACHE_OPERATION"
    );
}

/// Log structured data for admission decisions
pub fn log_admission_operation(
    limiter: &str,
    key: &str,
    status: &str,
    waited: Option<Duration>,
    details: Option<&str>,
) {
    tracing::info!(
        limiter = %limiter,
        key = %key,
        status = %status,
        waited_ms = waited.map(|w| w.as_millis() as u64),
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🚦 ADMISSION_OPERATION"
    );
}

/// Log structured data for retry scheduling
pub fn log_retry_operation(
    namespace: &str,
    attempt: u32,
    max_attempts: u32,
    status: Option<u16>,
    delay: Duration,
) {
    tracing::warn!(
        namespace = %namespace,
        attempt = attempt,
        max_attempts = max_attempts,
        status = status,
        delay_ms = delay.as_millis() as u64,
        timestamp = %Utc::now().to_rfc3339(),
        "🔁 RETRY_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_detection() {
        std::env::set_var("API_TOOLKIT_ENV", "test_override");
        let env = get_environment();
        assert_eq!(env, "test_override");
        std::env::remove_var("API_TOOLKIT_ENV");
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("unknown"), "debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_structured_logging();
        init_structured_logging();
        log_admission_operation("rate", "rate_limit:site", "admitted", None, None);
    }
}
