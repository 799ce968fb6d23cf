use crate::config::AppConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter directive for the configured level; progress events are opt-in
fn filter_directive(config: &AppConfig) -> String {
    if config.enable_tracing {
        config.log_level.clone()
    } else {
        format!("{},progress=off", config.log_level)
    }
}

/// Install the global subscriber; keep the guard alive until exit
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let file_appender = match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&config.log_dir, &config.log_file),
        "daily" => tracing_appender::rolling::daily(&config.log_dir, &config.log_file),
        _ => tracing_appender::rolling::never(&config.log_dir, &config.log_file),
    };
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        // request_id and iteration stay queryable as JSON fields
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(enable_tracing: bool) -> AppConfig {
        let mut config = AppConfig::from_yaml(
            r#"
log_level: debug
log_dir: ./logs
log_file: mp.log
use_json: true
rotation: never
gateway: { host: 127.0.0.1, port: 0 }
network: { identity: "O=Bank A, L=London, C=GB" }
"#,
        )
        .unwrap();
        config.enable_tracing = enable_tracing;
        config
    }

    #[test]
    fn test_progress_target_is_opt_in() {
        assert_eq!(filter_directive(&config(false)), "debug,progress=off");
        assert_eq!(filter_directive(&config(true)), "debug");
    }
}
