pub mod logging {
    use crate::config::env_flag;
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    const FILTER_ENV: &str = "CAMLINK_LOG_FILTER";
    const TRACE_DEPS_ENV: &str = "CAMLINK_TRACE_DEPS";

    /// Dependency targets kept at info under `--log-level trace`. Directives
    /// match by prefix, so `webrtc` also covers `webrtc_ice`, `webrtc_dtls`, ...
    const NOISY_DEPENDENCIES: &[&str] = &["webrtc", "interceptor", "tokio_tungstenite", "tungstenite"];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        Warn,
        #[default]
        Info,
        Debug,
        Trace,
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. A second call is a no-op.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let explicit = std::env::var(FILTER_ENV).ok();
        let include_deps = env_flag(TRACE_DEPS_ENV);
        let directives = explicit
            .clone()
            .unwrap_or_else(|| filter_directives(config.level, include_deps));

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(directives))
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_names(config.level == LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;
        let _ = GUARD.set(guard);

        if explicit.is_none() && config.level == LogLevel::Trace && !include_deps {
            tracing::debug!("webrtc and websocket internals capped at info; set {TRACE_DEPS_ENV}=1 to include them");
        }
        Ok(())
    }

    /// Filter for `level`: our own crates at the requested level, everything
    /// else at info or quieter.
    pub(crate) fn filter_directives(level: LogLevel, include_deps: bool) -> String {
        let own = |lvl: &str| format!("info,camlink_core={lvl},camlink={lvl}");
        match level {
            LogLevel::Error => "error".into(),
            LogLevel::Warn => "warn".into(),
            LogLevel::Info => "info".into(),
            LogLevel::Debug => own("debug"),
            LogLevel::Trace if include_deps => "trace".into(),
            LogLevel::Trace => NOISY_DEPENDENCIES
                .iter()
                .fold(own("trace"), |filter, target| format!("{filter},{target}=info")),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn trace_caps_webrtc_and_websocket_targets() {
            let filter = filter_directives(LogLevel::Trace, false);
            assert!(filter.starts_with("info,camlink_core=trace,camlink=trace"));
            assert!(filter.contains(",webrtc=info"));
            assert!(filter.contains(",tokio_tungstenite=info"));
        }

        #[test]
        fn trace_with_dependencies_is_unfiltered() {
            assert_eq!(filter_directives(LogLevel::Trace, true), "trace");
        }

        #[test]
        fn quieter_levels() {
            assert_eq!(filter_directives(LogLevel::Warn, false), "warn");
            assert_eq!(
                filter_directives(LogLevel::Debug, true),
                "info,camlink_core=debug,camlink=debug"
            );
        }
    }
}
