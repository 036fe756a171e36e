pub mod cli;
pub mod config;
pub mod error;
pub mod media;
pub mod session;
pub mod signaling;
pub mod telemetry;

use cli::Cli;
use config::Config;
use error::SessionError;
use media::RtcLauncher;
use session::driver::{SessionDriver, SessionReport};
use signaling::WebSocketConnector;

/// Validates the command line into a session configuration. Nothing has
/// connected yet when this fails.
pub fn configure(cli: &Cli) -> Result<Config, SessionError> {
    Ok(Config::try_from(cli)?)
}

/// Runs one session with the production relay connection and media engine
/// until the peer leaves, a fatal error occurs or Ctrl-C is pressed.
pub async fn run(config: &Config) -> Result<SessionReport, SessionError> {
    let connector = WebSocketConnector::new(config.disable_ssl);
    let launcher = RtcLauncher::new(config);
    SessionDriver::new(config.role)
        .run(&config.server, &connector, &launcher, shutdown_signal())
        .await
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!(target: "camlink::session", "interrupt received"),
        Err(err) => {
            tracing::warn!(target: "camlink::session", "cannot listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    }
}
