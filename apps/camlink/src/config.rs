use crate::cli::{Cli, Command};
use crate::session::Role;
use std::env;
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
const STUN_URLS_ENV: &str = "CAMLINK_STUN_URLS";
const DISABLE_STUN_ENV: &str = "CAMLINK_DISABLE_STUN";
const MAX_FPS: u32 = 240;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid signaling server URL {url:?}: {reason}")]
    InvalidServerUrl { url: String, reason: String },
    #[error("unsupported signaling scheme {0:?}; expected ws or wss")]
    UnsupportedScheme(String),
    #[error("frame rate must be between 1 and {MAX_FPS}, got {0}")]
    InvalidFrameRate(u32),
    #[error("video file {0:?} not found")]
    MissingVideo(PathBuf),
    #[error("invalid ICE server URL {0:?}; expected stun:, stuns:, turn: or turns:")]
    InvalidIceServer(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSourceConfig {
    pub path: PathBuf,
    pub fps: u32,
}

/// Everything a session needs, validated before anything connects.
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub server: Url,
    pub disable_ssl: bool,
    pub ice_servers: Vec<String>,
    pub video: Option<VideoSourceConfig>,
    pub output: Option<PathBuf>,
}

impl TryFrom<&Cli> for Config {
    type Error = ConfigError;

    fn try_from(cli: &Cli) -> Result<Self, Self::Error> {
        let server = normalize_server_url(&cli.server)?;
        let stun_urls = env::var(STUN_URLS_ENV).ok();
        let ice_servers = ice_servers_from(stun_urls.as_deref(), env_flag(DISABLE_STUN_ENV))?;

        let (role, video, output) = match &cli.command {
            Command::Send(args) => {
                if args.fps == 0 || args.fps > MAX_FPS {
                    return Err(ConfigError::InvalidFrameRate(args.fps));
                }
                let video = match &args.video {
                    Some(path) if !path.is_file() => {
                        return Err(ConfigError::MissingVideo(path.clone()));
                    }
                    Some(path) => Some(VideoSourceConfig {
                        path: path.clone(),
                        fps: args.fps,
                    }),
                    None => None,
                };
                (Role::Offerer, video, None)
            }
            Command::Receive(args) => (Role::Answerer, None, args.output.clone()),
        };

        Ok(Self {
            role,
            server,
            disable_ssl: cli.disable_ssl,
            ice_servers,
            video,
            output,
        })
    }
}

/// Reads a boolean switch from the environment. Unset, empty and the usual
/// negatives (`0`, `false`, `no`, `off`) are false.
pub(crate) fn env_flag(var: &str) -> bool {
    env::var(var).is_ok_and(|value| parse_flag(&value))
}

fn parse_flag(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

/// Parses the relay address. http(s) is accepted and rewritten to ws(s);
/// `localhost` is pinned to IPv4 so resolvers preferring `::1` still reach
/// relays bound to 127.0.0.1.
pub fn normalize_server_url(raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidServerUrl {
        url: raw.to_string(),
        reason,
    };
    let mut url = Url::parse(raw.trim()).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "wss" => None,
        "http" => Some("ws"),
        "https" => Some("wss"),
        other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme)
            .map_err(|()| invalid(format!("cannot switch to {scheme}")))?;
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".into()));
    }
    if url.host_str() == Some("localhost") {
        url.set_host(Some("127.0.0.1"))
            .map_err(|err| invalid(err.to_string()))?;
    }
    Ok(url)
}

/// ICE server list from `CAMLINK_STUN_URLS` (comma separated), falling back
/// to the public Google STUN server. `disable` yields host candidates only.
pub fn ice_servers_from(stun_urls: Option<&str>, disable: bool) -> Result<Vec<String>, ConfigError> {
    if disable {
        return Ok(Vec::new());
    }
    let Some(raw) = stun_urls.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(vec![DEFAULT_STUN_SERVER.to_string()]);
    };
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let valid = ["stun:", "stuns:", "turn:", "turns:"]
                .iter()
                .any(|prefix| entry.starts_with(prefix) && entry.len() > prefix.len());
            if valid {
                Ok(entry.to_string())
            } else {
                Err(ConfigError::InvalidIceServer(entry.to_string()))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{ReceiveArgs, SendArgs};
    use crate::telemetry::logging::LogLevel;

    fn cli(command: Command) -> Cli {
        Cli {
            server: "wss://relay.example.org:8443/ws".into(),
            disable_ssl: false,
            logging: crate::cli::LoggingArgs {
                level: LogLevel::Info,
                file: None,
            },
            command,
        }
    }

    #[test]
    fn accepts_websocket_schemes() {
        let url = normalize_server_url("wss://relay.example.org:8443/ws").unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.org:8443/ws");
        assert_eq!(normalize_server_url("ws://10.0.0.2:8080").unwrap().scheme(), "ws");
    }

    #[test]
    fn rewrites_http_schemes_and_localhost() {
        assert_eq!(
            normalize_server_url("https://relay.example.org").unwrap().scheme(),
            "wss"
        );
        let url = normalize_server_url("http://localhost:8080/signal").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8080/signal");
    }

    #[test]
    fn rejects_bad_server_urls() {
        assert!(matches!(
            normalize_server_url("ftp://relay.example.org"),
            Err(ConfigError::UnsupportedScheme(scheme)) if scheme == "ftp"
        ));
        assert!(matches!(
            normalize_server_url("not a url"),
            Err(ConfigError::InvalidServerUrl { .. })
        ));
    }

    #[test]
    fn ice_servers_default_override_and_disable() {
        assert_eq!(
            ice_servers_from(None, false).unwrap(),
            vec![DEFAULT_STUN_SERVER.to_string()]
        );
        assert_eq!(
            ice_servers_from(Some(" stun:a.example:3478, turn:b.example "), false).unwrap(),
            vec!["stun:a.example:3478".to_string(), "turn:b.example".to_string()]
        );
        assert!(ice_servers_from(Some("stun:a.example"), true).unwrap().is_empty());
        assert!(matches!(
            ice_servers_from(Some("a.example:3478"), false),
            Err(ConfigError::InvalidIceServer(_))
        ));
    }

    #[test]
    fn flags_accept_common_spellings() {
        for yes in ["1", "true", "TRUE", "yes", "on"] {
            assert!(parse_flag(yes), "{yes}");
        }
        for no in ["", "0", "false", "False", " no ", "off"] {
            assert!(!parse_flag(no), "{no:?}");
        }
    }

    #[test]
    fn send_requires_existing_video_and_sane_rate() {
        let missing = cli(Command::Send(SendArgs {
            video: Some(PathBuf::from("/nonexistent/clip.h264")),
            fps: 30,
        }));
        assert!(matches!(
            Config::try_from(&missing),
            Err(ConfigError::MissingVideo(_))
        ));

        let zero = cli(Command::Send(SendArgs { video: None, fps: 0 }));
        assert!(matches!(
            Config::try_from(&zero),
            Err(ConfigError::InvalidFrameRate(0))
        ));

        let file = tempfile::NamedTempFile::new().unwrap();
        let ok = cli(Command::Send(SendArgs {
            video: Some(file.path().to_path_buf()),
            fps: 25,
        }));
        let config = Config::try_from(&ok).unwrap();
        assert_eq!(config.role, Role::Offerer);
        assert_eq!(
            config.video,
            Some(VideoSourceConfig {
                path: file.path().to_path_buf(),
                fps: 25
            })
        );
        assert!(config.output.is_none());
    }

    #[test]
    fn receive_maps_to_answerer() {
        let config = Config::try_from(&cli(Command::Receive(ReceiveArgs {
            output: Some(PathBuf::from("out.h264")),
        })))
        .unwrap();
        assert_eq!(config.role, Role::Answerer);
        assert_eq!(config.output, Some(PathBuf::from("out.h264")));
        assert!(config.video.is_none());
        assert!(!config.disable_ssl);
    }
}
