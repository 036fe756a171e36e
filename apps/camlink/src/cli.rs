use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use std::path::PathBuf;

use crate::telemetry::logging::{LogConfig, LogLevel};

pub const DEFAULT_SERVER: &str = "wss://127.0.0.1:8080";

#[derive(Parser, Debug)]
#[command(
    name = "camlink",
    about = "Stream H.264 video between two peers over WebRTC",
    author,
    version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("CAMLINK_BUILD_DATE"))
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "CAMLINK_SERVER",
        value_name = "URL",
        default_value = DEFAULT_SERVER,
        help = "Signaling server URL (ws:// or wss://)"
    )]
    pub server: String,

    #[arg(
        long = "disable-ssl",
        global = true,
        env = "CAMLINK_DISABLE_SSL",
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true",
        value_parser = BoolishValueParser::new(),
        value_name = "BOOL",
        help = "Accept self-signed or mismatched certificates from the signaling server"
    )]
    pub disable_ssl: bool,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "CAMLINK_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "CAMLINK_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Publish a video track and make the offer
    Send(SendArgs),
    /// Answer an offer and receive the video track
    Receive(ReceiveArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SendArgs {
    #[arg(
        long,
        value_name = "FILE",
        help = "H.264 Annex-B file to stream in a loop"
    )]
    pub video: Option<PathBuf>,

    #[arg(
        long,
        value_name = "FPS",
        default_value_t = 30,
        help = "Frame rate used to pace the video file"
    )]
    pub fps: u32,
}

#[derive(Args, Debug, Clone)]
pub struct ReceiveArgs {
    #[arg(
        long,
        value_name = "PATH",
        help = "Write the received Annex-B stream to this file"
    )]
    pub output: Option<PathBuf>,
}
