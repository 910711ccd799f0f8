//! CLI / runtime configuration.

use clap::Parser;

use crate::launch::BrowserChannel;

/// CDP relay – bridges an upstream DevTools client to a browser tab via an
/// in-browser debugging extension
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct RelayArgs {
    /// Host to bind the relay's WebSocket listener on
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Port to bind the relay's WebSocket listener on
    #[arg(long, default_value_t = 9223)]
    pub port: u16,

    /// Browser release channel to launch when handing off to the extension
    #[arg(long, default_value = "stable")]
    pub browser_channel: String,

    /// Log level
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl RelayArgs {
    pub fn browser_channel(&self) -> crate::error::Result<BrowserChannel> {
        self.browser_channel.parse()
    }

    pub fn tracing_level(&self) -> tracing::Level {
        match self.log_level.to_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let args = RelayArgs::parse_from(["cdp-relay"]);
        assert_eq!(args.host, "localhost");
        assert_eq!(args.port, 9223);
        assert_eq!(args.browser_channel, "stable");
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn parses_overrides() {
        let args = RelayArgs::parse_from([
            "cdp-relay",
            "--host",
            "0.0.0.0",
            "--port",
            "9333",
            "--browser-channel",
            "canary",
            "--log-level",
            "debug",
        ]);
        assert_eq!(args.host, "0.0.0.0");
        assert_eq!(args.port, 9333);
        assert_eq!(args.browser_channel().unwrap(), BrowserChannel::Canary);
        assert_eq!(args.tracing_level(), tracing::Level::DEBUG);
    }
}
