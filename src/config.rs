use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// CAP service configuration. Every knob reads from the environment and can
/// be overridden on the command line; `--help` and `--version` print and
/// exit.
#[derive(Debug, Parser)]
#[command(name = "cap", version, about = "CAP relay service")]
pub struct CapConfig {
    #[arg(long, env = "WEB_READ_TIMEOUT", default_value = "5s", value_parser = humantime::parse_duration)]
    pub web_read_timeout: Duration,

    #[arg(long, env = "WEB_WRITE_TIMEOUT", default_value = "10s", value_parser = humantime::parse_duration)]
    pub web_write_timeout: Duration,

    #[arg(long, env = "WEB_IDLE_TIMEOUT", default_value = "120s", value_parser = humantime::parse_duration)]
    pub web_idle_timeout: Duration,

    #[arg(long, env = "WEB_SHUTDOWN_TIMEOUT", default_value = "20s", value_parser = humantime::parse_duration)]
    pub web_shutdown_timeout: Duration,

    /// How long a connecting client has to present its identity frame.
    #[arg(long, env = "WEB_HANDSHAKE_TIMEOUT", default_value = "1s", value_parser = humantime::parse_duration)]
    pub web_handshake_timeout: Duration,

    #[arg(long, env = "WEB_API_HOST", default_value = "0.0.0.0:3000")]
    pub web_api_host: String,

    #[arg(long, env = "NATS_HOST", default_value = "demo.nats.io")]
    pub nats_host: String,

    #[arg(long, env = "NATS_SUBJECT", default_value = "capchat")]
    pub nats_subject: String,

    /// Where the CAP's durable consumer identity lives across reboots.
    #[arg(long, env = "NATS_ID_FILE_PATH", default_value = "data/cap")]
    pub nats_id_file_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CapConfig::try_parse_from(["cap"]).unwrap();
        assert_eq!(config.web_read_timeout, Duration::from_secs(5));
        assert_eq!(config.web_write_timeout, Duration::from_secs(10));
        assert_eq!(config.web_idle_timeout, Duration::from_secs(120));
        assert_eq!(config.web_shutdown_timeout, Duration::from_secs(20));
        assert_eq!(config.web_api_host, "0.0.0.0:3000");
        assert_eq!(config.nats_subject, "capchat");
    }

    #[test]
    fn flags_override_defaults() {
        let config = CapConfig::try_parse_from([
            "cap",
            "--web-handshake-timeout",
            "250ms",
            "--web-api-host",
            "127.0.0.1:4000",
        ])
        .unwrap();
        assert_eq!(config.web_handshake_timeout, Duration::from_millis(250));
        assert_eq!(config.web_api_host, "127.0.0.1:4000");
    }

    #[test]
    fn bad_duration_is_a_parse_error() {
        assert!(CapConfig::try_parse_from(["cap", "--web-read-timeout", "soon"]).is_err());
    }
}
