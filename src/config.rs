use clap::Parser;
use humantime::Duration;

use crate::relay::RelaySettings;

/// Share and load-balance TCP services through SSH port forwarding.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct ApplicationConfig {
    /// Address to listen to for SSH connections.
    #[arg(long, default_value = "0.0.0.0", value_name = "ADDRESS")]
    pub listen_address: String,

    /// Port to listen to for SSH connections.
    #[arg(long, default_value_t = 2222, value_name = "PORT")]
    pub ssh_port: u16,

    /// Enforce an inactivity deadline on relayed public connections.
    #[arg(long, default_value_t = false)]
    pub idle_connection: bool,

    /// How long a relayed connection may sit without traffic before it is
    /// forcefully failed. Only effective with --idle-connection.
    #[arg(long, default_value = "3m", value_name = "DURATION")]
    pub idle_connection_timeout: Duration,

    /// Log relay copy errors and other verbose diagnostics.
    #[arg(long, default_value_t = false)]
    pub debug: bool,

    /// How many console messages to buffer per session before new ones are
    /// dropped.
    #[arg(long, default_value_t = 64, value_name = "COUNT")]
    pub message_queue_size: usize,
}

impl ApplicationConfig {
    // Relay behavior derived from the idle-connection flags.
    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            idle_timeout: self
                .idle_connection
                .then(|| self.idle_connection_timeout.into()),
            verbose_errors: self.debug,
        }
    }
}

#[cfg(test)]
mod config_tests {
    use std::time::Duration;

    use clap::Parser;

    use super::ApplicationConfig;

    #[test]
    fn disables_idle_enforcement_by_default() {
        let config = ApplicationConfig::parse_from(["aliasmux"]);
        let settings = config.relay_settings();
        assert_eq!(settings.idle_timeout, None);
        assert!(!settings.verbose_errors);
    }

    #[test]
    fn parses_idle_timeout_as_duration() {
        let config = ApplicationConfig::parse_from([
            "aliasmux",
            "--idle-connection",
            "--idle-connection-timeout=200ms",
            "--debug",
        ]);
        let settings = config.relay_settings();
        assert_eq!(settings.idle_timeout, Some(Duration::from_millis(200)));
        assert!(settings.verbose_errors);
    }
}
