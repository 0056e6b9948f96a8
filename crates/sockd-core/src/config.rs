/// Runtime settings for the proxy engine.

use std::path::PathBuf;
use std::time::Duration;

/// Knobs the CLI exposes. The firewall rule file is the only on-disk
/// configuration and is re-read at the start of every session.
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_host: String,
    pub listen_port: u16,
    pub firewall_path: PathBuf,
    /// Optional JSON-lines audit log.
    pub log_path: Option<PathBuf>,
    /// Applies to the first-request read and name resolution.
    pub handshake_timeout_secs: u64,
    /// Applies to the outbound connect.
    pub connect_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 1080,
            firewall_path: PathBuf::from("./socks.conf"),
            log_path: None,
            handshake_timeout_secs: 30,
            connect_timeout_secs: 30,
        }
    }
}

impl Settings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.listen_host, "0.0.0.0");
        assert_eq!(settings.firewall_path, PathBuf::from("./socks.conf"));
        assert_eq!(settings.connect_timeout(), Duration::from_secs(30));
    }
}
