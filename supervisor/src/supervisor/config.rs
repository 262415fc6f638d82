//! Daemon configuration
//!
//! The configuration file is `key = value` lines with `#`-prefixed
//! comments. Unknown keys are ignored; missing keys keep the compiled
//! defaults, and a missing file keeps all of them.
use std::fs;
use std::path::{Path, PathBuf};

/// Runtime configuration of the supervisor daemon
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for supervisor data
    pub home: PathBuf,
    /// Path to the Mission Configuration Table
    pub mct: PathBuf,
    /// Directory holding the partition config files
    pub xen_dir: PathBuf,
    /// Location of the hypervisor toolstack binary
    pub xl_bin: PathBuf,

    pub vms_enabled: bool,
    /// Seconds to wait before each telemetry connection attempt
    pub vms_connect_delay: f64,
    pub vms_connect_retries: u32,
    pub vms_address: String,
    pub vms_port: u16,
    pub vms_username: String,
    pub vms_password: String,
    pub vms_ssl_cert: Option<String>,
    pub vms_db_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home: "/etc/mcp".into(),
            mct: "/etc/mcp/mct.yaml".into(),
            xen_dir: "/etc/xen".into(),
            xl_bin: "/usr/sbin/xl".into(),
            vms_enabled: true,
            vms_connect_delay: 0.0,
            vms_connect_retries: 0,
            vms_address: "localhost".into(),
            vms_port: 3306,
            vms_username: "root".into(),
            vms_password: "root".into(),
            vms_ssl_cert: None,
            vms_db_name: "stepSATdb_Flight".into(),
        }
    }
}

impl Config {
    /// Reads a config file; a missing or unreadable file keeps the compiled
    /// defaults, like the original daemon
    pub fn load_or_default(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) => {
                warn!("unable to open MCP config {}: {e}", path.display());
                Self::default()
            }
        }
    }

    pub fn parse(text: &str) -> Self {
        let mut config = Self::default();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            match key {
                "home" => config.home = value.into(),
                "mct" => config.mct = value.into(),
                "xen" => config.xen_dir = value.into(),
                "xl" => config.xl_bin = value.into(),
                // Accept the common ways of spelling an enabled connection.
                "vms_enabled" => {
                    config.vms_enabled =
                        value.eq_ignore_ascii_case("true") || value.starts_with('1')
                }
                "vms_connect_delay" => {
                    if let Ok(delay) = value.parse() {
                        config.vms_connect_delay = delay;
                    }
                }
                "vms_connect_retries" => {
                    if let Ok(retries) = value.parse() {
                        config.vms_connect_retries = retries;
                    }
                }
                "vms_address" => config.vms_address = value.to_string(),
                "vms_port" => {
                    if let Ok(port) = value.parse() {
                        config.vms_port = port;
                    }
                }
                "vms_username" => config.vms_username = value.to_string(),
                "vms_password" => config.vms_password = value.to_string(),
                "vms_ssl_cert" => config.vms_ssl_cert = Some(value.to_string()),
                "vms_db_name" => config.vms_db_name = value.to_string(),
                _ => {}
            }
        }

        config
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.mct, PathBuf::from("/etc/mcp/mct.yaml"));
        assert_eq!(config.xl_bin, PathBuf::from("/usr/sbin/xl"));
        assert!(config.vms_enabled);
        assert_eq!(config.vms_connect_retries, 0);
        assert_eq!(config.vms_port, 3306);
        assert!(config.vms_ssl_cert.is_none());
    }

    #[test]
    fn parse_overrides_and_ignores_unknown_keys() {
        let config = Config::parse(
            "# supervisor config\n\
             home = /srv/mcp\n\
             mct = /srv/mcp/mission.yaml\n\
             xl = /usr/local/sbin/xl\n\
             vms_enabled = false\n\
             vms_connect_delay = 2.5\n\
             vms_connect_retries = 3\n\
             vms_port = 3307\n\
             vms_ssl_cert = /srv/mcp/ca.pem\n\
             no_such_key = whatever\n",
        );
        assert_eq!(config.home, PathBuf::from("/srv/mcp"));
        assert_eq!(config.mct, PathBuf::from("/srv/mcp/mission.yaml"));
        assert_eq!(config.xl_bin, PathBuf::from("/usr/local/sbin/xl"));
        assert!(!config.vms_enabled);
        assert_eq!(config.vms_connect_delay, 2.5);
        assert_eq!(config.vms_connect_retries, 3);
        assert_eq!(config.vms_port, 3307);
        assert_eq!(config.vms_ssl_cert.as_deref(), Some("/srv/mcp/ca.pem"));
        // Untouched keys keep their defaults.
        assert_eq!(config.vms_address, "localhost");
    }

    #[test]
    fn enabled_flag_spellings() {
        assert!(Config::parse("vms_enabled = TRUE").vms_enabled);
        assert!(Config::parse("vms_enabled = 1").vms_enabled);
        assert!(!Config::parse("vms_enabled = no").vms_enabled);
        assert!(!Config::parse("vms_enabled = 0").vms_enabled);
    }

    #[test]
    fn comments_and_blank_lines() {
        let config = Config::parse("\n# vms_port = 9999\n\n   # indented comment\n");
        assert_eq!(config.vms_port, 3306);
    }
}
