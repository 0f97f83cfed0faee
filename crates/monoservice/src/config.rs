//! Application configuration

use std::env;
use std::path::PathBuf;

use crate::runtime::watcher::ReloadPolicy;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Folder watched for module files
    pub module_folder: PathBuf,

    /// Listen address, `host:port` or `:port`
    pub address: String,

    /// Upper bound on a single `process()` call, in seconds
    pub handler_timeout_secs: u64,

    /// How long in-flight requests may run after an interrupt, in seconds
    pub shutdown_grace_secs: u64,

    /// Maximum accepted request body size in bytes
    pub max_body_bytes: usize,

    /// Reload modules whose file is rewritten in place
    pub module_reload: bool,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            module_folder: env::var("MODULE_FOLDER")
                .map(PathBuf::from)
                .unwrap_or(defaults.module_folder),

            address: env::var("ADDRESS").unwrap_or(defaults.address),

            handler_timeout_secs: env::var("HANDLER_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.handler_timeout_secs),

            shutdown_grace_secs: env::var("SHUTDOWN_GRACE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.shutdown_grace_secs),

            max_body_bytes: env::var("MAX_BODY_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_body_bytes),

            module_reload: env::var("MODULE_RELOAD")
                .ok()
                .and_then(|s| parse_flag(&s))
                .unwrap_or(defaults.module_reload),
        }
    }

    /// Address in a form `TcpListener::bind` accepts; `:8880` binds every interface.
    pub fn listen_addr(&self) -> String {
        if self.address.starts_with(':') {
            format!("0.0.0.0{}", self.address)
        } else {
            self.address.clone()
        }
    }

    pub fn reload_policy(&self) -> ReloadPolicy {
        if self.module_reload {
            ReloadPolicy::ReloadOnWrite
        } else {
            ReloadPolicy::CreateOnly
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            module_folder: PathBuf::from("modules/"),
            address: ":8880".to_string(),
            handler_timeout_secs: 30,
            shutdown_grace_secs: 5,
            max_body_bytes: 1024 * 1024,
            module_reload: false,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
