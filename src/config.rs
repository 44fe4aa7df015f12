use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{self, BufReader},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PkciConfigError {
    #[error("cannot load config file")]
    Load(#[from] io::Error),
    #[error("cannot parse config file")]
    Parse(#[from] serde_yaml::Error),
    #[error("unsupported config kind")]
    KindNotSupported,
    #[error("unsupported config api version")]
    VersionNotSupported,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[allow(non_snake_case)]
pub struct PkciConfig {
    /// The api version of the pkci config file
    pub apiVersion: String,
    /// The kind of the pkci config file
    pub kind: String,
    /// The pkci api configuration
    pub api: PkciApiConfig,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct PkciApiConfig {
    /// The host on which the status API server will listen
    #[serde(default = "default_web_host")]
    pub web_host: String,
    /// The port on which the status API server will listen
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    /// Directory of hypervisor VM descriptor files
    #[serde(default = "default_descriptor_dir")]
    pub descriptor_dir: String,
    /// Directory under which each worker's config/lease/log files are written
    #[serde(default = "default_worker_dir")]
    pub worker_dir: String,
    /// Seconds between reconciliation ticks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_web_host() -> String {
    String::from("0.0.0.0")
}

fn default_web_port() -> u16 {
    8080
}

fn default_descriptor_dir() -> String {
    String::from("/etc/pve/local/qemu-server")
}

fn default_worker_dir() -> String {
    String::from("/etc/pkci")
}

fn default_poll_interval() -> u64 {
    30
}

impl PkciConfig {
    /// Load a PkciConfig from a file.
    ///
    /// Arguments:
    ///
    /// * `path`: The path to the config file.
    ///
    /// Returns:
    ///
    /// A Result<PkciConfig>
    pub fn load(path: &str) -> Result<Self> {
        let file = File::open(path).map_err(PkciConfigError::Load)?;
        let reader = BufReader::new(file);
        let mut config: PkciConfig =
            serde_yaml::from_reader(reader).map_err(PkciConfigError::Parse)?;

        if config.kind != "Config" {
            return Err(PkciConfigError::KindNotSupported.into());
        }

        if config.apiVersion != "pkci.io/v1alpha1" {
            return Err(PkciConfigError::VersionNotSupported.into());
        }

        // VM_CHECK_POLL, when set, overrides the file's poll_interval_secs (§6).
        if let Ok(poll_env) = std::env::var("VM_CHECK_POLL") {
            if let Ok(poll_secs) = poll_env.parse::<u64>() {
                config.api.poll_interval_secs = poll_secs;
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let file = write_config(
            "apiVersion: pkci.io/v1alpha1\nkind: Config\napi: {}\n",
        );
        let config = PkciConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.api.web_port, 8080);
        assert_eq!(config.api.poll_interval_secs, 30);
        assert_eq!(config.api.descriptor_dir, "/etc/pve/local/qemu-server");
    }

    #[test]
    fn rejects_wrong_api_version() {
        let file = write_config("apiVersion: other/v1\nkind: Config\napi: {}\n");
        assert!(PkciConfig::load(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn rejects_wrong_kind() {
        let file = write_config("apiVersion: pkci.io/v1alpha1\nkind: Other\napi: {}\n");
        assert!(PkciConfig::load(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn env_override_wins_over_file_value() {
        let file = write_config(
            "apiVersion: pkci.io/v1alpha1\nkind: Config\napi:\n  poll_interval_secs: 60\n",
        );
        std::env::set_var("VM_CHECK_POLL", "5");
        let config = PkciConfig::load(file.path().to_str().unwrap()).unwrap();
        std::env::remove_var("VM_CHECK_POLL");
        assert_eq!(config.api.poll_interval_secs, 5);
    }
}
