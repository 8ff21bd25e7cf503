use crate::codec::{MAX_ATTR_PAYLOAD, MIN_GENL_LEN};
use crate::socket::MAX_SOCKET_NAME;
use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_SOCKET_NAME: &str = "cvd-wifirouter";
pub const DEFAULT_FAMILY_NAME: &str = "MAC80211_HWSIM";
const CONFIG_CANDIDATES: &[&str] = &["wifirouter.yml", "/etc/wifirouter.yml"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouterConfig {
    /// Abstract-namespace name of the control socket.
    pub socket_name: String,
    pub family_name: String,
    pub backlog: i32,
    /// Largest client message accepted; bigger ones disconnect the client.
    pub max_client_message: usize,
    /// Receive buffer for kernel datagrams.
    pub kernel_buffer: usize,
    pub log_level: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            socket_name: DEFAULT_SOCKET_NAME.to_string(),
            family_name: DEFAULT_FAMILY_NAME.to_string(),
            backlog: 4,
            max_client_message: page_size(),
            kernel_buffer: 16 * 1024,
            log_level: "info".to_string(),
        }
    }
}

fn page_size() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n <= 0 { 4096 } else { n as usize }
}

impl RouterConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let cfg: RouterConfig = serde_yaml::from_str(text).context("invalid YAML")?;
        Ok(cfg)
    }

    pub fn load(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {path}"))?;
        Self::from_yaml(&text).with_context(|| format!("invalid config in {path}"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.socket_name.is_empty() {
            bail!("socket_name must not be empty");
        }
        if self.socket_name.len() > MAX_SOCKET_NAME {
            bail!(
                "socket_name is {} bytes, at most {MAX_SOCKET_NAME} allowed",
                self.socket_name.len()
            );
        }
        if self.family_name.is_empty() {
            bail!("family_name must not be empty");
        }
        if self.backlog <= 0 {
            bail!("backlog must be > 0");
        }
        if self.max_client_message < MIN_GENL_LEN {
            bail!("max_client_message must be at least {MIN_GENL_LEN}");
        }
        if self.kernel_buffer < MIN_GENL_LEN || self.kernel_buffer > MAX_ATTR_PAYLOAD {
            bail!("kernel_buffer must be within {MIN_GENL_LEN}..={MAX_ATTR_PAYLOAD}");
        }
        Ok(())
    }
}

/// Picks the config file: an explicit path must exist, otherwise the first
/// existing default location is used. `None` means run on defaults.
pub fn resolve_config_path(config: Option<String>) -> Result<Option<String>> {
    if let Some(path) = config {
        if !Path::new(&path).exists() {
            return Err(anyhow!("config file {path} does not exist"));
        }
        return Ok(Some(path));
    }
    Ok(CONFIG_CANDIDATES
        .iter()
        .find(|cand| Path::new(cand).exists())
        .map(|cand| (*cand).to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_deployment() {
        let cfg = RouterConfig::default();
        assert_eq!(cfg.socket_name, "cvd-wifirouter");
        assert_eq!(cfg.family_name, "MAC80211_HWSIM");
        assert_eq!(cfg.backlog, 4);
        assert!(cfg.max_client_message >= 4096);
        cfg.validate().unwrap();
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let cfg = RouterConfig::from_yaml("socket_name: vm-radio\nbacklog: 8\n").unwrap();
        assert_eq!(cfg.socket_name, "vm-radio");
        assert_eq!(cfg.backlog, 8);
        assert_eq!(cfg.family_name, DEFAULT_FAMILY_NAME);
        cfg.validate().unwrap();
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(RouterConfig::from_yaml("sokcet_name: typo\n").is_err());
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut cfg = RouterConfig {
            socket_name: String::new(),
            ..RouterConfig::default()
        };
        assert!(cfg.validate().is_err());
        cfg.socket_name = "x".repeat(MAX_SOCKET_NAME + 1);
        assert!(cfg.validate().is_err());
        cfg.socket_name = "ok".into();
        cfg.backlog = 0;
        assert!(cfg.validate().is_err());
        cfg.backlog = 4;
        cfg.kernel_buffer = MAX_ATTR_PAYLOAD + 1;
        assert!(cfg.validate().is_err());
        cfg.kernel_buffer = 4096;
        cfg.max_client_message = 8;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        assert!(resolve_config_path(Some("/nonexistent/wifirouter.yml".into())).is_err());
    }

    #[test]
    fn load_reads_file() {
        let path = std::env::temp_dir().join(format!("wifirouter-cfg-{}.yml", std::process::id()));
        std::fs::write(&path, "family_name: OTHER\nlog_level: debug\n").unwrap();
        let p = path.to_string_lossy().to_string();
        assert_eq!(resolve_config_path(Some(p.clone())).unwrap(), Some(p.clone()));
        let cfg = RouterConfig::load(&p).unwrap();
        assert_eq!(cfg.family_name, "OTHER");
        assert_eq!(cfg.log_level, "debug");
        std::fs::remove_file(&path).unwrap();
    }
}
