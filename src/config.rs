use anyhow::{bail, Context, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use crate::resize::DEFAULT_MAX_DIMENSION;

/// Process-wide settings, resolved once before the server starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    /// Identifier of the pretrained model, used for logging.
    pub model_id: String,
    pub model_path: PathBuf,
    pub max_dimension: u32,
    pub max_upload_bytes: u64,
    pub log_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 7000,
            model_id: "briaai/RMBG-1.4".to_string(),
            model_path: PathBuf::from("models/model.onnx"),
            max_dimension: DEFAULT_MAX_DIMENSION,
            max_upload_bytes: 64 * 1024 * 1024,
            log_file: PathBuf::from("app_logs.log"),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup` on top of the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(host) = parse(&lookup, "RMBG_HOST")? {
            config.host = host;
        }
        if let Some(port) = parse(&lookup, "RMBG_PORT")? {
            config.port = port;
        }
        if let Some(model_id) = lookup("RMBG_MODEL_ID") {
            config.model_id = model_id;
        }
        if let Some(model_path) = lookup("RMBG_MODEL_PATH") {
            config.model_path = PathBuf::from(model_path);
        }
        if let Some(max_dimension) = parse(&lookup, "RMBG_MAX_DIMENSION")? {
            config.max_dimension = max_dimension;
        }
        if let Some(max_upload_bytes) = parse(&lookup, "RMBG_MAX_UPLOAD_BYTES")? {
            config.max_upload_bytes = max_upload_bytes;
        }
        if let Some(log_file) = lookup("RMBG_LOG_FILE") {
            config.log_file = PathBuf::from(log_file);
        }

        if config.max_dimension == 0 {
            bail!("RMBG_MAX_DIMENSION must be greater than zero");
        }

        Ok(config)
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

fn parse<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => {
            let value = raw
                .trim()
                .parse::<T>()
                .with_context(|| format!("invalid value for {}: {:?}", key, raw))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_bind_all_interfaces_on_7000() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.addr(), "0.0.0.0:7000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.max_dimension, 1024);
        assert_eq!(config.log_file, PathBuf::from("app_logs.log"));
    }

    #[test]
    fn overrides_are_applied() {
        let config = Config::from_lookup(lookup_from(&[
            ("RMBG_HOST", "127.0.0.1"),
            ("RMBG_PORT", "8080"),
            ("RMBG_MODEL_PATH", "/srv/rmbg.onnx"),
            ("RMBG_MAX_DIMENSION", " 512 "),
            ("RMBG_LOG_FILE", "/tmp/rmbg.log"),
        ]))
        .unwrap();

        assert_eq!(config.addr(), "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.model_path, PathBuf::from("/srv/rmbg.onnx"));
        assert_eq!(config.max_dimension, 512);
        assert_eq!(config.log_file, PathBuf::from("/tmp/rmbg.log"));
        assert_eq!(config.model_id, "briaai/RMBG-1.4");
    }

    #[test]
    fn malformed_value_names_the_variable() {
        let err = Config::from_lookup(lookup_from(&[("RMBG_PORT", "seven")])).unwrap_err();
        assert!(err.to_string().contains("RMBG_PORT"));
    }

    #[test]
    fn zero_max_dimension_is_rejected() {
        assert!(Config::from_lookup(lookup_from(&[("RMBG_MAX_DIMENSION", "0")])).is_err());
    }
}
