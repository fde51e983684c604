use cfs_core::{CfsError, ClientConfig, Result};

/// Default config file looked up when no path is given; any of the formats
/// the `config` crate knows (`cfs.yaml`, `cfs.toml`, `cfs.json`) works.
const DEFAULT_CONFIG_NAME: &str = "cfs";

/// Build the client settings from defaults, then the config file, then
/// `CFS_*` environment variables.
///
/// An explicit `path` has to exist; the default file is optional.
pub fn load(path: Option<&str>) -> Result<ClientConfig> {
    let defaults = ::config::Config::try_from(&ClientConfig::default())
        .map_err(|e| CfsError::Config(e.to_string()))?;

    let file = match path {
        Some(path) => ::config::File::with_name(path).required(true),
        None => ::config::File::with_name(DEFAULT_CONFIG_NAME).required(false),
    };

    let settings = ::config::Config::builder()
        .add_source(defaults)
        .add_source(file)
        .add_source(::config::Environment::with_prefix("CFS"))
        .build()
        .map_err(|e| CfsError::Config(e.to_string()))?;

    let config: ClientConfig = settings
        .try_deserialize()
        .map_err(|e| CfsError::Config(e.to_string()))?;

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "metadata_addr: \"10.1.0.5:10002\"").unwrap();
        writeln!(file, "flush_queue_depth: 4").unwrap();

        let config = load(file.path().to_str()).unwrap();
        assert_eq!(config.metadata_addr, "10.1.0.5:10002");
        assert_eq!(config.flush_queue_depth, 4);
        assert_eq!(
            config.volume_manager_addr,
            ClientConfig::default().volume_manager_addr
        );
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let result = load(Some("/nonexistent/cfs-client.yaml"));
        assert!(matches!(result, Err(CfsError::Config(_))));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "transfer_unit: 0").unwrap();

        assert!(load(file.path().to_str()).is_err());
    }
}
