use std::net::SocketAddr;

use anyhow::anyhow;

use super::Config;

/// Rejects configurations the gateway cannot start with.
pub fn check_config(config: &Config) -> Result<(), anyhow::Error> {
    if config.listen.parse::<SocketAddr>().is_err() {
        return Err(anyhow!(
            "`listen` must be a socket address, got {:?}",
            config.listen
        ));
    }

    if config.refresh_time == 0 {
        return Err(anyhow!("`refresh_time` must be greater than zero"));
    }

    if !config.srv_prefix.starts_with('/') || !config.srv_prefix.ends_with('/') {
        return Err(anyhow!(
            "`srv_prefix` must start and end with '/', got {:?}",
            config.srv_prefix
        ));
    }

    for pattern in &config.docker_clear_exc {
        regex::Regex::new(pattern)
            .map_err(|err| anyhow!("`docker_clear_exc` pattern {pattern:?} is invalid: {err}"))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(check_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_refresh_rejected() {
        let config = Config {
            refresh_time: 0,
            ..Config::default()
        };
        assert!(check_config(&config).is_err());
    }

    #[test]
    fn test_srv_prefix_shape() {
        let config = Config {
            srv_prefix: "_s".to_string(),
            ..Config::default()
        };
        assert!(check_config(&config).is_err());
    }
}
