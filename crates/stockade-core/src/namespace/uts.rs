//! UTS namespace hostname setting.

use stockade_common::constants::HOST_NAME_MAX;
use stockade_common::error::{Result, StockadeError};

/// Sets the hostname of the calling UTS namespace.
///
/// # Errors
///
/// Returns [`StockadeError::Config`] for an empty or over-long name, or
/// [`StockadeError::Namespace`] if `sethostname(2)` fails.
pub fn set_hostname(hostname: &str) -> Result<()> {
    validate_hostname(hostname)?;
    nix::unistd::sethostname(hostname).map_err(|e| StockadeError::Namespace {
        message: format!("sethostname {hostname} failed: {e}"),
    })?;
    tracing::debug!(hostname, "hostname set");
    Ok(())
}

fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() {
        return Err(StockadeError::Config {
            message: "hostname must not be empty".into(),
        });
    }
    if hostname.len() > HOST_NAME_MAX {
        return Err(StockadeError::Config {
            message: format!("hostname exceeds {HOST_NAME_MAX} bytes"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_hostname_is_rejected() {
        assert!(matches!(
            set_hostname(""),
            Err(StockadeError::Config { .. })
        ));
    }

    #[test]
    fn long_hostname_is_rejected() {
        let name = "h".repeat(HOST_NAME_MAX + 1);
        assert!(matches!(
            set_hostname(&name),
            Err(StockadeError::Config { .. })
        ));
    }

    #[test]
    fn max_length_hostname_is_valid() {
        assert!(validate_hostname(&"h".repeat(HOST_NAME_MAX)).is_ok());
    }
}
