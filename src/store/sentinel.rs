//! Primary discovery through a list of sentinel endpoints.
//!
//! Each sentinel tracks which replica currently holds the primary role.
//! Discovery asks the endpoints in configuration order and takes the first
//! answer; endpoints that are down or undecided are skipped with a warning.

use tracing::{debug, warn};

use crate::store::config::split_host_port;
use crate::store::connection::RespConnection;
use crate::store::{StoreConfig, StoreError};

/// Resolve the current primary as `host:port`.
pub async fn discover_primary(config: &StoreConfig) -> Result<String, StoreError> {
    for endpoint in &config.sentinels {
        let Some((host, port)) = split_host_port(endpoint) else {
            warn!(endpoint = %endpoint, "skipping malformed sentinel endpoint");
            continue;
        };

        match ask_sentinel(host, port, config).await {
            Ok(primary) => {
                debug!(sentinel = %endpoint, primary = %primary, "primary discovered");
                return Ok(primary);
            }
            Err(error) => {
                warn!(sentinel = %endpoint, error = %error, "sentinel did not answer");
            }
        }
    }

    Err(StoreError::Discovery(format!(
        "no sentinel could name a primary for {:?}",
        config.master_name
    )))
}

async fn ask_sentinel(host: &str, port: u16, config: &StoreConfig) -> Result<String, StoreError> {
    // Sentinel endpoints speak plain RESP even when the data plane uses TLS.
    let mut conn = RespConnection::connect(host, port, false, config.command_timeout).await?;

    let reply = conn
        .command(&[
            "SENTINEL",
            "get-master-addr-by-name",
            config.master_name.as_str(),
        ])
        .await?
        .into_array()?;

    let mut parts = reply.into_iter();
    let (Some(host_reply), Some(port_reply)) = (parts.next(), parts.next()) else {
        return Err(StoreError::Discovery(format!(
            "sentinel has no primary registered under {:?}",
            config.master_name
        )));
    };

    let primary_host = host_reply
        .into_optional_string()?
        .ok_or_else(|| StoreError::Discovery("sentinel returned a nil host".to_string()))?;
    let primary_port = port_reply
        .into_optional_string()?
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or_else(|| StoreError::Discovery("sentinel returned an invalid port".to_string()))?;

    Ok(format!("{primary_host}:{primary_port}"))
}
