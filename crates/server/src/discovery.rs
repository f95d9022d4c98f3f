//! Advertise-address derivation for clustered deployments.

pub const POD_IP_ENV: &str = "POD_IP";
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";

/// Resolve the address peers should reach this node at: the explicit flag
/// wins, otherwise `POD_IP` plus the listen port.
pub fn advertise_addr(
    explicit: Option<&str>,
    pod_ip: Option<&str>,
    listen_addr: &str,
) -> anyhow::Result<String> {
    if let Some(addr) = explicit {
        if !addr.is_empty() {
            return Ok(addr.to_string());
        }
    }
    let pod_ip = pod_ip
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| anyhow::anyhow!("advertise address or POD_IP env is not set"))?;
    let port = listen_port(listen_addr)?;
    Ok(format!("{pod_ip}:{port}"))
}

fn listen_port(addr: &str) -> anyhow::Result<u16> {
    let (_, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("invalid listen address {addr:?}"))?;
    port.parse()
        .map_err(|_| anyhow::anyhow!("invalid port in listen address {addr:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_flag_wins() {
        let addr = advertise_addr(Some("10.1.2.3:9094"), Some("10.0.0.1"), "0.0.0.0:9094");
        assert_eq!(addr.unwrap(), "10.1.2.3:9094");
    }

    #[test]
    fn pod_ip_with_listen_port() {
        let addr = advertise_addr(None, Some("10.0.0.7"), "0.0.0.0:9094");
        assert_eq!(addr.unwrap(), "10.0.0.7:9094");
    }

    #[test]
    fn missing_both_is_an_error() {
        assert!(advertise_addr(None, None, "0.0.0.0:9094").is_err());
        assert!(advertise_addr(Some(""), Some(""), "0.0.0.0:9094").is_err());
    }

    #[test]
    fn bad_listen_address_is_an_error() {
        assert!(advertise_addr(None, Some("10.0.0.7"), "no-port").is_err());
        assert!(advertise_addr(None, Some("10.0.0.7"), "host:abc").is_err());
    }
}
