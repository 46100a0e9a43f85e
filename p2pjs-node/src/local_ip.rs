//! This node's own address, as advertised in job queries.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Configured address if set, else the address of the outbound interface.
pub fn resolve(configured: Option<&str>) -> String {
    if let Some(ip) = configured {
        return ip.to_owned();
    }
    match outbound_interface() {
        Ok(ip) => ip.to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "cannot determine local address, advertising loopback");
            Ipv4Addr::LOCALHOST.to_string()
        }
    }
}

/// Connecting a UDP socket picks a route without sending anything.
fn outbound_interface() -> std::io::Result<IpAddr> {
    let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    sock.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
    Ok(sock.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_address_wins() {
        assert_eq!(resolve(Some("10.9.8.7")), "10.9.8.7");
    }

    #[test]
    fn detected_address_parses() {
        let ip = resolve(None);
        assert!(ip.parse::<IpAddr>().is_ok());
    }
}
