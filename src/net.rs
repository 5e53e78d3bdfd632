//! LAN address discovery for overlays, the control page and `/status`.

use std::io;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use crate::config::CamwatchConfig;

/// Public resolver used only to pick the outbound interface. No packet is sent:
/// connecting a UDP socket just fixes its route.
const ROUTE_PROBE: &str = "8.8.8.8:80";

/// Address of the interface that routes to the wider network.
pub fn outbound_ip() -> io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(ROUTE_PROBE)?;
    Ok(socket.local_addr()?.ip())
}

/// `outbound_ip`, or loopback when the host has no route.
pub fn local_ip() -> IpAddr {
    match outbound_ip() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(err) => {
            log::warn!("could not determine LAN address ({}); using 127.0.0.1", err);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// IP that viewers should use: the configured override, else the discovered one.
pub fn advertised_ip(cfg: &CamwatchConfig) -> String {
    match cfg.advertise_ip.as_deref().map(str::trim) {
        Some(ip) if !ip.is_empty() => ip.to_string(),
        _ => local_ip().to_string(),
    }
}
