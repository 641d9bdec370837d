// Copyright (C) 2026 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::time::Duration;

use tracing::trace;

/// Bound on a single liveness probe of the external port.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Whether something is bound to and accepting on `ip:port`, judged by a TCP connect that gives
/// up after `timeout`.
pub fn port_accepts_connections(ip: IpAddr, port: u16, timeout: Duration) -> bool {
    let target = probe_target(SocketAddr::new(ip, port));
    match TcpStream::connect_timeout(&target, timeout) {
        Ok(_) => true,
        Err(e) => {
            trace!(%target, error = %e, "Probe connect failed");
            false
        }
    }
}

/// Wildcard bind addresses cannot be connected to portably; probe the matching loopback instead.
pub fn probe_target(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}
