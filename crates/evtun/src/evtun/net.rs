use std::net::{IpAddr, SocketAddr};

pub const DEFAULT_SERVER_PORT: u16 = 9000;

/// Normalize the tunnel server address into something `TcpStream::connect` accepts.
///
/// - `":PORT"` means the server on this host (`127.0.0.1:PORT`).
/// - A bare host or IP gets [`DEFAULT_SERVER_PORT`]; a bare IPv6 literal is bracketed.
pub fn normalize_server_addr(addr: &str) -> String {
    let addr = addr.trim();
    if addr.is_empty() {
        return format!("127.0.0.1:{DEFAULT_SERVER_PORT}");
    }
    if addr.parse::<SocketAddr>().is_ok() {
        return addr.to_string();
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return SocketAddr::new(ip, DEFAULT_SERVER_PORT).to_string();
    }
    if let Some(port) = addr.strip_prefix(':').and_then(|p| p.parse::<u16>().ok()) {
        return format!("127.0.0.1:{port}");
    }
    if addr.starts_with('[') && addr.ends_with(']') {
        return format!("{addr}:{DEFAULT_SERVER_PORT}");
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => addr.to_string(),
        _ => format!("{addr}:{DEFAULT_SERVER_PORT}"),
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_server_addr;

    #[test]
    fn port_only_and_empty() {
        assert_eq!(normalize_server_addr(":9100"), "127.0.0.1:9100");
        assert_eq!(normalize_server_addr("  "), "127.0.0.1:9000");
    }

    #[test]
    fn default_port_is_added() {
        assert_eq!(normalize_server_addr("tunnel.example"), "tunnel.example:9000");
        assert_eq!(normalize_server_addr("10.1.2.3"), "10.1.2.3:9000");
        assert_eq!(normalize_server_addr("::1"), "[::1]:9000");
        assert_eq!(normalize_server_addr("[::1]"), "[::1]:9000");
    }

    #[test]
    fn bare_ipv6_is_not_port_shorthand() {
        assert_eq!(normalize_server_addr("::1"), "[::1]:9000");
        assert_eq!(normalize_server_addr("::"), "[::]:9000");
        assert_eq!(normalize_server_addr(" ::ffff:10.0.0.1 "), "[::ffff:10.0.0.1]:9000");
    }

    #[test]
    fn explicit_port_passthrough() {
        assert_eq!(normalize_server_addr(" tunnel.example:7 "), "tunnel.example:7");
        assert_eq!(normalize_server_addr("127.0.0.1:9001"), "127.0.0.1:9001");
        assert_eq!(normalize_server_addr("[::1]:9001"), "[::1]:9001");
    }
}
