pub struct Utils;

impl Utils {
    /// Parse an address:port string.
    ///
    /// Handles multiple address formats:
    /// - IPv4: "127.0.0.1:3000" or "*:8080"
    /// - IPv6: "\[::1]:3000" or "\[fe80::1]:8080"
    /// - Interface-scoped: "127.0.0.53%lo:53" or "\[fe80::1]%eth0:546"
    pub fn parse_address(address: &str) -> Option<(String, u16)> {
        let (addr, port_str) = address.rsplit_once(':')?;
        let port: u16 = port_str.parse().ok()?;
        let addr = if addr.is_empty() { "*" } else { addr };
        Some((addr.to_string(), port))
    }

    /// Parse a `/proc/net/*` hex endpoint ("0100007F:1F90") and return its port.
    pub fn parse_hex_port(endpoint: &str) -> Option<u16> {
        let (_, port_hex) = endpoint.rsplit_once(':')?;
        u16::from_str_radix(port_hex, 16).ok()
    }
}
