use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// Config shorthand `":PORT"` means "bind on all interfaces"; `SocketAddr`
/// parsing and the Tokio bind APIs want an explicit host, so expand it.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Joins a host and port into a dialable address, bracketing bare IPv6
/// literals.
pub fn host_port(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::{host_port, normalize_bind_addr};

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":25565").as_ref(), "0.0.0.0:25565");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:25565").as_ref(),
            "127.0.0.1:25565"
        );
        assert_eq!(normalize_bind_addr("[::]:25565").as_ref(), "[::]:25565");
    }

    #[test]
    fn host_port_brackets_ipv6() {
        assert_eq!(host_port("10.0.0.1", 25565), "10.0.0.1:25565");
        assert_eq!(host_port("mc.example.com", 25565), "mc.example.com:25565");
        assert_eq!(host_port("2001:db8::1", 25565), "[2001:db8::1]:25565");
    }
}
