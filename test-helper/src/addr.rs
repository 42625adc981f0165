use std::net::{SocketAddr, TcpListener};

/// Gets a new loopback address with a port allocated by the OS.
pub fn get_unused_addr() -> SocketAddr {
    let socket = TcpListener::bind("127.0.0.1:0").expect("Bind ephemeral port");
    socket.local_addr().expect("Read ephemeral address")
}

/// Gets `n` distinct loopback addresses.
///
/// All listeners are held until every port is allocated so the OS
/// cannot hand out the same port twice.
pub fn get_unused_addrs(n: usize) -> Vec<SocketAddr> {
    let listeners = (0..n)
        .map(|_| TcpListener::bind("127.0.0.1:0").expect("Bind ephemeral port"))
        .collect::<Vec<_>>();

    listeners
        .iter()
        .map(|l| l.local_addr().expect("Read ephemeral address"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_unused_addr() {
        let addr = get_unused_addr();
        TcpListener::bind(addr).expect("Bind to allocated address");
    }

    #[test]
    fn test_get_unused_addrs_are_distinct() {
        let mut addrs = get_unused_addrs(4);
        addrs.sort();
        addrs.dedup();
        assert_eq!(addrs.len(), 4);
    }
}
