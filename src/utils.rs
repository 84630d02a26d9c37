use num::{FromPrimitive, traits::WrappingAdd};
use pnet::datalink;
use rand::Rng;
use socket2::{Domain, Protocol, Type};
use std::{
    env,
    io::{self},
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

pub(crate) fn new_reusable_udp_socket<T: ToSocketAddrs>(address: T) -> io::Result<UdpSocket> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr = address.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "No address to bind UDP socket")
    })?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(std::net::UdpSocket::from(socket))
}

/// Increments a mutable reference in place, and returns the original value
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + FromPrimitive + Copy>(value: &mut T) -> T {
    let id = *value;
    if let Some(one) = T::from_u8(1) {
        *value = value.wrapping_add(&one);
    }
    id
}

/// Get the server TCP port, either from environment or default 5075
pub fn get_default_server_port() -> u16 {
    env::var("EPICS_PVA_SERVER_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(5075u16)
        .max(1024u16)
}

/// Get the UDP search and beacon port, either from environment or default 5076
pub fn get_default_broadcast_port() -> u16 {
    env::var("EPICS_PVA_BROADCAST_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(5076u16)
        .max(1024u16)
}

/// Resolve a whitespace-separated list of `host[:port]` entries
fn parse_address_list(addr_list: &str, default_port: u16) -> Vec<SocketAddr> {
    let mut ips = Vec::new();
    for add in addr_list.split_ascii_whitespace() {
        let resolved = if add.contains(':') {
            add.to_socket_addrs()
        } else {
            (add, default_port).to_socket_addrs()
        };
        match resolved {
            Ok(addr) => {
                debug!("Adding search IP: {add} => {addr:?}");
                ips.extend(addr);
            }
            Err(e) => {
                warn!("Failed to convert '{add}' to address: {e}");
                continue;
            }
        }
    }
    ips
}

/// Get the target list of broadcast IPs, by reading the environment and interfaces
///
/// Hostnames are resolved if in the environment setting, so this will re-resolve
pub fn get_target_broadcast_ips(default_search_port: u16) -> Vec<SocketAddr> {
    let mut ips = Vec::new();
    // Work out if we want to automatically include all local broadcast
    let use_auto_address = env::var("EPICS_PVA_AUTO_ADDR_LIST")
        .map(|v| !v.eq_ignore_ascii_case("no") && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(true);
    if use_auto_address {
        ips.extend(
            datalink::interfaces()
                .into_iter()
                .filter(|i| !i.is_loopback())
                .flat_map(|i| i.ips.into_iter())
                .filter(|i| i.is_ipv4())
                .flat_map(|f| (f.broadcast(), default_search_port).to_socket_addrs())
                .flatten(),
        );
    }
    if let Ok(addr_list) = env::var("EPICS_PVA_ADDR_LIST") {
        ips.extend(parse_address_list(&addr_list, default_search_port));
    }
    ips
}

/// Name servers to send searches to over TCP
pub fn get_name_servers(default_server_port: u16) -> Vec<SocketAddr> {
    env::var("EPICS_PVA_NAME_SERVERS")
        .map(|list| parse_address_list(&list, default_server_port))
        .unwrap_or_default()
}

pub fn get_default_connection_timeout() -> f32 {
    env::var("EPICS_PVA_CONN_TMO")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30.0f32)
        .max(0.1f32)
}

pub fn get_default_beacon_period() -> f32 {
    env::var("EPICS_PVA_BEACON_PERIOD")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(15.0f32)
        .max(0.1f32)
}

pub fn get_default_max_search_interval() -> f32 {
    env::var("EPICS_PVA_MAX_SEARCH_PERIOD")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30.0f32)
        .max(1f32)
}

/// Capped exponential backoff with jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    /// Fraction of each delay randomly added or removed
    pub jitter: f32,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs_f32(get_default_max_search_interval()),
            jitter: 0.1,
        }
    }
}

impl Backoff {
    /// The delay before the attempt after `attempt` previous ones, without jitter
    pub fn nominal(&self, attempt: u32) -> Duration {
        self.initial
            .saturating_mul(2u32.saturating_pow(attempt.min(31)))
            .min(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal(attempt);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let factor = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        nominal.mul_f32((1.0 + factor).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapping_add() {
        let mut i = 3u32;
        assert_eq!(wrapping_inplace_add(&mut i), 3);
        assert_eq!(i, 4);
        let mut i = 255u8;
        assert_eq!(wrapping_inplace_add(&mut i), 255);
        assert_eq!(i, 0);
    }

    #[test]
    fn test_backoff_schedule() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.0,
        };
        let schedule: Vec<_> = (0..4).map(|n| backoff.delay(n).as_millis()).collect();
        assert_eq!(schedule, vec![100, 200, 400, 800]);
        assert_eq!(backoff.delay(9), Duration::from_millis(30_000));
        assert_eq!(backoff.delay(200), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let backoff = Backoff {
            initial: Duration::from_millis(1000),
            max: Duration::from_secs(30),
            jitter: 0.1,
        };
        for _ in 0..50 {
            let delay = backoff.delay(0);
            assert!(delay >= Duration::from_millis(899) && delay <= Duration::from_millis(1101));
        }
    }

    #[test]
    fn test_parse_address_list() {
        let addresses = parse_address_list("127.0.0.1 127.0.0.2:6000", 5076);
        assert_eq!(
            addresses,
            vec![
                "127.0.0.1:5076".parse().unwrap(),
                "127.0.0.2:6000".parse().unwrap()
            ]
        );
    }
}
