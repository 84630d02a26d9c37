use std::{fmt, net::SocketAddr};

use crate::messages::ClientIdentity;

/// Who is on the other end of a server circuit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub address: SocketAddr,
    pub client: ClientIdentity,
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.client, self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Read,
    Write,
    Monitor,
    Rpc,
    /// Fetch only the type of a PV
    Info,
}

/// Decides which clients may do what to which PVs.
///
/// A denial is reported to the client as a failed request; the connection
/// stays open.
pub trait Authorization: Send + Sync + 'static {
    fn check(&self, peer: &PeerIdentity, channel: &str, operation: Operation) -> bool;
}

impl<F> Authorization for F
where
    F: Fn(&PeerIdentity, &str, Operation) -> bool + Send + Sync + 'static,
{
    fn check(&self, peer: &PeerIdentity, channel: &str, operation: Operation) -> bool {
        self(peer, channel, operation)
    }
}

/// Allows everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorization for AllowAll {
    fn check(&self, _peer: &PeerIdentity, _channel: &str, _operation: Operation) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_authorization() {
        let read_only = |_: &PeerIdentity, _: &str, op: Operation| {
            matches!(op, Operation::Read | Operation::Monitor | Operation::Info)
        };
        let peer = PeerIdentity {
            address: "127.0.0.1:40000".parse().unwrap(),
            client: ClientIdentity::Ca {
                user: "operator".to_owned(),
                host: "console".to_owned(),
            },
        };
        assert!(read_only.check(&peer, "demo", Operation::Read));
        assert!(!read_only.check(&peer, "demo", Operation::Write));
        assert!(AllowAll.check(&peer, "demo", Operation::Rpc));
        assert_eq!(peer.to_string(), "operator@console (127.0.0.1:40000)");
    }
}
