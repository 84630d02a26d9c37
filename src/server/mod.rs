//! Serve PVs to PV Access clients.
//!
//! A [`Server`] answers searches for the PVs it holds, accepts client
//! connections, and announces itself with beacons. Values are published
//! through the [`ServerPV`] handles returned when creating PVs:
//!
//! ```no_run
//! # use pvars::{pvdata::{PvStructure, Structure}, server::ServerBuilder};
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let server = ServerBuilder::new().start().await?;
//! let pv = server.create_pv(
//!     "DEMO:VALUE",
//!     PvStructure::from_value(Structure::new().with("value", 3.13))?,
//! )?;
//! pv.update(Structure::new().with("value", 4.13))?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod circuit;
mod pv;
mod search;

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    net::{TcpListener, UdpSocket},
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, error, info, trace, warn};

pub use auth::{AllowAll, Authorization, Operation, PeerIdentity};
pub use pv::{PvError, RpcHandler, ServerPV, WriteHandler};
pub use search::{SearchDecision, SearchHandler};

use crate::{
    messages::{Beacon, Guid},
    pvdata::PvStructure,
    utils::{
        get_default_beacon_period, get_default_broadcast_port, get_default_connection_timeout,
        get_default_server_port, get_target_broadcast_ips, new_reusable_udp_socket,
        wrapping_inplace_add,
    },
};

use pv::PvRegistry;
use search::{SearchResponder, answer_searches};

/// What every connection of a server needs to reach
pub(crate) struct ServerShared {
    pub registry: Arc<PvRegistry>,
    pub responder: SearchResponder,
    pub authorization: Arc<dyn Authorization>,
    pub connection_timeout: Duration,
    pub cancel: CancellationToken,
}

pub struct ServerBuilder {
    connection_port: u16,
    search_port: u16,
    beacon_port: u16,
    beacon_addresses: Option<Vec<SocketAddr>>,
    beacons: bool,
    beacon_period: Duration,
    connection_timeout: Duration,
    search_handler: Option<Arc<dyn SearchHandler>>,
    authorization: Arc<dyn Authorization>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        ServerBuilder {
            connection_port: get_default_server_port(),
            search_port: get_default_broadcast_port(),
            beacon_port: get_default_broadcast_port(),
            beacon_addresses: None,
            beacons: true,
            beacon_period: Duration::from_secs_f32(get_default_beacon_period()),
            connection_timeout: Duration::from_secs_f32(get_default_connection_timeout()),
            search_handler: None,
            authorization: Arc::new(AllowAll),
        }
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        ServerBuilder::default()
    }
    /// TCP port to accept clients on. 0 picks a free port.
    pub fn connection_port(mut self, port: u16) -> Self {
        self.connection_port = port;
        self
    }
    /// UDP port to listen for searches on. 0 picks a free port.
    pub fn search_port(mut self, port: u16) -> Self {
        self.search_port = port;
        self
    }
    pub fn beacon_port(mut self, port: u16) -> Self {
        self.beacon_port = port;
        self
    }
    /// Send beacons here instead of the local broadcast addresses
    pub fn beacon_addresses(mut self, addresses: Vec<SocketAddr>) -> Self {
        self.beacon_addresses = Some(addresses);
        self
    }
    pub fn beacons(mut self, enable: bool) -> Self {
        self.beacons = enable;
        self
    }
    pub fn beacon_period(mut self, period: Duration) -> Self {
        self.beacon_period = period;
        self
    }
    /// Close connections to clients that are silent for this long
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }
    pub fn search_handler(mut self, handler: impl SearchHandler) -> Self {
        self.search_handler = Some(Arc::new(handler));
        self
    }
    pub fn authorization(mut self, authorization: impl Authorization) -> Self {
        self.authorization = Arc::new(authorization);
        self
    }

    pub async fn start(self) -> io::Result<Server> {
        let cancel = CancellationToken::new();
        let guid = Guid::random();
        let registry = Arc::new(PvRegistry::default());

        let listener = TcpListener::bind(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            self.connection_port,
        ))
        .await?;
        let connection_port = listener.local_addr()?.port();
        let search_socket =
            new_reusable_udp_socket(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), self.search_port))?;
        let search_port = search_socket.local_addr()?.port();
        info!("Server {guid} listening on TCP {connection_port}, searches on UDP {search_port}");

        let responder = SearchResponder {
            guid,
            connection_port,
            registry: registry.clone(),
            handler: self.search_handler,
        };
        let shared = Arc::new(ServerShared {
            registry,
            responder: responder.clone(),
            authorization: self.authorization,
            connection_timeout: self.connection_timeout,
            cancel: cancel.clone(),
        });

        tokio::spawn(accept_clients(listener, shared.clone()));

        let stop = cancel.clone();
        tokio::spawn(async move {
            select! {
                _ = stop.cancelled() => (),
                _ = answer_searches(search_socket, responder) => (),
            }
        });

        if self.beacons {
            let addresses = self
                .beacon_addresses
                .unwrap_or_else(|| get_target_broadcast_ips(self.beacon_port));
            let socket = UdpSocket::bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)).await?;
            socket.set_broadcast(true)?;
            tokio::spawn(send_beacons(
                socket,
                addresses,
                self.beacon_period,
                guid,
                connection_port,
                shared.clone(),
            ));
        }

        Ok(Server {
            shared,
            guid,
            connection_port,
            search_port,
        })
    }
}

async fn accept_clients(listener: TcpListener, shared: Arc<ServerShared>) {
    let next_id = AtomicU64::new(1);
    loop {
        let (stream, address) = select! {
            _ = shared.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {e}");
                    continue;
                }
            },
        };
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        debug!("Accepted connection {id} from {address}");
        tokio::spawn(circuit::serve_client(stream, address, id, shared.clone()));
    }
    debug!("Stopped accepting connections");
}

async fn send_beacons(
    socket: UdpSocket,
    addresses: Vec<SocketAddr>,
    period: Duration,
    guid: Guid,
    connection_port: u16,
    shared: Arc<ServerShared>,
) {
    let mut sequence = 0u8;
    let mut interval = tokio::time::interval(period);
    async move {
        loop {
            select! {
                _ = shared.cancel.cancelled() => break,
                _ = interval.tick() => (),
            }
            let beacon = Beacon {
                guid,
                flags: 0,
                sequence: wrapping_inplace_add(&mut sequence),
                change_count: shared.registry.change_count(),
                server_address: Ipv4Addr::UNSPECIFIED.into(),
                server_port: connection_port,
                protocol: "tcp".to_owned(),
            };
            trace!("Sending beacon {}", beacon.sequence);
            let data = beacon.to_frame().to_bytes();
            for address in &addresses {
                if let Err(e) = socket.send_to(&data, address).await {
                    error!("Failed to send beacon to {address}: {e}");
                }
            }
        }
    }
    .instrument(debug_span!("beacons"))
    .await
}

/// A running PV Access server. Dropping it stops serving.
pub struct Server {
    shared: Arc<ServerShared>,
    guid: Guid,
    connection_port: u16,
    search_port: u16,
}

impl Server {
    /// Publish a read-only PV. Client writes are rejected.
    pub fn create_pv(&self, name: &str, value: PvStructure) -> Result<ServerPV, PvError> {
        self.shared.registry.insert(name, value, None, None)
    }

    /// Publish a PV that clients may write; `handler` decides what a write does
    pub fn create_pv_with_writer(
        &self,
        name: &str,
        value: PvStructure,
        handler: impl WriteHandler,
    ) -> Result<ServerPV, PvError> {
        self.shared
            .registry
            .insert(name, value, Some(Arc::new(handler)), None)
    }

    /// Publish a PV that only answers remote procedure calls
    pub fn create_rpc_pv(&self, name: &str, handler: impl RpcHandler) -> Result<ServerPV, PvError> {
        self.shared
            .registry
            .insert(name, PvStructure::empty(), None, Some(Arc::new(handler)))
    }

    pub fn pv(&self, name: &str) -> Option<ServerPV> {
        self.shared.registry.get(name)
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    pub fn connection_port(&self) -> u16 {
        self.connection_port
    }

    pub fn search_port(&self) -> u16 {
        self.search_port
    }

    /// Stop serving, closing every client connection
    pub fn stop(&self) {
        self.shared.cancel.cancel();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}
