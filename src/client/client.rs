use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{
    io, select,
    sync::{Semaphore, broadcast, mpsc, watch},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, trace, warn};

use crate::{
    client::{
        Searcher, SearcherBuilder,
        circuit::{Circuit, CircuitConfig},
        searcher::{CouldNotFindError, SearchResult, ServerInfo},
        subscription::{Delivery, MonitorEvent, SenderPair, Subscription},
    },
    messages::{self, Beacon, ClientIdentity, Command, Guid, MessageError, Status},
    pvdata::{ConversionError, DecodeError, PvStructure, TypeDescriptor, TypeMismatch, Value},
    request::{FieldRequest, Projection, RequestError},
    utils::{
        Backoff, get_default_broadcast_port, get_default_connection_timeout, get_name_servers,
        get_default_server_port, new_reusable_udp_socket,
    },
};

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("{0}")]
    IO(#[from] io::Error),
    #[error("{0}")]
    PVNotFoundError(#[from] CouldNotFindError),
    #[error("Failed to parse message from server")]
    ServerSentInvalidMessage,
    #[error("Protocol error: {0}")]
    Message(#[from] MessageError),
    #[error("Could not decode server data: {0}")]
    Decode(#[from] DecodeError),
    #[error("The server refused the connection: {0}")]
    ValidationFailed(Status),
    #[error("The Client is closing or has closed")]
    ClientClosed,
    #[error("The channel does not exist or is already closed")]
    ChannelClosed,
    #[error("The channel is not connected")]
    NotConnected,
    #[error("Too many requests waiting for the channel to connect")]
    QueueFull,
    #[error("Timed out")]
    Timeout,
    #[error("Lost connection to the server")]
    Disconnected,
    #[error("Channel creation failed: {0}")]
    ChannelCreateFailed(String),
    #[error("Request failed: {0}")]
    OperationFailed(Status),
    #[error("{0}")]
    Request(#[from] RequestError),
    #[error("{0}")]
    Conversion(#[from] ConversionError),
    #[error("{0}")]
    Type(#[from] TypeMismatch),
    #[error("No field '{0}'")]
    UnknownField(String),
}

/// Where a channel is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Searching,
    Connecting,
    Connected,
    /// The connection was lost. The channel goes back to searching.
    Disconnected,
    Closed,
}

pub struct ClientBuilder {
    search_port: u16,
    broadcast_addresses: Option<Vec<SocketAddr>>,
    name_servers: Option<Vec<SocketAddr>>,
    connection_timeout: Duration,
    idle_timeout: Option<Duration>,
    timeout: Option<Duration>,
    backoff: Backoff,
    wait_for_connection: bool,
    queue_limit: usize,
    beacons: bool,
    beacon_port: u16,
    identity: Option<ClientIdentity>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        ClientBuilder {
            search_port: get_default_broadcast_port(),
            broadcast_addresses: None,
            name_servers: None,
            connection_timeout: Duration::from_secs_f32(get_default_connection_timeout()),
            idle_timeout: None,
            timeout: None,
            backoff: Backoff::default(),
            wait_for_connection: true,
            queue_limit: 64,
            beacons: true,
            beacon_port: get_default_broadcast_port(),
            identity: None,
        }
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        ClientBuilder::default()
    }
    /// The UDP port that servers listen for searches on
    pub fn search_port(mut self, port: u16) -> Self {
        self.search_port = port;
        self
    }
    pub fn broadcast_to(mut self, addresses: Vec<SocketAddr>) -> Self {
        self.broadcast_addresses = Some(addresses);
        self
    }
    pub fn name_servers(mut self, addresses: Vec<SocketAddr>) -> Self {
        self.name_servers = Some(addresses);
        self
    }
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }
    /// Close circuits that have had no channels for this long. Defaults
    /// to half the connection timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }
    /// Default timeout for channel operations. Defaults to the connection timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
    /// Whether operations on a channel that is not connected wait for it,
    /// or fail straight away with [`ClientError::NotConnected`]
    pub fn wait_for_connection(mut self, wait: bool) -> Self {
        self.wait_for_connection = wait;
        self
    }
    /// How many operations may wait on one channel to connect
    pub fn queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = limit;
        self
    }
    /// Listen to server beacons, to notice new and restarted servers
    pub fn beacons(mut self, enable: bool) -> Self {
        self.beacons = enable;
        self
    }
    pub fn beacon_port(mut self, port: u16) -> Self {
        self.beacon_port = port;
        self
    }
    pub fn identity(mut self, identity: ClientIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub async fn start(self) -> Result<Client, ClientError> {
        let cancel = CancellationToken::new();
        let identity = self.identity.unwrap_or_else(ClientIdentity::current);
        let searcher = SearcherBuilder::new()
            .stop_token(cancel.clone())
            .search_port(self.search_port)
            .name_servers(
                self.name_servers
                    .unwrap_or_else(|| get_name_servers(get_default_server_port())),
            )
            .backoff(self.backoff)
            .identity(identity.clone());
        let searcher = match self.broadcast_addresses {
            Some(addresses) => searcher.broadcast_to(addresses),
            None => searcher,
        }
        .start()
        .await?;

        let shared = Arc::new(ClientShared {
            searcher,
            circuits: Default::default(),
            config: CircuitConfig {
                connection_timeout: self.connection_timeout,
                idle_timeout: self.idle_timeout.unwrap_or(self.connection_timeout / 2),
                identity,
            },
            timeout: self.timeout.unwrap_or(self.connection_timeout),
            wait_for_connection: self.wait_for_connection,
            queue_limit: self.queue_limit,
            backoff: self.backoff,
            next_cid: AtomicU32::new(1),
            cancel: cancel.clone(),
        });

        if self.beacons {
            if let Err(err) = watch_beacons(shared.clone(), self.beacon_port) {
                warn!(
                    "Failed to create beacon watcher on port {}, will run without: {err:?}",
                    self.beacon_port
                );
            }
        }
        Ok(Client {
            shared,
            channels: Default::default(),
            cancel,
        })
    }
}

/// State shared between the client, its channels and its background tasks
#[derive(Debug)]
struct ClientShared {
    searcher: Searcher,
    circuits: CircuitPool,
    config: CircuitConfig,
    timeout: Duration,
    wait_for_connection: bool,
    queue_limit: usize,
    backoff: Backoff,
    next_cid: AtomicU32,
    cancel: CancellationToken,
}

/// The circuit to one server address. Locked while connecting, so that
/// channels on the same server share one connection.
type CircuitSlot = Arc<tokio::sync::Mutex<Option<Circuit>>>;

/// Open circuits, one per server address
#[derive(Debug, Default)]
struct CircuitPool {
    slots: Mutex<HashMap<SocketAddr, CircuitSlot>>,
}

impl CircuitPool {
    fn slot(&self, address: SocketAddr) -> CircuitSlot {
        self.slots
            .lock()
            .unwrap()
            .entry(address)
            .or_default()
            .clone()
    }

    async fn get_or_connect(
        &self,
        found: SearchResult,
        config: &CircuitConfig,
    ) -> Result<Circuit, ClientError> {
        let slot = self.slot(found.address);
        let mut slot = slot.lock().await;
        if let Some(circuit) = slot.as_ref() {
            if !circuit.is_closed() && circuit.guid() == found.guid {
                return Ok(circuit.clone());
            }
            if circuit.guid() != found.guid {
                debug!("Server at {} has a new identity, replacing circuit", found.address);
            }
            circuit.shutdown();
        }
        *slot = None;
        let circuit = Circuit::connect(found.address, found.guid, config).await?;
        *slot = Some(circuit.clone());
        Ok(circuit)
    }

    /// Close the circuit to a server, if we have one
    fn shutdown(&self, address: SocketAddr) {
        let Some(slot) = self.slots.lock().unwrap().remove(&address) else {
            return;
        };
        // A slot still connecting holds a fresh connection, so leave it be
        if let Ok(mut slot) = slot.try_lock() {
            if let Some(circuit) = slot.take() {
                debug!("Closing circuit to {}", circuit.address());
                circuit.shutdown();
            }
        }
    }
}

/// What a beacon told us about a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BeaconChange {
    New,
    /// Same address, different GUID
    Restarted,
    /// The set of channels the server offers changed
    Changed,
    Unchanged,
}

#[derive(Debug, Default)]
pub(crate) struct BeaconTracker {
    servers: HashMap<SocketAddr, (Guid, u16, Instant)>,
}

impl BeaconTracker {
    pub(crate) fn observe(
        &mut self,
        address: SocketAddr,
        guid: Guid,
        change_count: u16,
    ) -> BeaconChange {
        let previous = self
            .servers
            .insert(address, (guid, change_count, Instant::now()));
        match previous {
            None => BeaconChange::New,
            Some((old_guid, _, _)) if old_guid != guid => BeaconChange::Restarted,
            Some((_, old_count, _)) if old_count != change_count => BeaconChange::Changed,
            Some(_) => BeaconChange::Unchanged,
        }
    }
}

/// Watch for server beacons, and re-search or reconnect when servers change
fn watch_beacons(shared: Arc<ClientShared>, port: u16) -> Result<(), io::Error> {
    // Bind the socket first, so that we know early if it fails
    let socket = new_reusable_udp_socket(SocketAddr::new([0, 0, 0, 0].into(), port))?;
    tokio::spawn(async move {
        let mut buf: Vec<u8> = vec![0; 0xFFFF];
        let mut tracker = BeaconTracker::default();
        loop {
            select! {
                _ = shared.cancel.cancelled() => break,
                r = socket.recv_from(&mut buf) => match r {
                    Ok((size, sender)) => {
                        let Ok(frames) = messages::parse_frames(&buf[..size]) else {
                            continue;
                        };
                        for frame in frames {
                            if frame.command().ok() != Some(Command::Beacon) {
                                continue;
                            }
                            let Ok(beacon) = Beacon::parse(&mut frame.reader()) else {
                                continue;
                            };
                            trace!("Observed beacon: {beacon:?}");
                            let ip = if beacon.server_address.is_unspecified() {
                                sender.ip()
                            } else {
                                beacon.server_address
                            };
                            let address = SocketAddr::new(ip, beacon.server_port);
                            match tracker.observe(address, beacon.guid, beacon.change_count) {
                                BeaconChange::Unchanged => (),
                                BeaconChange::Restarted => {
                                    debug!("Server at {address} restarted");
                                    shared.circuits.shutdown(address);
                                    shared.searcher.boost();
                                }
                                change => {
                                    debug!("Beacon from {address}: {change:?}");
                                    shared.searcher.boost();
                                }
                            }
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("Got unresumable error whilst watching beacons: {e:?}");
                        break;
                    }
                }
            }
        }
    });
    Ok(())
}

pub struct Client {
    shared: Arc<ClientShared>,
    /// Channels handed out so far, by name
    channels: Mutex<HashMap<String, Channel>>,
    cancel: CancellationToken,
}

impl Client {
    pub async fn new() -> Result<Client, ClientError> {
        ClientBuilder::new().start().await
    }

    /// Get the channel for a PV, creating it if this is the first time asked
    pub fn channel(&self, name: &str) -> Channel {
        let mut channels = self.channels.lock().unwrap();
        if let Some(channel) = channels.get(name) {
            if channel.state() != ChannelState::Closed && !channel.inner.close.is_cancelled() {
                return channel.clone();
            }
        }
        let channel = Channel::create(name, self.shared.clone());
        channels.insert(name.to_owned(), channel.clone());
        channel
    }

    pub async fn read(&self, name: &str, request: &str) -> Result<PvStructure, ClientError> {
        self.channel(name).read(request).await
    }

    pub async fn write(
        &self,
        name: &str,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<(), ClientError> {
        self.channel(name).write(field, value).await
    }

    pub async fn subscribe(
        &self,
        name: &str,
        request: &str,
        pipeline: Option<u32>,
    ) -> Result<Subscription, ClientError> {
        self.channel(name).subscribe(request, pipeline).await
    }

    /// Ask every reachable server to identify itself
    pub async fn list(&self, duration: Duration) -> Result<Vec<ServerInfo>, ClientError> {
        Ok(self.shared.searcher.list(duration).await?)
    }

    /// Close every channel and connection
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The server-side channel a [`Channel`] is currently bound to
#[derive(Debug, Clone)]
struct ChannelLink {
    circuit: Circuit,
    sid: u32,
    /// Cancelled when the server side channel goes away
    lost: CancellationToken,
}

#[derive(Debug)]
struct ChannelInner {
    name: String,
    cid: u32,
    state: SenderPair<ChannelState>,
    link: watch::Sender<Option<ChannelLink>>,
    close: CancellationToken,
    /// Bounds how many operations wait for a connection
    queue: Semaphore,
    shared: Arc<ClientShared>,
}

/// A handle to one named PV, independent of the connection underneath it.
///
/// The channel searches for its PV when created, and keeps searching and
/// reconnecting until [`Channel::close`] is called or the client is dropped.
#[derive(Debug, Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
    timeout: Duration,
}

impl Channel {
    fn create(name: &str, shared: Arc<ClientShared>) -> Channel {
        let cid = shared.next_cid.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(ChannelInner {
            name: name.to_owned(),
            cid,
            state: SenderPair::new(16, ChannelState::Searching),
            link: watch::Sender::new(None),
            close: shared.cancel.child_token(),
            queue: Semaphore::new(shared.queue_limit),
            shared: shared.clone(),
        });
        tokio::spawn(channel_lifecycle(inner.clone()).instrument(debug_span!("channel", cid = cid)));
        Channel {
            inner,
            timeout: shared.timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state.current()
    }

    /// Every state transition from now on
    pub fn state_changes(&self) -> broadcast::Receiver<ChannelState> {
        self.inner.state.broadcast.subscribe()
    }

    /// The current state, as it changes
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.watch.subscribe()
    }

    /// A handle to the same channel, with a different operation timeout
    pub fn with_timeout(&self, timeout: Duration) -> Channel {
        Channel {
            inner: self.inner.clone(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn current_link(&self) -> Option<ChannelLink> {
        self.inner
            .link
            .borrow()
            .as_ref()
            .filter(|link| !link.lost.is_cancelled())
            .cloned()
    }

    /// Wait until bound to a server channel
    async fn connected(&self) -> Result<ChannelLink, ClientError> {
        if self.inner.close.is_cancelled() {
            return Err(ClientError::ChannelClosed);
        }
        if let Some(link) = self.current_link() {
            return Ok(link);
        }
        if !self.inner.shared.wait_for_connection {
            return Err(ClientError::NotConnected);
        }
        let _permit = self
            .inner
            .queue
            .try_acquire()
            .map_err(|_| ClientError::QueueFull)?;
        self.wait_for_link().await
    }

    async fn wait_for_link(&self) -> Result<ChannelLink, ClientError> {
        let mut links = self.inner.link.subscribe();
        select! {
            _ = self.inner.close.cancelled() => Err(ClientError::ChannelClosed),
            link = links.wait_for(|l| l.as_ref().is_some_and(|l| !l.lost.is_cancelled())) => {
                link.map_err(|_| ClientError::ChannelClosed)?
                    .clone()
                    .ok_or(ClientError::NotConnected)
            }
        }
    }

    /// Run an operation against the connected channel, within the timeout
    async fn with_link<T, F>(&self, f: impl FnOnce(ChannelLink) -> F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        tokio::time::timeout(self.timeout, async {
            let link = self.connected().await?;
            f(link).await
        })
        .await
        .map_err(|_| ClientError::Timeout)?
    }

    /// Wait for the channel to connect
    pub async fn wait_connected(&self) -> Result<(), ClientError> {
        tokio::time::timeout(self.timeout, self.wait_for_link())
            .await
            .map_err(|_| ClientError::Timeout)?
            .map(|_| ())
    }

    /// Read the value of the PV, or the fields named by `request`
    pub async fn read(&self, request: &str) -> Result<PvStructure, ClientError> {
        let request = FieldRequest::parse(request)?;
        let cid = self.inner.cid;
        self.with_link(|link| async move { link.circuit.read(cid, request).await })
            .await
    }

    /// Write a single field. An empty `field` writes the whole structure.
    pub async fn write(&self, field: &str, value: impl Into<Value>) -> Result<(), ClientError> {
        let value = value.into();
        let cid = self.inner.cid;
        self.with_link(|link| async move { link.circuit.write(cid, field, value).await })
            .await
    }

    /// Get the type of the PV, or of the fields named by `request`
    pub async fn info(&self, request: &str) -> Result<TypeDescriptor, ClientError> {
        let request = FieldRequest::parse(request)?;
        let cid = self.inner.cid;
        let full = self
            .with_link(|link| async move { link.circuit.info(cid, "").await })
            .await?;
        if request.is_all() {
            return Ok(full);
        }
        let desc = full.as_structure().ok_or(ClientError::ServerSentInvalidMessage)?;
        Ok(Projection::new(desc, &request)?.type_descriptor())
    }

    /// Call the PV as a remote procedure
    pub async fn invoke(&self, argument: PvStructure) -> Result<PvStructure, ClientError> {
        let cid = self.inner.cid;
        self.with_link(|link| async move { link.circuit.invoke(cid, argument).await })
            .await
    }

    /// Subscribe to updates.
    ///
    /// With a `pipeline` window, the server sends at most that many updates
    /// before the subscription acknowledges them.
    pub async fn subscribe(
        &self,
        request: &str,
        pipeline: Option<u32>,
    ) -> Result<Subscription, ClientError> {
        let request = FieldRequest::parse(request)?;
        let pipeline = pipeline.filter(|w| *w > 0);
        let (updates, receiver) = mpsc::unbounded_channel();
        let cid = self.inner.cid;
        let (link, ioid, ended) = {
            let request = request.clone();
            let updates = updates.clone();
            self.with_link(|link| async move {
                let ended = link.lost.child_token();
                let ioid = link
                    .circuit
                    .monitor(cid, request, pipeline, updates, ended.clone())
                    .await?;
                Ok((link, ioid, ended))
            })
            .await?
        };
        let close = self.inner.close.child_token();
        tokio::spawn(keep_subscribed(
            self.clone(),
            MonitorSetup {
                request,
                pipeline,
                updates,
            },
            close.clone(),
            (link, ioid, ended),
        ));
        Ok(Subscription::new(&self.inner.name, receiver, close))
    }

    /// Close the channel. Operations in progress fail.
    pub fn close(&self) {
        self.inner.close.cancel();
    }
}

struct MonitorSetup {
    request: FieldRequest,
    pipeline: Option<u32>,
    updates: mpsc::UnboundedSender<Delivery>,
}

/// Restart a subscription whenever its channel reconnects
async fn keep_subscribed(
    channel: Channel,
    setup: MonitorSetup,
    close: CancellationToken,
    current: (ChannelLink, u32, CancellationToken),
) {
    let (mut link, mut ioid, mut ended) = current;
    let cid = channel.inner.cid;
    loop {
        select! {
            _ = close.cancelled() => {
                link.circuit.stop_monitor(ioid);
                return;
            }
            _ = ended.cancelled() => (),
        }
        if !link.lost.is_cancelled() {
            debug!("Server ended subscription to {}", channel.inner.name);
            let _ = setup.updates.send(MonitorEvent::Finished.into());
            return;
        }
        if setup.updates.send(MonitorEvent::Disconnected.into()).is_err() {
            return;
        }
        loop {
            let next = select! {
                _ = close.cancelled() => return,
                next = channel.wait_for_link() => next,
            };
            let Ok(next) = next else {
                let _ = setup.updates.send(MonitorEvent::Finished.into());
                return;
            };
            let next_ended = next.lost.child_token();
            let result = next
                .circuit
                .monitor(
                    cid,
                    setup.request.clone(),
                    setup.pipeline,
                    setup.updates.clone(),
                    next_ended.clone(),
                )
                .await;
            match result {
                Ok(id) => {
                    debug!("Resubscribed to {}", channel.inner.name);
                    (link, ioid, ended) = (next, id, next_ended);
                    break;
                }
                Err(ClientError::Disconnected | ClientError::ChannelClosed) => continue,
                Err(e) => {
                    warn!("Could not resubscribe to {}: {e}", channel.inner.name);
                    let _ = setup.updates.send(MonitorEvent::Error(e).into());
                    return;
                }
            }
        }
    }
}

/// Drive a channel through search, connection and reconnection
async fn channel_lifecycle(inner: Arc<ChannelInner>) {
    let shared = inner.shared.clone();
    let mut failures = 0u32;
    loop {
        inner.state.send(ChannelState::Searching);
        debug!("Searching for '{}'", inner.name);
        let found = select! {
            _ = inner.close.cancelled() => break,
            found = shared.searcher.search_for(&inner.name) => found,
        };
        let Ok(found) = found else {
            debug!("Searcher stopped, closing channel '{}'", inner.name);
            break;
        };
        inner.state.send(ChannelState::Connecting);
        let connected = select! {
            _ = inner.close.cancelled() => break,
            connected = connect(&inner, found) => connected,
        };
        let link = match connected {
            Ok(link) => link,
            Err(e) => {
                warn!("Could not connect '{}' to {}: {e}", inner.name, found.address);
                let delay = shared.backoff.delay(failures);
                failures = failures.saturating_add(1);
                select! {
                    _ = inner.close.cancelled() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };
        failures = 0;
        debug!("Channel '{}' connected to {}", inner.name, found.address);
        let lost = link.lost.clone();
        let circuit = link.circuit.clone();
        inner.link.send_replace(Some(link));
        inner.state.send(ChannelState::Connected);
        select! {
            _ = inner.close.cancelled() => {
                circuit.destroy_channel(inner.cid);
                break;
            }
            _ = lost.cancelled() => {
                debug!("Channel '{}' lost its connection", inner.name);
                inner.link.send_replace(None);
                inner.state.send(ChannelState::Disconnected);
            }
        }
    }
    inner.link.send_replace(None);
    inner.state.send(ChannelState::Closed);
    debug!("Channel '{}' closed", inner.name);
}

async fn connect(inner: &ChannelInner, found: SearchResult) -> Result<ChannelLink, ClientError> {
    let circuit = inner
        .shared
        .circuits
        .get_or_connect(found, &inner.shared.config)
        .await?;
    let (sid, lost) = tokio::time::timeout(
        inner.shared.config.connection_timeout,
        circuit.create_channel(inner.cid, &inner.name),
    )
    .await
    .map_err(|_| ClientError::Timeout)??;
    Ok(ChannelLink { circuit, sid, lost })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_tracker() {
        let mut tracker = BeaconTracker::default();
        let address: SocketAddr = "127.0.0.1:5075".parse().unwrap();
        let guid = Guid([1; 12]);
        assert_eq!(tracker.observe(address, guid, 0), BeaconChange::New);
        assert_eq!(tracker.observe(address, guid, 0), BeaconChange::Unchanged);
        assert_eq!(tracker.observe(address, guid, 1), BeaconChange::Changed);
        assert_eq!(tracker.observe(address, Guid([2; 12]), 1), BeaconChange::Restarted);
        let other: SocketAddr = "127.0.0.2:5075".parse().unwrap();
        assert_eq!(tracker.observe(other, guid, 1), BeaconChange::New);
    }

    #[tokio::test]
    async fn test_slow_server_does_not_block_other_connections() {
        let server = crate::server::ServerBuilder::new()
            .connection_port(0)
            .search_port(0)
            .beacons(false)
            .start()
            .await
            .unwrap();
        // Accepts connections but never validates them
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent_address = silent.local_addr().unwrap();
        let pool = Arc::new(CircuitPool::default());
        let config = CircuitConfig {
            connection_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(5),
            identity: ClientIdentity::Anonymous,
        };

        let stuck = tokio::spawn({
            let pool = pool.clone();
            let config = config.clone();
            async move {
                let found = SearchResult {
                    address: silent_address,
                    guid: Guid([1; 12]),
                };
                pool.get_or_connect(found, &config).await
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let found = SearchResult {
            address: format!("127.0.0.1:{}", server.connection_port()).parse().unwrap(),
            guid: server.guid(),
        };
        let circuit = tokio::time::timeout(Duration::from_secs(1), pool.get_or_connect(found, &config))
            .await
            .expect("Connection waited for an unrelated server")
            .unwrap();
        assert!(!circuit.is_closed());
        assert!(!stuck.is_finished());
        stuck.abort();
        drop(silent);
    }

    #[tokio::test]
    async fn test_fail_fast_when_not_connected() {
        let client = ClientBuilder::new()
            .broadcast_to(Vec::new())
            .name_servers(Vec::new())
            .beacons(false)
            .wait_for_connection(false)
            .start()
            .await
            .unwrap();
        let channel = client.channel("nowhere");
        assert_eq!(channel.state(), ChannelState::Searching);
        assert!(matches!(
            channel.read("").await,
            Err(ClientError::NotConnected)
        ));
        channel.close();
        assert!(matches!(
            channel.read("").await,
            Err(ClientError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_queued_operation_times_out() {
        let client = ClientBuilder::new()
            .broadcast_to(Vec::new())
            .name_servers(Vec::new())
            .beacons(false)
            .timeout(Duration::from_millis(100))
            .start()
            .await
            .unwrap();
        let channel = client.channel("nowhere");
        assert!(matches!(channel.read("").await, Err(ClientError::Timeout)));
        assert!(matches!(
            channel.read("field(").await,
            Err(ClientError::Request(_))
        ));
        let mut states = channel.watch_state();
        client.close();
        states
            .wait_for(|s| *s == ChannelState::Closed)
            .await
            .unwrap();
    }
}
