use bytes::Bytes;
use std::{
    collections::HashMap,
    fmt::Display,
    future,
    net::SocketAddr,
    pin::Pin,
    time::{Duration, Instant},
};
use tokio::{
    io::{self, split},
    net::{TcpStream, UdpSocket},
    select,
    sync::{broadcast, mpsc, oneshot},
};
use tokio_stream::StreamExt;
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{debug, error, trace, warn};

use crate::{
    client::circuit::handshake,
    messages::{self, ClientIdentity, Command, Frame, Guid, SearchRequest, SearchResponse},
    transport::{FrameCodec, write_frames},
    utils::{
        Backoff, get_default_broadcast_port, get_default_connection_timeout,
        get_target_broadcast_ips, wrapping_inplace_add,
    },
};

/// Most channel names to put in one search datagram
const MAX_NAMES_PER_SEARCH: usize = 64;

pub struct SearcherBuilder {
    search_port: u16,
    stop_token: CancellationToken,
    broadcast_addresses: Option<Vec<SocketAddr>>,
    name_servers: Vec<SocketAddr>,
    timeout: Option<Duration>,
    backoff: Backoff,
    identity: ClientIdentity,
    /// The socket that is UDP bound to receive replies
    bind_address: SocketAddr,
}

impl Default for SearcherBuilder {
    fn default() -> Self {
        SearcherBuilder {
            search_port: get_default_broadcast_port(),
            stop_token: CancellationToken::new(),
            broadcast_addresses: None,
            name_servers: Vec::new(),
            timeout: None,
            backoff: Backoff::default(),
            identity: ClientIdentity::Anonymous,
            bind_address: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }
}

impl SearcherBuilder {
    pub fn new() -> Self {
        SearcherBuilder::default()
    }
    pub async fn start(self) -> Result<Searcher, io::Error> {
        let (send, request_recv) = mpsc::channel(32);
        let mut searcher = Searcher {
            timeout: self.timeout,
            pending_requests: send,
            stop_token: self.stop_token,
            broadcast_addresses: self
                .broadcast_addresses
                .unwrap_or_else(|| get_target_broadcast_ips(self.search_port)),
            name_servers: self.name_servers,
            backoff: self.backoff,
            bind_address: self.bind_address,
        };
        searcher
            .start_searching(request_recv, self.identity)
            .await
            .and(Ok(searcher))
    }
    pub fn stop_token(mut self, token: CancellationToken) -> Self {
        self.stop_token = token.child_token();
        self
    }
    /// The UDP port that servers listen for searches on
    pub fn search_port(mut self, port: u16) -> Self {
        self.search_port = port;
        self
    }
    /// Give up on a name after this long. By default, search forever.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
    pub fn broadcast_to(mut self, addresses: Vec<SocketAddr>) -> Self {
        self.broadcast_addresses = Some(addresses);
        self
    }
    /// Also search by TCP through these name servers
    pub fn name_servers(mut self, addresses: Vec<SocketAddr>) -> Self {
        self.name_servers = addresses;
        self
    }
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
    /// Identity presented to name servers
    pub fn identity(mut self, identity: ClientIdentity) -> Self {
        self.identity = identity;
        self
    }
}

/// Where a channel was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchResult {
    pub address: SocketAddr,
    pub guid: Guid,
}

/// A server that answered a list request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub guid: Guid,
    pub addresses: Vec<SocketAddr>,
}

type SearchReporter = oneshot::Sender<broadcast::Receiver<Option<SearchResult>>>;

enum SearcherRequest {
    Search(String, SearchReporter),
    /// Search again now for everything still missing
    Boost,
    /// Ask all servers to identify themselves
    List(mpsc::Sender<(Guid, SocketAddr)>),
}

#[derive(Debug)]
pub struct Searcher {
    timeout: Option<Duration>,
    /// Submit requests to search for new PVs
    pending_requests: mpsc::Sender<SearcherRequest>,
    /// Interfaces to broadcast onto
    broadcast_addresses: Vec<SocketAddr>,
    name_servers: Vec<SocketAddr>,
    backoff: Backoff,
    stop_token: CancellationToken,
    bind_address: SocketAddr,
}

impl std::fmt::Debug for SearcherRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearcherRequest::Search(name, _) => write!(f, "Search({name})"),
            SearcherRequest::Boost => write!(f, "Boost"),
            SearcherRequest::List(_) => write!(f, "List"),
        }
    }
}

impl Searcher {
    pub async fn start() -> Result<Searcher, io::Error> {
        SearcherBuilder::new().start().await
    }
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn start_searching(
        &mut self,
        mut incoming_requests: mpsc::Receiver<SearcherRequest>,
        identity: ClientIdentity,
    ) -> Result<(), io::Error> {
        let send_socket = UdpSocket::bind(self.bind_address).await?;
        send_socket.set_broadcast(true)?;
        let reply_port = send_socket.local_addr()?.port();

        // Searches relayed over TCP report back through here
        let (tcp_responses_tx, mut tcp_responses) = mpsc::channel(32);
        let name_servers = self
            .name_servers
            .iter()
            .map(|address| {
                let (tx, rx) = mpsc::channel(16);
                tokio::spawn(name_server_link(
                    *address,
                    rx,
                    tcp_responses_tx.clone(),
                    self.stop_token.clone(),
                    identity.clone(),
                ));
                tx
            })
            .collect();

        let mut state = SearcherInternal {
            broadcast_addresses: self.broadcast_addresses.clone(),
            name_servers,
            stop_token: self.stop_token.clone(),
            timeout: self.timeout,
            backoff: self.backoff,
            reply_port,
            search_id: 1,
            ..Default::default()
        };

        tokio::spawn(async move {
            let mut buffer = vec![0u8; 0xFFFF];
            loop {
                let mut requests = Vec::new();
                select! {
                    _ = state.stop_token.cancelled() => break,
                    _ = incoming_requests.recv_many(&mut requests, 32) => if requests.is_empty() { break; } else {
                        let packets = state.handle_new_requests(requests);
                        state.send(&send_socket, packets).await;
                    },
                    result = send_socket.recv_from(&mut buffer) => match result {
                        Ok((size, sender)) => state.handle_response(&buffer[..size], sender),
                        Err(e) => {
                            error!("Error waiting for search responses: {e}");
                        },
                    },
                    Some((frame, sender)) = tcp_responses.recv() => state.handle_frames(vec![frame], sender),
                    _ = state.next_attempt() => {
                        let packets = state.handle_retries_and_timeouts();
                        state.send(&send_socket, packets).await;
                    },
                };
            }
            debug!("Searcher stopped");
        });
        Ok(())
    }

    async fn request(&self, request: SearcherRequest) -> Result<(), CouldNotFindError> {
        self.pending_requests
            .send(request)
            .await
            .map_err(|_| CouldNotFindError)
    }

    /// Get the address of the server serving a specific PV
    pub async fn search_for(&self, name: &str) -> Result<SearchResult, CouldNotFindError> {
        let (ret_send, ret_recv) = oneshot::channel();
        // Send the request into our async search loop
        self.request(SearcherRequest::Search(name.to_string(), ret_send))
            .await?;
        // Get the receiver back from here
        let mut result_receiver = ret_recv.await.map_err(|_| CouldNotFindError)?;
        // Now, wait on this
        result_receiver
            .recv()
            .await
            .unwrap_or(None)
            .ok_or(CouldNotFindError)
    }

    /// Search again immediately for every name still missing
    pub fn boost(&self) {
        let _ = self.pending_requests.try_send(SearcherRequest::Boost);
    }

    /// Collect the servers that answer a list request within `duration`
    pub async fn list(&self, duration: Duration) -> Result<Vec<ServerInfo>, CouldNotFindError> {
        let (tx, mut rx) = mpsc::channel(64);
        self.request(SearcherRequest::List(tx)).await?;
        let mut servers: Vec<ServerInfo> = Vec::new();
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        loop {
            select! {
                _ = &mut deadline => break,
                reply = rx.recv() => match reply {
                    Some((guid, address)) => match servers.iter_mut().find(|s| s.guid == guid) {
                        Some(info) if !info.addresses.contains(&address) => info.addresses.push(address),
                        Some(_) => (),
                        None => servers.push(ServerInfo { guid, addresses: vec![address] }),
                    },
                    None => break,
                },
            }
        }
        Ok(servers)
    }

    pub fn stop(&self) {
        self.stop_token.cancel();
    }
    pub fn is_cancelled(&self) -> bool {
        self.stop_token.is_cancelled()
    }
}

impl Drop for Searcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug)]
pub struct CouldNotFindError;

impl Display for CouldNotFindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Could not find the requested PV")
    }
}

impl std::error::Error for CouldNotFindError {}

#[derive(Debug)]
struct SearchAttempt {
    name: String,
    /// ID the name is searched under, stable across retries
    search_id: u32,
    attempts: u32,
    search_expires_at: Option<Instant>,
    next_search_at: Instant,
    /// How are results reported back to the requesters?
    reporter: broadcast::Sender<Option<SearchResult>>,
}

impl SearchAttempt {
    /// Record that a search is being sent, and schedule the next one
    fn sent(&mut self, backoff: &Backoff) {
        self.next_search_at = Instant::now() + backoff.delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
    }
}

impl Default for SearchAttempt {
    fn default() -> Self {
        SearchAttempt {
            name: String::new(),
            search_id: 0,
            attempts: 0,
            search_expires_at: None,
            next_search_at: Instant::now(),
            reporter: broadcast::Sender::new(1),
        }
    }
}

/// Handle searcher internal state, inside a single Async context
#[derive(Default)]
struct SearcherInternal {
    /// Interfaces to broadcast onto
    broadcast_addresses: Vec<SocketAddr>,
    /// Connections to name servers that also receive every search
    name_servers: Vec<mpsc::Sender<Frame>>,
    /// Search IDs of outstanding requests to the PV name
    in_flight: HashMap<u32, String>,
    /// Data about all the PVs we are searching for
    per_pv_info: HashMap<String, SearchAttempt>,
    /// Names already found, to spot the same name on several servers
    resolved: HashMap<u32, (String, Guid)>,
    list_listener: Option<mpsc::Sender<(Guid, SocketAddr)>>,
    stop_token: CancellationToken,
    /// The next search ID to assign
    search_id: u32,
    /// Sequence number of the next search packet
    sequence: u32,
    reply_port: u16,
    timeout: Option<Duration>,
    backoff: Backoff,
}

impl SearcherInternal {
    /// Wait until it's time for the next tracked attempt
    fn next_attempt(&self) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        let next_wake = self
            .per_pv_info
            .values()
            .flat_map(|v| [Some(v.next_search_at), v.search_expires_at])
            .flatten()
            .min();
        match next_wake {
            None => Box::pin(future::pending()),
            Some(instant) => {
                if instant < Instant::now() {
                    Box::pin(future::ready(()))
                } else {
                    Box::pin(tokio::time::sleep_until(tokio::time::Instant::from_std(
                        instant,
                    )))
                }
            }
        }
    }

    fn handle_new_requests(&mut self, requests: Vec<SearcherRequest>) -> Vec<Frame> {
        debug_assert!(!requests.is_empty());
        let mut to_send = Vec::new();
        let mut packets = Vec::new();
        for request in requests {
            match request {
                SearcherRequest::Search(name, waiter_reply) => {
                    // Get or create an entry in our per-PV map to keep track of everything
                    let info = self.per_pv_info.entry(name.clone()).or_insert_with(|| {
                        let search_id = wrapping_inplace_add(&mut self.search_id);
                        self.in_flight.insert(search_id, name.clone());
                        SearchAttempt {
                            name: name.clone(),
                            search_id,
                            search_expires_at: self.timeout.map(|t| Instant::now() + t),
                            ..Default::default()
                        }
                    });
                    self.resolved.retain(|_, (resolved, _)| *resolved != name);
                    // Give the requester a place to wait for replies
                    let _ = waiter_reply.send(info.reporter.subscribe());
                    if info.attempts == 0 {
                        info.sent(&self.backoff);
                        to_send.push((info.search_id, name.clone()));
                        debug!("Sending search for {name}");
                    }
                }
                SearcherRequest::Boost => {
                    debug!("Boosting {} outstanding searches", self.per_pv_info.len());
                    for info in self.per_pv_info.values_mut() {
                        info.attempts = 0;
                        info.next_search_at = Instant::now();
                    }
                }
                SearcherRequest::List(listener) => {
                    self.list_listener = Some(listener);
                    packets.push(self.search_packet(Vec::new()));
                }
            }
        }
        packets.extend(self.search_packets(to_send));
        packets
    }

    fn search_packet(&mut self, channels: Vec<(u32, String)>) -> Frame {
        SearchRequest {
            sequence: wrapping_inplace_add(&mut self.sequence),
            // An empty search only gets answers if they are required
            reply_required: channels.is_empty(),
            reply_port: self.reply_port,
            channels,
            ..Default::default()
        }
        .to_frame()
    }

    fn search_packets(&mut self, channels: Vec<(u32, String)>) -> Vec<Frame> {
        channels
            .chunks(MAX_NAMES_PER_SEARCH)
            .map(|chunk| self.search_packet(chunk.to_vec()))
            .collect()
    }

    async fn send(&mut self, socket: &UdpSocket, packets: Vec<Frame>) {
        for packet in packets {
            let bytes = packet.to_bytes();
            for addr in &self.broadcast_addresses {
                trace!("Sending search packet to: {addr}");
                if let Err(e) = socket.send_to(&bytes, *addr).await {
                    warn!("Failed to send search to {addr}: {e}");
                }
            }
            for link in &self.name_servers {
                let _ = link.try_send(packet.clone());
            }
        }
    }

    fn handle_response(&mut self, response: &[u8], sender: SocketAddr) {
        match messages::parse_frames(response) {
            Ok(frames) => self.handle_frames(frames, sender),
            Err(e) => warn!("Received unparseable search response from {sender}: {e}"),
        }
    }

    fn handle_frames(&mut self, frames: Vec<Frame>, sender: SocketAddr) {
        for frame in frames {
            match frame.command() {
                Ok(Command::SearchResponse) => (),
                // Our own searches echo back on broadcast
                Ok(Command::Search) | Ok(Command::Beacon) => continue,
                other => {
                    debug!("Received unexpected message on search socket: {other:?}");
                    continue;
                }
            }
            let response = match SearchResponse::parse(&mut frame.reader()) {
                Ok(response) => response,
                Err(e) => {
                    warn!("Received invalid search response from {sender}: {e}");
                    continue;
                }
            };
            let server_origin = server_address(&response, sender);
            if !response.found || response.cids.is_empty() {
                if let Some(listener) = &self.list_listener {
                    if listener.try_send((response.guid, server_origin)).is_err() {
                        self.list_listener = None;
                    }
                }
                continue;
            }
            for cid in &response.cids {
                self.handle_found(*cid, response.guid, server_origin);
            }
        }
    }

    fn handle_found(&mut self, cid: u32, guid: Guid, server_origin: SocketAddr) {
        // What was this a response to?
        let Some(pv_name) = self.in_flight.remove(&cid) else {
            match self.resolved.get(&cid) {
                Some((name, first)) if *first != guid => warn!(
                    "More than one channel with name '{name}' detected, ignored {server_origin} {guid}"
                ),
                Some(_) => trace!("Duplicate search response for {cid}"),
                None => debug!("Received unrequested search response for {cid}"),
            }
            return;
        };
        let Some(info) = self.per_pv_info.remove(&pv_name) else {
            return;
        };
        debug!("Found server for {pv_name}: {server_origin} {guid}");
        self.resolved.insert(cid, (pv_name, guid));
        let _ = info.reporter.send(Some(SearchResult {
            address: server_origin,
            guid,
        }));
    }

    fn handle_retries_and_timeouts(&mut self) -> Vec<Frame> {
        let now = Instant::now();

        // Discard any expired or abandoned searches
        self.per_pv_info.retain(|_, v| {
            let expired = v.search_expires_at.is_some_and(|time| time < now);
            if expired {
                // Send the termination signal
                let _ = v.reporter.send(None);
                debug!("Dropping search for {} as reached search timeout", v.name);
            } else if v.reporter.receiver_count() == 0 {
                debug!("Dropping search for {}, nobody is waiting", v.name);
            } else {
                return true;
            }
            self.in_flight.remove(&v.search_id);
            false
        });

        let retries = self
            .per_pv_info
            .values_mut()
            .filter(|s| s.next_search_at <= now)
            .map(|s| {
                trace!("Sending retry search {} for: {}", s.attempts, s.name);
                s.sent(&self.backoff);
                (s.search_id, s.name.clone())
            })
            .collect();
        self.search_packets(retries)
    }
}

/// An unspecified address in a reply means the sender itself
fn server_address(response: &SearchResponse, sender: SocketAddr) -> SocketAddr {
    let ip = if response.server_address.is_unspecified() {
        sender.ip()
    } else {
        response.server_address
    };
    SocketAddr::new(ip, response.server_port)
}

/// Relay searches over TCP to a name server, reconnecting as needed
async fn name_server_link(
    address: SocketAddr,
    mut outgoing: mpsc::Receiver<Frame>,
    responses: mpsc::Sender<(Frame, SocketAddr)>,
    stop: CancellationToken,
    identity: ClientIdentity,
) {
    let timeout = Duration::from_secs_f32(get_default_connection_timeout());
    let mut attempt = 0u32;
    let backoff = Backoff::default();
    while !stop.is_cancelled() {
        let connected = select! {
            _ = stop.cancelled() => break,
            r = tokio::time::timeout(timeout, TcpStream::connect(address)) => r,
        };
        let tcp = match connected {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => {
                debug!("Could not connect to name server {address}: {e}");
                tokio::time::sleep(backoff.delay(attempt)).await;
                attempt = attempt.saturating_add(1);
                continue;
            }
            Err(_) => continue,
        };
        let (tcp_rx, mut tcp_tx) = split(tcp);
        let mut framed = FramedRead::new(tcp_rx, FrameCodec::default());
        if let Err(e) = handshake(&mut framed, &mut tcp_tx, &identity).await {
            warn!("Name server {address} failed validation: {e}");
            tokio::time::sleep(backoff.delay(attempt)).await;
            attempt = attempt.saturating_add(1);
            continue;
        }
        debug!("Connected to name server {address}");
        attempt = 0;
        let echo_period = timeout / 2;
        loop {
            let frames = select! {
                _ = stop.cancelled() => return,
                frame = outgoing.recv() => match frame {
                    Some(frame) => vec![frame],
                    None => return,
                },
                incoming = framed.next() => match incoming {
                    Some(Ok(frame)) => {
                        if frame.command().ok() == Some(Command::SearchResponse) {
                            let _ = responses.send((frame, address)).await;
                        }
                        continue;
                    }
                    Some(Err(e)) => {
                        warn!("Name server {address} sent invalid data: {e}");
                        break;
                    }
                    None => break,
                },
                _ = tokio::time::sleep(echo_period) => vec![Frame::new(Command::Echo, false, Bytes::new())],
            };
            if write_frames(frames, &mut tcp_tx).await.is_err() {
                break;
            }
        }
        debug!("Lost connection to name server {address}");
    }
}

#[cfg(test)]
mod test {
    use std::net::{IpAddr, Ipv4Addr};

    use tokio::net::UdpSocket;

    use super::*;
    use crate::messages::parse_frames;

    async fn receive_search(socket: &UdpSocket) -> (SearchRequest, SocketAddr) {
        let mut buffer = [0u8; 16384];
        let (size, source) = socket.recv_from(&mut buffer).await.unwrap();
        let frames = parse_frames(&buffer[..size]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command().unwrap(), Command::Search);
        (SearchRequest::parse(&mut frames[0].reader()).unwrap(), source)
    }

    fn respond(search: &SearchRequest, guid: Guid, found: bool) -> Vec<u8> {
        SearchResponse {
            guid,
            sequence: search.sequence,
            server_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            server_port: 6464,
            protocol: "tcp".to_owned(),
            found,
            cids: search.channels.iter().map(|(cid, _)| *cid).collect(),
        }
        .to_frame()
        .to_bytes()
        .to_vec()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_search() {
        // Set up a receiver
        let incoming = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = incoming.local_addr().unwrap();
        let guid = Guid::random();

        let subtask = tokio::spawn(async move {
            let s = SearcherBuilder::new()
                .broadcast_to(vec![target])
                .start()
                .await
                .unwrap();
            s.search_for("TEST").await.unwrap()
        });

        // Receive and validate this request
        let (search, source) = receive_search(&incoming).await;
        assert_eq!(search.channels.len(), 1);
        assert_eq!(search.channels[0].1, "TEST");
        assert_eq!(search.reply_port, source.port());

        incoming
            .send_to(&respond(&search, guid, true), source)
            .await
            .unwrap();

        let result = subtask.await.unwrap();
        assert_eq!(result.address, "127.0.0.1:6464".parse().unwrap());
        assert_eq!(result.guid, guid);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_search_retries_with_same_id() {
        let incoming = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = incoming.local_addr().unwrap();
        let searcher = SearcherBuilder::new()
            .broadcast_to(vec![target])
            .backoff(Backoff {
                initial: Duration::from_millis(20),
                max: Duration::from_millis(50),
                jitter: 0.0,
            })
            .start()
            .await
            .unwrap();
        let search = tokio::spawn(async move { searcher.search_for("RETRY").await });
        let (first, _) = receive_search(&incoming).await;
        let (second, source) = receive_search(&incoming).await;
        assert_eq!(first.channels, second.channels);
        assert_ne!(first.sequence, second.sequence);
        incoming
            .send_to(&respond(&second, Guid::random(), true), source)
            .await
            .unwrap();
        assert!(search.await.unwrap().is_ok());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_search_timeout() {
        let incoming = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let searcher = SearcherBuilder::new()
            .broadcast_to(vec![incoming.local_addr().unwrap()])
            .timeout(Some(Duration::from_millis(100)))
            .start()
            .await
            .unwrap();
        assert!(searcher.search_for("MISSING").await.is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_list() {
        let incoming = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let searcher = SearcherBuilder::new()
            .broadcast_to(vec![incoming.local_addr().unwrap()])
            .start()
            .await
            .unwrap();
        let guid = Guid::random();
        let responder = tokio::spawn(async move {
            let (search, source) = receive_search(&incoming).await;
            assert!(search.channels.is_empty());
            assert!(search.reply_required);
            incoming
                .send_to(&respond(&search, guid, false), source)
                .await
                .unwrap();
        });
        let servers = searcher.list(Duration::from_millis(300)).await.unwrap();
        responder.await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].guid, guid);
        assert_eq!(servers[0].addresses, vec!["127.0.0.1:6464".parse().unwrap()]);
    }
}
