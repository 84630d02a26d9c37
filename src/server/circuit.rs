//! One client connection, seen from the server side.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf, split},
    net::TcpStream,
    select,
    sync::mpsc,
};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::{Instrument, debug, debug_span, error, trace, warn};

use crate::{
    messages::{
        self, CONTROL_SET_BYTE_ORDER, ClientIdentity, Command, CreateChannel,
        CreateChannelResponse, DestroyChannel, Frame, GetFieldRequest, MessageError,
        OperationRequest, OperationResponse, RequestIds, SUBCMD_DESTROY, SUBCMD_GET, SUBCMD_INIT,
        SUBCMD_MONITOR_STOP, SUBCMD_PIPELINE, SearchRequest, Status, ValidationRequest,
        ValidationResponse,
    },
    pvdata::{
        ChangeBitSet, PvStructure, Structure, TypeRegistry, WireReader,
        codec::{decode_changed, encode_changed},
    },
    request::{FieldRequest, Projection},
    transport::{FrameCodec, write_frames},
};

use super::{
    ServerShared,
    auth::{Operation, PeerIdentity},
    pv::ServerPV,
};

/// Receive buffer size we tell clients about
const SERVER_BUFFER_SIZE: u32 = 16384;
/// Type cache size we tell clients about
const SERVER_REGISTRY_SIZE: u16 = 0x7FFF;
/// Monitor window when a client asks for pipelining without a size
const DEFAULT_QUEUE_SIZE: u32 = 4;

/// Things happening elsewhere that a circuit must tell its client about
#[derive(Debug)]
pub(crate) enum ServerCircuitEvent {
    /// A monitor has a value to send
    MonitorData {
        ioid: u32,
        value: Structure,
        changed: ChangeBitSet,
        overrun: ChangeBitSet,
    },
    /// The PV went away
    PvClosed(ServerPV),
    /// An authorization check finished
    Authorized {
        ioid: u32,
        operation: Operation,
        allowed: bool,
        request: DeferredRequest,
    },
    /// A write or RPC handler finished
    Completed {
        command: Command,
        ioid: u32,
        subcommand: u8,
        result: Result<Option<PvStructure>, String>,
    },
}

/// A request held back until its authorization check finishes
#[derive(Debug)]
pub(crate) enum DeferredRequest {
    /// The INIT stage of get, put, RPC or monitor
    Init {
        command: Command,
        sid: u32,
        subcommand: u8,
        pv_request: PvStructure,
        /// Monitor window sent with a pipelined INIT
        nfree: Option<u32>,
    },
    TypeQuery {
        sid: u32,
        sub_field: String,
    },
}

/// Ask for the client's identity, and wait for it
async fn validate<R, W>(
    framed: &mut FramedRead<R, FrameCodec>,
    writer: &mut W,
) -> Result<ClientIdentity, MessageError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let request = ValidationRequest {
        buffer_size: SERVER_BUFFER_SIZE,
        registry_size: SERVER_REGISTRY_SIZE,
        auth_methods: vec!["ca".to_owned(), "anonymous".to_owned()],
    };
    write_frames(
        vec![
            Frame::control(CONTROL_SET_BYTE_ORDER, 0, true),
            request.to_frame(),
        ],
        writer,
    )
    .await?;
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        if frame.header.is_control() {
            continue;
        }
        match frame.command()? {
            Command::ConnectionValidation => {
                let response = ValidationResponse::parse(&mut frame.reader())?;
                return Ok(response.identity);
            }
            Command::Echo => (),
            other => {
                return Err(MessageError::UnexpectedMessage(format!(
                    "{other:?} before validation"
                )));
            }
        }
    }
    Err(MessageError::IO(std::io::ErrorKind::UnexpectedEof.into()))
}

/// Run the connection to one client, until either side closes it
pub(crate) async fn serve_client(
    stream: TcpStream,
    address: SocketAddr,
    id: u64,
    shared: Arc<ServerShared>,
) {
    let _ = stream.set_nodelay(true);
    let (tcp_rx, mut tcp_tx) = split(stream);
    let mut framed = FramedRead::with_capacity(tcp_rx, FrameCodec::default(), 16384usize);
    let client = match tokio::time::timeout(
        shared.connection_timeout,
        validate(&mut framed, &mut tcp_tx),
    )
    .await
    {
        Ok(Ok(identity)) => identity,
        Ok(Err(e)) => {
            debug!("Client {address} failed validation: {e}");
            return;
        }
        Err(_) => {
            debug!("Client {address} did not validate in time");
            return;
        }
    };
    let peer = PeerIdentity { address, client };
    debug!("Validated client {peer}");
    let mut status = BytesMut::new();
    Status::ok().write(&mut status);
    let validated = Frame::new(Command::ConnectionValidated, true, status);
    if let Err(e) = write_frames(vec![validated], &mut tcp_tx).await {
        debug!("Could not complete validation with {address}: {e}");
        return;
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let circuit = ServerCircuit {
        id,
        peer,
        shared,
        events_tx,
        events_rx,
        last_received_message_at: Instant::now(),
        incoming_types: TypeRegistry::new(),
        outgoing_types: TypeRegistry::new(),
        next_sid: 1,
        channels: HashMap::new(),
        operations: HashMap::new(),
        awaiting_authorization: HashSet::new(),
    };
    circuit
        .lifecycle(framed, tcp_tx)
        .instrument(debug_span!("client", id = id))
        .await;
}

#[derive(Debug)]
struct ServerChannel {
    cid: u32,
    pv: ServerPV,
}

#[derive(Debug)]
enum OperationKind {
    Get(Projection),
    Put(Projection),
    Rpc,
    Monitor(Projection),
}

#[derive(Debug)]
struct ServerOperation {
    sid: u32,
    pv: ServerPV,
    kind: OperationKind,
}

struct ServerCircuit {
    /// Distinguishes this circuit's monitors on shared PVs
    id: u64,
    peer: PeerIdentity,
    shared: Arc<ServerShared>,
    events_tx: mpsc::UnboundedSender<ServerCircuitEvent>,
    events_rx: mpsc::UnboundedReceiver<ServerCircuitEvent>,
    last_received_message_at: Instant,
    /// Types the client has described to us
    incoming_types: TypeRegistry,
    /// Types we have described to the client
    outgoing_types: TypeRegistry,
    next_sid: u32,
    channels: HashMap<u32, ServerChannel>,
    operations: HashMap<u32, ServerOperation>,
    /// Request IDs whose authorization check is still running
    awaiting_authorization: HashSet<u32>,
}

fn failure(command: Command, ioid: u32, subcommand: u8, message: impl Into<String>) -> Frame {
    OperationResponse {
        command,
        ioid,
        subcommand,
        status: Some(Status::error(message)),
        body: Bytes::new(),
    }
    .to_frame()
}

fn success(command: Command, ioid: u32, subcommand: u8, body: impl Into<Bytes>) -> Frame {
    OperationResponse {
        command,
        ioid,
        subcommand,
        status: Some(Status::ok()),
        body: body.into(),
    }
    .to_frame()
}

/// A whole value, as sent in reply to a get
fn encode_whole(projection: &Projection, pv: &ServerPV) -> Result<BytesMut, MessageError> {
    let current = pv.value();
    let projected = projection.project(current.value());
    let mut body = BytesMut::new();
    let all = ChangeBitSet::whole();
    all.encode(&mut body);
    encode_changed(projection.desc(), &projected, &all, &mut body)?;
    Ok(body)
}

impl ServerCircuit {
    async fn lifecycle(
        mut self,
        mut framed: FramedRead<ReadHalf<TcpStream>, FrameCodec>,
        mut tcp_tx: WriteHalf<TcpStream>,
    ) {
        let cancel = self.shared.cancel.child_token();
        loop {
            let deadline = self.last_received_message_at + self.shared.connection_timeout;
            let frames_out = select! {
                _ = cancel.cancelled() => break,
                incoming = framed.next() => match incoming {
                    Some(Ok(frame)) => match self.handle_message(frame) {
                        Ok(frames) => frames,
                        Err(e) => {
                            error!("Invalid message from {}, closing: {e}", self.peer);
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        error!("Got error processing client message: {e}");
                        break;
                    }
                    None => {
                        debug!("Client {} closed the connection", self.peer);
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => match self.handle_event(event) {
                    Ok(frames) => frames,
                    Err(e) => {
                        error!("Could not encode message for {}: {e}", self.peer);
                        Vec::new()
                    }
                },
                _ = tokio::time::sleep_until(deadline.into()) => {
                    warn!("Client {} went silent, closing", self.peer);
                    break;
                },
            };
            if let Err(e) = write_frames(frames_out, &mut tcp_tx).await {
                error!("Failed to write messages to io stream, aborting: {e}");
                break;
            }
        }
        let mut pvs: Vec<ServerPV> = Vec::new();
        for (_, channel) in self.channels.drain() {
            if !pvs.iter().any(|pv| pv.same_pv(&channel.pv)) {
                pvs.push(channel.pv);
            }
        }
        for pv in pvs {
            pv.detach(self.id);
        }
        let _ = tcp_tx.shutdown().await;
        debug!("Connection to {} closed", self.peer);
    }

    /// Check access away from the circuit, and carry on with `request` once known
    fn authorize_later(
        &mut self,
        pv: &ServerPV,
        operation: Operation,
        ioid: u32,
        request: DeferredRequest,
    ) {
        self.awaiting_authorization.insert(ioid);
        let authorization = self.shared.authorization.clone();
        let peer = self.peer.clone();
        let name = pv.name().to_owned();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let allowed = tokio::task::spawn_blocking(move || {
                authorization.check(&peer, &name, operation)
            })
            .await
            .unwrap_or(false);
            let _ = events.send(ServerCircuitEvent::Authorized {
                ioid,
                operation,
                allowed,
                request,
            });
        });
    }

    fn request_id_in_use(&self, ioid: u32) -> bool {
        self.operations.contains_key(&ioid) || self.awaiting_authorization.contains(&ioid)
    }

    fn channel_pv(&self, sid: u32) -> Option<ServerPV> {
        self.channels.get(&sid).map(|c| c.pv.clone())
    }

    fn handle_message(&mut self, frame: Frame) -> Result<Vec<Frame>, MessageError> {
        self.last_received_message_at = Instant::now();
        if frame.header.is_control() {
            trace!("Received control message {}", frame.header.command);
            return Ok(Vec::new());
        }
        let command = match frame.command() {
            Ok(command) => command,
            Err(e) => {
                warn!("Ignoring message from client: {e}");
                return Ok(Vec::new());
            }
        };
        trace!("Received {command:?} ({} bytes)", frame.payload.len());
        let mut reader = frame.reader();
        match command {
            Command::Echo => Ok(vec![Frame::new(Command::Echo, true, frame.payload.clone())]),
            Command::Search => {
                let request = SearchRequest::parse(&mut reader)?;
                Ok(self
                    .shared
                    .responder
                    .respond(&request, self.peer.address)
                    .iter()
                    .map(|r| r.to_frame())
                    .collect())
            }
            Command::CreateChannel => {
                let request = CreateChannel::parse(&mut reader)?;
                Ok(request
                    .channels
                    .into_iter()
                    .map(|(cid, name)| self.create_channel(cid, &name))
                    .collect())
            }
            Command::DestroyChannel => {
                let request = DestroyChannel::parse(&mut reader)?;
                Ok(self.destroy_channel(request))
            }
            Command::Get | Command::Put | Command::Rpc | Command::Monitor => {
                let request = OperationRequest::parse(command, &mut reader)?;
                self.handle_operation(request)
            }
            Command::GetField => {
                let GetFieldRequest { sid, ioid, sub_field } = GetFieldRequest::parse(&mut reader)?;
                let Some(pv) = self.channel_pv(sid) else {
                    return Ok(vec![failure(Command::GetField, ioid, 0, "No such channel")]);
                };
                if self.request_id_in_use(ioid) {
                    return Ok(vec![failure(Command::GetField, ioid, 0, "Request ID in use")]);
                }
                let request = DeferredRequest::TypeQuery { sid, sub_field };
                self.authorize_later(&pv, Operation::Info, ioid, request);
                Ok(Vec::new())
            }
            Command::DestroyRequest | Command::CancelRequest => {
                let ids = RequestIds::parse(&mut reader)?;
                self.remove_operation(ids.ioid);
                Ok(Vec::new())
            }
            Command::ConnectionValidation | Command::ConnectionValidated => {
                warn!("Got unexpected validation message after validation");
                Ok(Vec::new())
            }
            other => {
                debug!("Got unhandled message from client: {other:?}");
                Ok(Vec::new())
            }
        }
    }

    fn create_channel(&mut self, cid: u32, name: &str) -> Frame {
        let _span = debug_span!("create_channel", cid = cid).entered();
        let attached = self
            .shared
            .registry
            .get(name)
            .ok_or_else(|| format!("No PV named '{name}'"))
            .and_then(|pv| {
                pv.attach(self.id, self.events_tx.clone())
                    .map(|_| pv)
                    .map_err(|e| e.to_string())
            });
        match attached {
            Ok(pv) => {
                let sid = self.next_sid;
                self.next_sid = self.next_sid.wrapping_add(1);
                debug!("Opened channel '{name}' as sid {sid}");
                self.channels.insert(sid, ServerChannel { cid, pv });
                CreateChannelResponse {
                    cid,
                    sid,
                    status: Status::ok(),
                }
                .to_frame()
            }
            Err(message) => {
                debug!("Refusing channel: {message}");
                CreateChannelResponse {
                    cid,
                    sid: 0,
                    status: Status::error(message),
                }
                .to_frame()
            }
        }
    }

    fn destroy_channel(&mut self, request: DestroyChannel) -> Vec<Frame> {
        let Some(channel) = self.channels.remove(&request.sid) else {
            debug!("Client destroyed unknown channel {}", request.sid);
            return Vec::new();
        };
        debug!("Client closed channel '{}'", channel.pv.name());
        let ioids: Vec<u32> = self
            .operations
            .iter()
            .filter(|(_, op)| op.sid == request.sid)
            .map(|(ioid, _)| *ioid)
            .collect();
        for ioid in ioids {
            self.remove_operation(ioid);
        }
        if !self.channels.values().any(|c| c.pv.same_pv(&channel.pv)) {
            channel.pv.detach(self.id);
        }
        vec![
            DestroyChannel {
                sid: request.sid,
                cid: channel.cid,
            }
            .to_frame(true),
        ]
    }

    fn remove_operation(&mut self, ioid: u32) {
        if self.awaiting_authorization.remove(&ioid) {
            trace!("Dropped request {ioid} before it was authorized");
        }
        if let Some(op) = self.operations.remove(&ioid) {
            trace!("Removed request {ioid}");
            if let OperationKind::Monitor(_) = op.kind {
                op.pv.remove_monitor(self.id, ioid);
            }
        }
    }

    fn get_field(&mut self, sid: u32, ioid: u32, sub_field: &str, allowed: bool) -> Frame {
        let Some(pv) = self.channel_pv(sid) else {
            return failure(Command::GetField, ioid, 0, "No such channel");
        };
        if !allowed {
            return failure(Command::GetField, ioid, 0, "Access denied");
        }
        let desc = if sub_field.is_empty() {
            Some(pv.type_descriptor())
        } else {
            pv.desc().locate(sub_field).cloned()
        };
        let Some(desc) = desc else {
            return failure(
                Command::GetField,
                ioid,
                0,
                format!("No field '{sub_field}' in '{}'", pv.name()),
            );
        };
        let mut body = BytesMut::new();
        self.outgoing_types.encode_type(&desc, &mut body);
        success(Command::GetField, ioid, 0, body)
    }

    fn handle_operation(&mut self, request: OperationRequest) -> Result<Vec<Frame>, MessageError> {
        let OperationRequest {
            command,
            sid,
            ioid,
            subcommand,
            body,
        } = request;
        let mut reader = WireReader::new(&body);
        if subcommand & SUBCMD_INIT != 0 {
            return self.init_operation(command, sid, ioid, subcommand, &mut reader);
        }
        let Some(op) = self.operations.get(&ioid) else {
            debug!("Got {command:?} for unknown request {ioid}");
            return Ok(vec![failure(command, ioid, subcommand, "No such request")]);
        };
        let destroy = subcommand & SUBCMD_DESTROY != 0;
        let pv = op.pv.clone();
        let frames = match (&op.kind, command) {
            (OperationKind::Get(projection), Command::Get)
            | (OperationKind::Put(projection), Command::Put)
                if command == Command::Get || subcommand & SUBCMD_GET != 0 =>
            {
                let body = encode_whole(projection, &pv)?;
                vec![success(command, ioid, subcommand, body)]
            }
            (OperationKind::Put(projection), Command::Put) => {
                let changes = ChangeBitSet::decode(&mut reader)?;
                let mut written = Structure::default_for(projection.desc());
                decode_changed(projection.desc(), &mut written, &changes, &mut reader)?;
                let full_changes = projection.unmap_changes(&changes);
                let (desc, mut full) = pv.value().into_parts();
                projection.apply(&mut full, &written, &changes);
                let changed = pv.changed_paths(&full_changes);
                let Some(writer) = pv.writer() else {
                    return Ok(vec![failure(command, ioid, subcommand, "PV is read-only")]);
                };
                debug!("Client {} writing {changed:?} of '{}'", self.peer, pv.name());
                let written = PvStructure::new_unchecked(desc, full);
                self.complete_later(command, ioid, subcommand, move || {
                    writer.write(&pv, &changed, &written).map(|_| None)
                });
                Vec::new()
            }
            (OperationKind::Rpc, Command::Rpc) => {
                let argument = messages::decode_structure(&mut self.incoming_types, &mut reader)?;
                let Some(handler) = pv.rpc() else {
                    return Ok(vec![failure(command, ioid, subcommand, "PV does not take calls")]);
                };
                self.complete_later(command, ioid, subcommand, move || {
                    handler.call(argument).map(Some)
                });
                Vec::new()
            }
            (OperationKind::Monitor(_), Command::Monitor) => {
                if destroy {
                    self.remove_operation(ioid);
                    return Ok(Vec::new());
                }
                if subcommand & SUBCMD_PIPELINE != 0 {
                    let count = reader.u32()?;
                    trace!("Client acknowledged {count} updates on {ioid}");
                    pv.ack_monitor(self.id, ioid, count);
                }
                if subcommand & SUBCMD_MONITOR_STOP != 0 {
                    if subcommand & SUBCMD_GET != 0 {
                        pv.start_monitor(self.id, ioid);
                    } else {
                        pv.stop_monitor(self.id, ioid);
                    }
                }
                Vec::new()
            }
            (kind, _) => {
                warn!("Got {command:?} for request {ioid} of kind {kind:?}");
                vec![failure(command, ioid, subcommand, "Request type mismatch")]
            }
        };
        if destroy {
            self.remove_operation(ioid);
        }
        Ok(frames)
    }

    fn init_operation(
        &mut self,
        command: Command,
        sid: u32,
        ioid: u32,
        subcommand: u8,
        reader: &mut WireReader<'_>,
    ) -> Result<Vec<Frame>, MessageError> {
        // Always decoded, to keep the type cache in step with the client
        let pv_request = messages::decode_structure(&mut self.incoming_types, reader)?;
        let nfree = if command == Command::Monitor && subcommand & SUBCMD_PIPELINE != 0 {
            Some(reader.u32()?)
        } else {
            None
        };
        let Some(pv) = self.channel_pv(sid) else {
            return Ok(vec![failure(command, ioid, subcommand, "No such channel")]);
        };
        if self.request_id_in_use(ioid) {
            return Ok(vec![failure(command, ioid, subcommand, "Request ID in use")]);
        }
        let operation = match command {
            Command::Get => Operation::Read,
            Command::Put => Operation::Write,
            Command::Rpc => Operation::Rpc,
            _ => Operation::Monitor,
        };
        let request = DeferredRequest::Init {
            command,
            sid,
            subcommand,
            pv_request,
            nfree,
        };
        self.authorize_later(&pv, operation, ioid, request);
        Ok(Vec::new())
    }

    /// Carry on with a request once its authorization check is done
    fn resume_authorized(
        &mut self,
        ioid: u32,
        operation: Operation,
        allowed: bool,
        request: DeferredRequest,
    ) -> Result<Vec<Frame>, MessageError> {
        if !self.awaiting_authorization.remove(&ioid) {
            trace!("Request {ioid} went away while being authorized");
            return Ok(Vec::new());
        }
        if !allowed {
            debug!("Denied {operation:?} to {} for request {ioid}", self.peer);
        }
        match request {
            DeferredRequest::TypeQuery { sid, sub_field } => {
                Ok(vec![self.get_field(sid, ioid, &sub_field, allowed)])
            }
            DeferredRequest::Init {
                command,
                subcommand,
                ..
            } if !allowed => Ok(vec![failure(command, ioid, subcommand, "Access denied")]),
            DeferredRequest::Init {
                command,
                sid,
                subcommand,
                pv_request,
                nfree,
            } => self.open_operation(command, sid, ioid, subcommand, pv_request, nfree),
        }
    }

    fn open_operation(
        &mut self,
        command: Command,
        sid: u32,
        ioid: u32,
        subcommand: u8,
        pv_request: PvStructure,
        nfree: Option<u32>,
    ) -> Result<Vec<Frame>, MessageError> {
        // The channel may have gone while we waited
        let Some(pv) = self.channel_pv(sid) else {
            return Ok(vec![failure(command, ioid, subcommand, "No such channel")]);
        };
        if command == Command::Rpc {
            if !pv.is_rpc() {
                return Ok(vec![failure(command, ioid, subcommand, "PV does not take calls")]);
            }
            debug!("Client {} opened RPC {ioid} on '{}'", self.peer, pv.name());
            self.operations.insert(ioid, ServerOperation {
                sid,
                pv,
                kind: OperationKind::Rpc,
            });
            return Ok(vec![success(command, ioid, subcommand, Bytes::new())]);
        }
        if command == Command::Put && !pv.is_writable() {
            return Ok(vec![failure(command, ioid, subcommand, "PV is read-only")]);
        }

        let request = FieldRequest::from_pv_request(pv_request.value());
        let projection = match Projection::new(pv.desc(), &request) {
            Ok(projection) => projection,
            Err(e) => return Ok(vec![failure(command, ioid, subcommand, e.to_string())]),
        };
        let mut body = BytesMut::new();
        self.outgoing_types
            .encode_type(&projection.type_descriptor(), &mut body);
        let kind = match command {
            Command::Get => OperationKind::Get(projection),
            Command::Put => OperationKind::Put(projection),
            _ => {
                let window = nfree
                    .or_else(|| {
                        request
                            .pipeline()
                            .then(|| request.queue_size().unwrap_or(DEFAULT_QUEUE_SIZE))
                    })
                    .map(|w| w.max(1));
                if let Err(e) =
                    pv.add_monitor(self.id, ioid, projection.clone(), window, self.events_tx.clone())
                {
                    return Ok(vec![failure(command, ioid, subcommand, e.to_string())]);
                }
                OperationKind::Monitor(projection)
            }
        };
        debug!("Client {} opened {command:?} {ioid} on '{}'", self.peer, pv.name());
        self.operations
            .insert(ioid, ServerOperation { sid, pv, kind });
        Ok(vec![success(command, ioid, subcommand, body)])
    }

    /// Run a handler away from the circuit, and reply when it is done
    fn complete_later<F>(&self, command: Command, ioid: u32, subcommand: u8, handler: F)
    where
        F: FnOnce() -> Result<Option<PvStructure>, String> + Send + 'static,
    {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(handler)
                .await
                .unwrap_or_else(|e| Err(format!("Handler failed: {e}")));
            let _ = events.send(ServerCircuitEvent::Completed {
                command,
                ioid,
                subcommand,
                result,
            });
        });
    }

    fn handle_event(&mut self, event: ServerCircuitEvent) -> Result<Vec<Frame>, MessageError> {
        match event {
            ServerCircuitEvent::MonitorData {
                ioid,
                value,
                changed,
                overrun,
            } => {
                let Some(ServerOperation {
                    kind: OperationKind::Monitor(projection),
                    pv,
                    ..
                }) = self.operations.get(&ioid)
                else {
                    return Ok(Vec::new());
                };
                // Earlier frames are written by now, so let the next update queue
                pv.monitor_dequeued(self.id, ioid);
                let mut body = BytesMut::new();
                changed.encode(&mut body);
                encode_changed(projection.desc(), &value, &changed, &mut body)?;
                overrun.encode(&mut body);
                Ok(vec![
                    OperationResponse {
                        command: Command::Monitor,
                        ioid,
                        subcommand: 0,
                        status: None,
                        body: body.freeze(),
                    }
                    .to_frame(),
                ])
            }
            ServerCircuitEvent::PvClosed(pv) => {
                let mut frames = Vec::new();
                let sids: Vec<u32> = self
                    .channels
                    .iter()
                    .filter(|(_, c)| c.pv.same_pv(&pv))
                    .map(|(sid, _)| *sid)
                    .collect();
                for sid in sids {
                    let ioids: Vec<u32> = self
                        .operations
                        .iter()
                        .filter(|(_, op)| op.sid == sid)
                        .map(|(ioid, _)| *ioid)
                        .collect();
                    for ioid in ioids {
                        if let Some(op) = self.operations.remove(&ioid) {
                            if let OperationKind::Monitor(_) = op.kind {
                                frames.push(success(
                                    Command::Monitor,
                                    ioid,
                                    SUBCMD_DESTROY,
                                    Bytes::new(),
                                ));
                            }
                        }
                    }
                    if let Some(channel) = self.channels.remove(&sid) {
                        frames.push(DestroyChannel { sid, cid: channel.cid }.to_frame(true));
                    }
                }
                debug!("PV '{}' closed, dropped {} messages", pv.name(), frames.len());
                Ok(frames)
            }
            ServerCircuitEvent::Authorized {
                ioid,
                operation,
                allowed,
                request,
            } => self.resume_authorized(ioid, operation, allowed, request),
            ServerCircuitEvent::Completed {
                command,
                ioid,
                subcommand,
                result,
            } => match result {
                Ok(value) => {
                    let mut body = BytesMut::new();
                    if let Some(value) = value {
                        messages::encode_structure(&mut self.outgoing_types, &value, &mut body)?;
                    }
                    Ok(vec![success(command, ioid, subcommand, body)])
                }
                Err(message) => {
                    debug!("Request {ioid} failed: {message}");
                    Ok(vec![failure(command, ioid, subcommand, message)])
                }
            },
        }
    }
}
