use bytes::{BufMut, Bytes, BytesMut};
use std::{
    collections::HashMap,
    future,
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf, split},
    net::TcpStream,
    select,
    sync::{mpsc, oneshot},
};
use tokio_stream::StreamExt;
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{debug, debug_span, error, trace, warn};

use crate::{
    client::{
        ClientError,
        subscription::{Acknowledger, Delivery, MonitorEvent, MonitorUpdate},
    },
    messages::{
        self, ClientIdentity, Command, CreateChannel, CreateChannelResponse, DestroyChannel,
        Frame, GetFieldRequest, Guid, OperationRequest, OperationResponse, RequestIds,
        SUBCMD_DEFAULT, SUBCMD_DESTROY, SUBCMD_GET, SUBCMD_INIT, SUBCMD_MONITOR_START,
        SUBCMD_PIPELINE, ServerNotice, Status, ValidationRequest, ValidationResponse,
    },
    pvdata::{
        ChangeBitSet, FieldLayout, PvStructure, Structure, StructureDesc, TypeDescriptor,
        TypeMismatch, TypeRegistry, Value, WireReader,
        codec::{decode_changed, encode_changed},
    },
    request::FieldRequest,
    transport::{FrameCodec, write_frames},
};

/// Receive buffer size we tell servers about
const CLIENT_BUFFER_SIZE: u32 = 16384;

type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

/// Requests from channel handles to their circuit.
///
/// Operations go through a bounded queue. Acknowledgements, cancellations and
/// channel destruction go through an unbounded one so they are never dropped.
pub(crate) enum CircuitRequest {
    CreateChannel {
        cid: u32,
        name: String,
        reply: Reply<(u32, CancellationToken)>,
    },
    DestroyChannel {
        cid: u32,
    },
    /// Read a single value from the server
    Get {
        cid: u32,
        ioid: u32,
        request: FieldRequest,
        reply: Reply<PvStructure>,
    },
    Put {
        cid: u32,
        ioid: u32,
        field: String,
        value: Value,
        reply: Reply<()>,
    },
    Info {
        cid: u32,
        ioid: u32,
        sub_field: String,
        reply: Reply<TypeDescriptor>,
    },
    Rpc {
        cid: u32,
        ioid: u32,
        argument: PvStructure,
        reply: Reply<PvStructure>,
    },
    /// Start a subscription to a PV on the server
    Monitor {
        cid: u32,
        ioid: u32,
        request: FieldRequest,
        pipeline: Option<u32>,
        updates: mpsc::UnboundedSender<Delivery>,
        ended: CancellationToken,
        reply: Reply<()>,
    },
    MonitorAck {
        ioid: u32,
        count: u32,
    },
    /// The requester gave up on an operation
    Cancel {
        ioid: u32,
    },
}

/// Settings shared by every circuit of a client
#[derive(Debug, Clone)]
pub(crate) struct CircuitConfig {
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
    pub identity: ClientIdentity,
}

/// Handle to a TCP connection to one server, shared by all channels on it
#[derive(Debug, Clone)]
pub(crate) struct Circuit {
    address: SocketAddr,
    guid: Guid,
    cancel: CancellationToken,
    requests_tx: mpsc::Sender<CircuitRequest>,
    control_tx: mpsc::UnboundedSender<CircuitRequest>,
    next_ioid: Arc<AtomicU32>,
}

/// Answer the server's validation request, and wait to be validated
pub(crate) async fn handshake<R, W>(
    framed: &mut FramedRead<R, FrameCodec>,
    writer: &mut W,
    identity: &ClientIdentity,
) -> Result<(), ClientError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        if frame.header.is_control() {
            trace!("Ignoring control message {} in handshake", frame.header.command);
            continue;
        }
        match frame.command()? {
            Command::ConnectionValidation => {
                let request = ValidationRequest::parse(&mut frame.reader())?;
                debug!("Server offers authentication: {:?}", request.auth_methods);
                let identity = match identity {
                    ClientIdentity::Ca { .. } if request.auth_methods.iter().any(|m| m == "ca") => {
                        identity.clone()
                    }
                    _ => ClientIdentity::Anonymous,
                };
                let response = ValidationResponse {
                    buffer_size: CLIENT_BUFFER_SIZE.min(request.buffer_size.max(1024)),
                    registry_size: request.registry_size,
                    qos: 0,
                    identity,
                };
                write_frames(vec![response.to_frame()], writer).await?;
            }
            Command::ConnectionValidated => {
                let status = Status::parse(&mut frame.reader())?;
                return if status.is_success() {
                    Ok(())
                } else {
                    Err(ClientError::ValidationFailed(status))
                };
            }
            Command::Echo => (),
            other => warn!("Got unexpected {other:?} message during connection validation"),
        }
    }
    Err(ClientError::Disconnected)
}

/// Cancels an operation at the circuit if dropped before being disarmed
struct CancelGuard<'a> {
    control_tx: &'a mpsc::UnboundedSender<CircuitRequest>,
    ioid: u32,
    armed: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.control_tx.send(CircuitRequest::Cancel { ioid: self.ioid });
        }
    }
}

impl Circuit {
    pub(crate) async fn connect(
        address: SocketAddr,
        guid: Guid,
        config: &CircuitConfig,
    ) -> Result<Self, ClientError> {
        debug!("Connecting new Circuit to {address}");
        let tcp = tokio::time::timeout(config.connection_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ClientError::Timeout)??;
        let _ = tcp.set_nodelay(true);
        let (tcp_rx, mut tcp_tx) = split(tcp);
        let mut framed = FramedRead::with_capacity(tcp_rx, FrameCodec::default(), 16384usize);
        tokio::time::timeout(
            config.connection_timeout,
            handshake(&mut framed, &mut tcp_tx, &config.identity),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;
        debug!("Circuit to {address} validated");
        let validated_at = Instant::now();

        let (requests_tx, requests_rx) = mpsc::channel(64);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let internal = CircuitInternal {
            address,
            requests_rx,
            control_tx: control_tx.clone(),
            control_rx,
            cancel: cancel.clone(),
            connection_timeout: config.connection_timeout,
            idle_timeout: config.idle_timeout,
            last_received_message_at: validated_at,
            last_echo_sent_at: validated_at,
            no_channels_since: Some(validated_at),
            incoming_types: TypeRegistry::new(),
            outgoing_types: TypeRegistry::new(),
            channels: Default::default(),
            operations: Default::default(),
        };
        tokio::spawn(internal.circuit_lifecycle(framed, tcp_tx));

        Ok(Circuit {
            address,
            guid,
            cancel,
            requests_tx,
            control_tx,
            next_ioid: Arc::new(AtomicU32::new(1)),
        })
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    pub(crate) fn guid(&self) -> Guid {
        self.guid
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Tear down the connection; all channels on it will re-search
    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn allocate_ioid(&self) -> u32 {
        self.next_ioid.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, request: CircuitRequest) -> Result<(), ClientError> {
        self.requests_tx
            .send(request)
            .await
            .map_err(|_| ClientError::Disconnected)
    }

    /// Run an operation, cancelling it on the server if the caller gives up
    async fn operation<T>(
        &self,
        make: impl FnOnce(u32, Reply<T>) -> CircuitRequest,
    ) -> Result<T, ClientError> {
        let ioid = self.allocate_ioid();
        let (tx, rx) = oneshot::channel();
        let mut guard = CancelGuard {
            control_tx: &self.control_tx,
            ioid,
            armed: true,
        };
        self.send(make(ioid, tx)).await?;
        let result = rx.await.map_err(|_| ClientError::Disconnected);
        guard.armed = false;
        result?
    }

    /// Create a channel on the server. Returns the server ID, and a token
    /// cancelled when the channel is lost.
    pub(crate) async fn create_channel(
        &self,
        cid: u32,
        name: &str,
    ) -> Result<(u32, CancellationToken), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(CircuitRequest::CreateChannel {
            cid,
            name: name.to_owned(),
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| ClientError::Disconnected)?
    }

    pub(crate) fn destroy_channel(&self, cid: u32) {
        let _ = self.control_tx.send(CircuitRequest::DestroyChannel { cid });
    }

    pub(crate) async fn read(
        &self,
        cid: u32,
        request: FieldRequest,
    ) -> Result<PvStructure, ClientError> {
        self.operation(|ioid, reply| CircuitRequest::Get {
            cid,
            ioid,
            request,
            reply,
        })
        .await
    }

    pub(crate) async fn write(&self, cid: u32, field: &str, value: Value) -> Result<(), ClientError> {
        self.operation(|ioid, reply| CircuitRequest::Put {
            cid,
            ioid,
            field: field.to_owned(),
            value,
            reply,
        })
        .await
    }

    pub(crate) async fn info(&self, cid: u32, sub_field: &str) -> Result<TypeDescriptor, ClientError> {
        self.operation(|ioid, reply| CircuitRequest::Info {
            cid,
            ioid,
            sub_field: sub_field.to_owned(),
            reply,
        })
        .await
    }

    pub(crate) async fn invoke(
        &self,
        cid: u32,
        argument: PvStructure,
    ) -> Result<PvStructure, ClientError> {
        self.operation(|ioid, reply| CircuitRequest::Rpc {
            cid,
            ioid,
            argument,
            reply,
        })
        .await
    }

    /// Start a monitor. Updates flow into `updates` until `ended` is cancelled.
    pub(crate) async fn monitor(
        &self,
        cid: u32,
        request: FieldRequest,
        pipeline: Option<u32>,
        updates: mpsc::UnboundedSender<Delivery>,
        ended: CancellationToken,
    ) -> Result<u32, ClientError> {
        let mut ioid = 0;
        self.operation(|id, reply| {
            ioid = id;
            CircuitRequest::Monitor {
                cid,
                ioid: id,
                request,
                pipeline,
                updates,
                ended,
                reply,
            }
        })
        .await?;
        Ok(ioid)
    }

    pub(crate) fn stop_monitor(&self, ioid: u32) {
        let _ = self.control_tx.send(CircuitRequest::Cancel { ioid });
    }
}

#[derive(Debug)]
struct ChannelEntry {
    name: String,
    /// Server ID, once created
    sid: Option<u32>,
    token: CancellationToken,
    pending_create: Option<Reply<(u32, CancellationToken)>>,
}

enum Operation {
    Get {
        reply: Reply<PvStructure>,
        desc: Option<StructureDesc>,
    },
    Put {
        field: String,
        /// Taken once the server has told us the field types
        value: Option<Value>,
        reply: Reply<()>,
    },
    Info {
        reply: Reply<TypeDescriptor>,
    },
    Rpc {
        argument: Option<PvStructure>,
        reply: Reply<PvStructure>,
    },
    Monitor {
        /// Known once the server has described the type
        shape: Option<MonitorShape>,
        value: Structure,
        pipeline: Option<u32>,
        updates: mpsc::UnboundedSender<Delivery>,
        ended: CancellationToken,
        reply: Option<Reply<()>>,
        /// The first update is the full initial value
        seen_initial: bool,
    },
}

impl Operation {
    fn fail(self, error: impl FnOnce() -> ClientError) {
        match self {
            Operation::Get { reply, .. } => {
                let _ = reply.send(Err(error()));
            }
            Operation::Put { reply, .. } => {
                let _ = reply.send(Err(error()));
            }
            Operation::Info { reply } => {
                let _ = reply.send(Err(error()));
            }
            Operation::Rpc { reply, .. } => {
                let _ = reply.send(Err(error()));
            }
            Operation::Monitor { reply, ended, .. } => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(error()));
                }
                ended.cancel();
            }
        }
    }
}

/// The type of a monitored value, and its field numbering
struct MonitorShape {
    desc: StructureDesc,
    layout: FieldLayout,
}

struct PendingOperation {
    cid: u32,
    sid: u32,
    operation: Operation,
}

// Inner circuit state, used to hold async management data
struct CircuitInternal {
    /// A copy of the address we are connected to
    address: SocketAddr,
    requests_rx: mpsc::Receiver<CircuitRequest>,
    /// For handing to monitor subscriptions so they can acknowledge
    control_tx: mpsc::UnboundedSender<CircuitRequest>,
    control_rx: mpsc::UnboundedReceiver<CircuitRequest>,
    cancel: CancellationToken,
    connection_timeout: Duration,
    idle_timeout: Duration,
    /// When the last message was received. Used to calculate Echo timing.
    last_received_message_at: Instant,
    last_echo_sent_at: Instant,
    /// Set while no channels use this circuit
    no_channels_since: Option<Instant>,
    /// Types the server has described to us
    incoming_types: TypeRegistry,
    /// Types we have described to the server
    outgoing_types: TypeRegistry,
    channels: HashMap<u32, ChannelEntry>,
    operations: HashMap<u32, PendingOperation>,
}

impl CircuitInternal {
    async fn circuit_lifecycle(
        mut self,
        mut framed: FramedRead<ReadHalf<TcpStream>, FrameCodec>,
        mut tcp_tx: WriteHalf<TcpStream>,
    ) {
        debug!("Started circuit to {}", self.address);
        let activity_period = self.connection_timeout / 2;
        loop {
            // Echo on a fixed period, so the server sees us even while it does all the talking
            let next_timing_stop = self.last_echo_sent_at + activity_period;
            let idle = self.idle_deadline();
            let frames_out = select! {
                // Queued operations go first, so a cancel never overtakes its request
                biased;
                _ = self.cancel.cancelled() => break,
                request = self.requests_rx.recv() => match request {
                    None => break,
                    Some(req) => self.handle_request(req),
                },
                Some(req) = self.control_rx.recv() => self.handle_request(req),
                incoming = framed.next() => match incoming {
                    Some(Ok(frame)) => match self.handle_message(frame) {
                        Ok(frames) => frames,
                        Err(e) => {
                            error!("Invalid message from {}, closing circuit: {e}", self.address);
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        error!("Got error processing server message: {e}");
                        break;
                    }
                    None => {
                        debug!("Server {} closed the connection", self.address);
                        break;
                    }
                },
                _ = tokio::time::sleep_until(next_timing_stop.into()) => {
                    if self.last_echo_sent_at <= self.last_received_message_at {
                        self.last_echo_sent_at = Instant::now();
                        vec![Frame::new(Command::Echo, false, Bytes::new())]
                    } else {
                        // We sent an echo already, this is the termination time
                        error!("Received no reply from server, assuming connection dead");
                        break
                    }
                },
                _ = idle => {
                    debug!("Circuit to {} unused, closing", self.address);
                    break
                },
            };

            if let Err(e) = write_frames(frames_out, &mut tcp_tx).await {
                error!("Failed to write messages to io stream, aborting: {e}");
                break;
            }
        }
        self.cancel.cancel();
        for (_, channel) in self.channels.drain() {
            if let Some(reply) = channel.pending_create {
                let _ = reply.send(Err(ClientError::Disconnected));
            }
        }
        for (_, pending) in self.operations.drain() {
            pending.operation.fail(|| ClientError::Disconnected);
        }
        let _ = tcp_tx.shutdown().await;
        debug!("Circuit to {} closed", self.address);
    }

    /// Resolves once the circuit has been unused for the idle timeout
    fn idle_deadline(&self) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        match self.no_channels_since {
            Some(since) => Box::pin(tokio::time::sleep_until((since + self.idle_timeout).into())),
            None => Box::pin(future::pending()),
        }
    }

    fn update_idle(&mut self) {
        if self.channels.is_empty() {
            self.no_channels_since.get_or_insert_with(Instant::now);
        } else {
            self.no_channels_since = None;
        }
    }

    fn encode_request(&mut self, request: &FieldRequest, buf: &mut BytesMut) -> Result<(), TypeMismatch> {
        messages::encode_structure(&mut self.outgoing_types, &request.to_pv_request(), buf)
    }

    fn handle_request(&mut self, request: CircuitRequest) -> Vec<Frame> {
        match request {
            CircuitRequest::CreateChannel { cid, name, reply } => {
                let _span = debug_span!("create_channel", cid = cid).entered();
                debug!("Creating channel '{name}' cid: {cid}");
                self.channels.insert(
                    cid,
                    ChannelEntry {
                        name: name.clone(),
                        sid: None,
                        token: self.cancel.child_token(),
                        pending_create: Some(reply),
                    },
                );
                self.update_idle();
                vec![
                    CreateChannel {
                        channels: vec![(cid, name)],
                    }
                    .to_frame(),
                ]
            }
            CircuitRequest::DestroyChannel { cid } => {
                let Some(channel) = self.channels.remove(&cid) else {
                    return Vec::new();
                };
                let _span = debug_span!("destroy_channel", cid = cid).entered();
                debug!("Destroying channel '{}'", channel.name);
                self.update_idle();
                channel.token.cancel();
                let mut frames = Vec::new();
                let orphaned: Vec<u32> = self
                    .operations
                    .iter()
                    .filter(|(_, op)| op.cid == cid)
                    .map(|(ioid, _)| *ioid)
                    .collect();
                for ioid in orphaned {
                    if let Some(pending) = self.operations.remove(&ioid) {
                        pending.operation.fail(|| ClientError::ChannelClosed);
                    }
                }
                if let Some(sid) = channel.sid {
                    frames.push(DestroyChannel { sid, cid }.to_frame(false));
                }
                frames
            }
            CircuitRequest::Get {
                cid,
                ioid,
                request,
                reply,
            } => self.start_operation(cid, ioid, Command::Get, &request, None, Operation::Get {
                reply,
                desc: None,
            }),
            CircuitRequest::Put {
                cid,
                ioid,
                field,
                value,
                reply,
            } => {
                let request = if field.is_empty() {
                    FieldRequest::all()
                } else {
                    FieldRequest::all().with_field(&field)
                };
                self.start_operation(cid, ioid, Command::Put, &request, None, Operation::Put {
                    field,
                    value: Some(value),
                    reply,
                })
            }
            CircuitRequest::Info {
                cid,
                ioid,
                sub_field,
                reply,
            } => {
                let Some(sid) = self.sid_for(cid) else {
                    let _ = reply.send(Err(ClientError::ChannelClosed));
                    return Vec::new();
                };
                self.operations.insert(ioid, PendingOperation {
                    cid,
                    sid,
                    operation: Operation::Info { reply },
                });
                vec![GetFieldRequest { sid, ioid, sub_field }.to_frame()]
            }
            CircuitRequest::Rpc {
                cid,
                ioid,
                argument,
                reply,
            } => self.start_operation(
                cid,
                ioid,
                Command::Rpc,
                &FieldRequest::all(),
                None,
                Operation::Rpc {
                    argument: Some(argument),
                    reply,
                },
            ),
            CircuitRequest::Monitor {
                cid,
                ioid,
                mut request,
                pipeline,
                updates,
                ended,
                reply,
            } => {
                if let Some(window) = pipeline {
                    request.set_option("pipeline", "true");
                    request.set_option("queueSize", &window.to_string());
                }
                self.start_operation(cid, ioid, Command::Monitor, &request, pipeline, Operation::Monitor {
                    shape: None,
                    value: Structure::new(),
                    pipeline,
                    updates,
                    ended,
                    reply: Some(reply),
                    seen_initial: false,
                })
            }
            CircuitRequest::MonitorAck { ioid, count } => {
                let Some(pending) = self.operations.get(&ioid) else {
                    return Vec::new();
                };
                trace!("Acknowledging {count} updates on {ioid}");
                let mut body = BytesMut::new();
                body.put_u32_le(count);
                vec![
                    OperationRequest::new(Command::Monitor, pending.sid, ioid, SUBCMD_PIPELINE)
                        .with_body(body)
                        .to_frame(),
                ]
            }
            CircuitRequest::Cancel { ioid } => {
                let Some(pending) = self.operations.remove(&ioid) else {
                    return Vec::new();
                };
                debug!("Cancelling request {ioid}");
                let sid = pending.sid;
                pending.operation.fail(|| ClientError::Timeout);
                vec![RequestIds { sid, ioid }.to_frame(Command::DestroyRequest)]
            }
        }
    }

    fn sid_for(&self, cid: u32) -> Option<u32> {
        self.channels.get(&cid).and_then(|c| c.sid)
    }

    /// Send the INIT stage of a multi-stage operation
    fn start_operation(
        &mut self,
        cid: u32,
        ioid: u32,
        command: Command,
        request: &FieldRequest,
        pipeline: Option<u32>,
        operation: Operation,
    ) -> Vec<Frame> {
        let _span = debug_span!("handle_request", cid = cid, ioid = ioid).entered();
        let Some(sid) = self.sid_for(cid) else {
            operation.fail(|| ClientError::ChannelClosed);
            return Vec::new();
        };
        let mut body = BytesMut::new();
        if let Err(e) = self.encode_request(request, &mut body) {
            operation.fail(|| ClientError::Type(e));
            return Vec::new();
        }
        let mut subcommand = SUBCMD_INIT;
        if let Some(window) = pipeline {
            subcommand |= SUBCMD_PIPELINE;
            body.put_u32_le(window);
        }
        debug!("Sending {command:?} request {ioid} for channel {cid}");
        self.operations.insert(ioid, PendingOperation {
            cid,
            sid,
            operation,
        });
        vec![
            OperationRequest::new(command, sid, ioid, subcommand)
                .with_body(body)
                .to_frame(),
        ]
    }

    fn handle_message(&mut self, frame: Frame) -> Result<Vec<Frame>, ClientError> {
        self.last_received_message_at = Instant::now();
        if frame.header.is_control() {
            trace!("Received control message {}", frame.header.command);
            return Ok(Vec::new());
        }
        let command = match frame.command() {
            Ok(command) => command,
            Err(e) => {
                warn!("Ignoring message from server: {e}");
                return Ok(Vec::new());
            }
        };
        trace!("Received {command:?} ({} bytes)", frame.payload.len());
        let mut reader = frame.reader();
        match command {
            // Echo just bumps our last_received message counter
            Command::Echo => Ok(Vec::new()),
            Command::CreateChannel => {
                let msg = CreateChannelResponse::parse(&mut reader)?;
                Ok(self.handle_create_channel(msg))
            }
            Command::DestroyChannel => {
                let msg = DestroyChannel::parse(&mut reader)?;
                let _span = debug_span!("handle_message", cid = msg.cid).entered();
                if let Some(channel) = self.channels.remove(&msg.cid) {
                    debug!("Server destroyed channel '{}'", channel.name);
                    channel.token.cancel();
                    self.operations.retain(|_, op| {
                        if op.cid == msg.cid {
                            // Leave it to the channel to notice, through its token
                            if let Operation::Monitor { ended, .. } = &op.operation {
                                ended.cancel();
                            }
                            false
                        } else {
                            true
                        }
                    });
                    self.update_idle();
                }
                Ok(Vec::new())
            }
            Command::Get | Command::Put | Command::Rpc | Command::Monitor => {
                let response = OperationResponse::parse(command, &mut reader)?;
                self.handle_operation_response(response)
            }
            Command::GetField => {
                let response = OperationResponse::parse(command, &mut reader)?;
                let Some(pending) = self.operations.remove(&response.ioid) else {
                    debug!("Got GetField response for unknown request {}", response.ioid);
                    return Ok(Vec::new());
                };
                let Operation::Info { reply } = pending.operation else {
                    return Err(ClientError::ServerSentInvalidMessage);
                };
                let status = response.status.unwrap_or_default();
                if !status.is_success() {
                    let _ = reply.send(Err(ClientError::OperationFailed(status)));
                    return Ok(Vec::new());
                }
                let desc = self
                    .incoming_types
                    .decode_optional_type(&mut WireReader::new(&response.body))?;
                let _ = reply.send(desc.ok_or(ClientError::ServerSentInvalidMessage));
                Ok(Vec::new())
            }
            Command::Message => {
                let notice = ServerNotice::parse(&mut reader)?;
                warn!("Server message for request {}: {}", notice.ioid, notice.message);
                Ok(Vec::new())
            }
            Command::ConnectionValidation | Command::ConnectionValidated => {
                warn!("Got unexpected validation message in normal circuit lifecycle.");
                Ok(Vec::new())
            }
            other => {
                debug!("Got unhandled message from server: {other:?}");
                Ok(Vec::new())
            }
        }
    }

    fn handle_create_channel(&mut self, msg: CreateChannelResponse) -> Vec<Frame> {
        let _span = debug_span!("handle_message", cid = msg.cid).entered();
        let Some(channel) = self.channels.get_mut(&msg.cid) else {
            debug!("Got message for closed/uncreated channel: {msg:?}");
            // The server has a channel nobody wants any more
            return if msg.status.is_success() {
                vec![DestroyChannel { sid: msg.sid, cid: msg.cid }.to_frame(false)]
            } else {
                Vec::new()
            };
        };
        let Some(reply) = channel.pending_create.take() else {
            warn!("Got duplicate channel creation response for {}", msg.cid);
            return Vec::new();
        };
        if !msg.status.is_success() {
            debug!("Server refused channel '{}': {}", channel.name, msg.status);
            let _ = reply.send(Err(ClientError::ChannelCreateFailed(msg.status.message)));
            self.channels.remove(&msg.cid);
            self.update_idle();
            return Vec::new();
        }
        debug!("Channel '{}' connected with sid {}", channel.name, msg.sid);
        channel.sid = Some(msg.sid);
        if reply.send(Ok((msg.sid, channel.token.clone()))).is_err() {
            // Requester went away in the meantime
            return self.handle_request(CircuitRequest::DestroyChannel { cid: msg.cid });
        }
        Vec::new()
    }

    fn decode_structure_type(&mut self, reader: &mut WireReader) -> Result<StructureDesc, ClientError> {
        match self.incoming_types.decode_type(reader)? {
            TypeDescriptor::Structure(desc) => Ok(desc),
            _ => Err(ClientError::ServerSentInvalidMessage),
        }
    }

    fn handle_operation_response(
        &mut self,
        response: OperationResponse,
    ) -> Result<Vec<Frame>, ClientError> {
        let ioid = response.ioid;
        let Some(PendingOperation {
            cid,
            sid,
            operation,
        }) = self.operations.remove(&ioid)
        else {
            trace!("Got response for unknown or cancelled request {ioid}");
            return Ok(Vec::new());
        };
        let _span = debug_span!("handle_message", cid = cid, ioid = ioid).entered();
        let status = response.status.clone().unwrap_or_default();
        let is_init = response.subcommand & SUBCMD_INIT != 0;
        let is_destroy = response.subcommand & SUBCMD_DESTROY != 0;
        // Monitor data updates are the only responses without a status
        if response.status.is_some() && !status.is_success() {
            debug!("Request {ioid} failed: {status}");
            operation.fail(|| ClientError::OperationFailed(status));
            return Ok(Vec::new());
        }
        let mut reader = WireReader::new(&response.body);
        let mut frames = Vec::new();
        let next = match operation {
            Operation::Get { reply, desc: None } if is_init => {
                let desc = self.decode_structure_type(&mut reader)?;
                frames.push(
                    OperationRequest::new(Command::Get, sid, ioid, SUBCMD_GET | SUBCMD_DESTROY)
                        .to_frame(),
                );
                Operation::Get {
                    reply,
                    desc: Some(desc),
                }
            }
            Operation::Get {
                reply,
                desc: Some(desc),
            } => {
                let changes = ChangeBitSet::decode(&mut reader)?;
                let mut value = Structure::default_for(&desc);
                decode_changed(&desc, &mut value, &changes, &mut reader)?;
                let _ = reply.send(Ok(PvStructure::new_unchecked(
                    TypeDescriptor::Structure(desc),
                    value,
                )));
                return Ok(frames);
            }
            Operation::Put {
                field,
                value: Some(value),
                reply,
            } if is_init => {
                let desc = self.decode_structure_type(&mut reader)?;
                match encode_put(&desc, &field, value) {
                    Ok(body) => {
                        frames.push(
                            OperationRequest::new(Command::Put, sid, ioid, SUBCMD_DESTROY)
                                .with_body(body)
                                .to_frame(),
                        );
                        Operation::Put {
                            field,
                            value: None,
                            reply,
                        }
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        frames.push(RequestIds { sid, ioid }.to_frame(Command::DestroyRequest));
                        return Ok(frames);
                    }
                }
            }
            Operation::Put {
                value: None, reply, ..
            } => {
                let _ = reply.send(Ok(()));
                return Ok(frames);
            }
            Operation::Rpc {
                argument: Some(argument),
                reply,
            } if is_init => {
                let mut body = BytesMut::new();
                messages::encode_structure(&mut self.outgoing_types, &argument, &mut body)?;
                frames.push(
                    OperationRequest::new(Command::Rpc, sid, ioid, SUBCMD_DEFAULT | SUBCMD_DESTROY)
                        .with_body(body)
                        .to_frame(),
                );
                Operation::Rpc {
                    argument: None,
                    reply,
                }
            }
            Operation::Rpc {
                argument: None,
                reply,
            } => {
                let result = messages::decode_structure(&mut self.incoming_types, &mut reader)?;
                let _ = reply.send(Ok(result));
                return Ok(frames);
            }
            Operation::Monitor {
                pipeline,
                updates,
                ended,
                reply,
                ..
            } if is_init => {
                let desc = self.decode_structure_type(&mut reader)?;
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
                frames.push(
                    OperationRequest::new(Command::Monitor, sid, ioid, SUBCMD_MONITOR_START)
                        .to_frame(),
                );
                Operation::Monitor {
                    value: Structure::default_for(&desc),
                    shape: Some(MonitorShape {
                        layout: FieldLayout::of(&desc),
                        desc,
                    }),
                    pipeline,
                    updates,
                    ended,
                    reply: None,
                    seen_initial: false,
                }
            }
            Operation::Monitor { ended, .. } if is_destroy => {
                debug!("Server ended monitor {ioid}: {status}");
                ended.cancel();
                return Ok(frames);
            }
            Operation::Monitor {
                shape: Some(shape),
                mut value,
                pipeline,
                updates,
                ended,
                reply,
                seen_initial,
            } => {
                let changes = ChangeBitSet::decode(&mut reader)?;
                decode_changed(&shape.desc, &mut value, &changes, &mut reader)?;
                let overrun = ChangeBitSet::decode(&mut reader)?;
                let delivery = Delivery {
                    event: MonitorEvent::Update(MonitorUpdate {
                        value: PvStructure::new_unchecked(
                            TypeDescriptor::Structure(shape.desc.clone()),
                            value.clone(),
                        ),
                        changed: shape.layout.expand(&changes),
                        overrun: shape.layout.expand(&overrun),
                    }),
                    initial: !seen_initial,
                    ack: pipeline.map(|window| Acknowledger {
                        requests: self.control_tx.clone(),
                        ioid,
                        window,
                    }),
                };
                if updates.send(delivery).is_err() {
                    debug!("Subscription {ioid} has no listener: Cancelling");
                    frames.push(RequestIds { sid, ioid }.to_frame(Command::DestroyRequest));
                    return Ok(frames);
                }
                Operation::Monitor {
                    shape: Some(shape),
                    value,
                    pipeline,
                    updates,
                    ended,
                    reply,
                    seen_initial: true,
                }
            }
            _ => return Err(ClientError::ServerSentInvalidMessage),
        };
        self.operations.insert(
            ioid,
            PendingOperation {
                cid,
                sid,
                operation: next,
            },
        );
        Ok(frames)
    }
}

/// Build the body of a put that writes `value` into `field` of `desc`
fn encode_put(desc: &StructureDesc, field: &str, value: Value) -> Result<BytesMut, ClientError> {
    let layout = FieldLayout::of(desc);
    let index = layout
        .index_of(field)
        .ok_or_else(|| ClientError::UnknownField(field.to_owned()))?;
    let mut full = Structure::default_for(desc);
    if field.is_empty() {
        TypeDescriptor::Structure(desc.clone()).check(&value)?;
        if let Value::Structure(structure) = value {
            full = structure;
        }
    } else {
        let field_desc = desc
            .locate(field)
            .ok_or_else(|| ClientError::UnknownField(field.to_owned()))?;
        let converted = value.convert_to(field_desc)?;
        if let Some(target) = full.locate_mut(field) {
            *target = converted;
        }
    }
    let changes: ChangeBitSet = [index].into_iter().collect();
    let mut body = BytesMut::new();
    changes.encode(&mut body);
    encode_changed(desc, &full, &changes, &mut body)?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pvdata::ScalarType;

    #[test]
    fn test_encode_put_converts_value() {
        let desc = StructureDesc::new("")
            .field("value", TypeDescriptor::Scalar(ScalarType::Double))
            .field("tag", TypeDescriptor::Scalar(ScalarType::String));
        let body = encode_put(&desc, "value", Value::Int(4)).unwrap();
        let mut reader = WireReader::new(&body);
        let changes = ChangeBitSet::decode(&mut reader).unwrap();
        assert_eq!(changes.iter().collect::<Vec<_>>(), vec![1]);
        let mut value = Structure::default_for(&desc);
        decode_changed(&desc, &mut value, &changes, &mut reader).unwrap();
        assert_eq!(value.get("value"), Some(&Value::Double(4.0)));
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_control_requests_survive_a_full_queue() {
        let (requests_tx, _requests_rx) = mpsc::channel(1);
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let circuit = Circuit {
            address: "127.0.0.1:5075".parse().unwrap(),
            guid: Guid::random(),
            cancel: CancellationToken::new(),
            requests_tx,
            control_tx,
            next_ioid: Arc::new(AtomicU32::new(1)),
        };
        // Occupy the only slot in the operation queue
        let (reply, _) = oneshot::channel();
        circuit
            .requests_tx
            .try_send(CircuitRequest::Info {
                cid: 1,
                ioid: 1,
                sub_field: String::new(),
                reply,
            })
            .unwrap();

        let (updates, receiver) = mpsc::unbounded_channel();
        let mut subscription =
            crate::client::Subscription::new("demo", receiver, CancellationToken::new());
        let desc = StructureDesc::new("").field("value", TypeDescriptor::Scalar(ScalarType::Int));
        for n in 0..3i32 {
            updates
                .send(Delivery {
                    event: MonitorEvent::Update(MonitorUpdate {
                        value: PvStructure::new(desc.clone(), Structure::new().with("value", n))
                            .unwrap(),
                        changed: [1].into_iter().collect(),
                        overrun: ChangeBitSet::new(),
                    }),
                    initial: n == 0,
                    ack: Some(Acknowledger {
                        requests: circuit.control_tx.clone(),
                        ioid: 5,
                        window: 2,
                    }),
                })
                .unwrap();
        }
        for _ in 0..3 {
            subscription.recv().await.unwrap();
        }
        circuit.stop_monitor(5);
        circuit.destroy_channel(2);

        assert!(matches!(
            control_rx.try_recv(),
            Ok(CircuitRequest::MonitorAck { ioid: 5, count: 1 })
        ));
        assert!(matches!(
            control_rx.try_recv(),
            Ok(CircuitRequest::MonitorAck { ioid: 5, count: 1 })
        ));
        assert!(matches!(
            control_rx.try_recv(),
            Ok(CircuitRequest::Cancel { ioid: 5 })
        ));
        assert!(matches!(
            control_rx.try_recv(),
            Ok(CircuitRequest::DestroyChannel { cid: 2 })
        ));
    }

    #[test]
    fn test_encode_put_rejects_unknown_field() {
        let desc = StructureDesc::new("").field("value", TypeDescriptor::Scalar(ScalarType::Int));
        assert!(matches!(
            encode_put(&desc, "missing", Value::Int(1)),
            Err(ClientError::UnknownField(_))
        ));
        assert!(matches!(
            encode_put(&desc, "value", Value::from("nope")),
            Err(ClientError::Conversion(_))
        ));
    }
}
