//! Connection supervisor: accept loop, versioned handshake, and
//! per-connection frame routing (`spec.md` §4.1, §5, §6, §8).
//!
//! Mirrors the shape of the teacher's `accept_connections`/`handle_client`
//! pair in `server/legacy.rs`: a `watch::channel` shutdown signal raced
//! against `listener.accept()` inside a `tokio::select!`-driven
//! [`JoinSet`], then a split-socket handshake followed by framed
//! steady-state I/O. Unlike the teacher's single reader/writer pair per
//! connection, each connection here also runs a writer task so outbound
//! callback frames posted by [`CallbackEngine`] interleave with request
//! replies on the same socket without the reader blocking on a send.
//!
//! The wire layout for each [`MessageKind`]'s payload is this connection
//! layer's own invention layered on top of [`crate::marshal`]'s value
//! encoding; it is not dictated by `spec.md`, which only fixes the frame
//! header and the four argument encodings.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::{Buf, BufMut, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io as tokio_io,
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    task::JoinSet,
    time::timeout,
};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::{
    callback::{CallbackEngine, ClientException, WellKnownInterface, find_single_abstract_method},
    config::{DispatchMode, EngineConfig},
    dispatcher::{
        ArrayFactory, CallMode, ClassInjector, Constructible, ConstructorRegistry, Dispatcher, Invokable,
        InstanceLookup, ReturnFormat,
    },
    error::EngineError,
    frame::{Frame, HEADER_LEN, MessageKind, codec::FrameCodec},
    handshake::{exchange_banner, read_client_greeting, write_error_reply, write_success_reply},
    ids::{ClientThreadId, Handle, LogicalThreadId, RequestId, TypeId},
    marshal::{self, PrimitiveCode, Value, ValueShape},
    registry::{CallableDescriptor, HostObject, SpecificityMatrix, TypeDescriptor, TypeRegistry},
    workers::WorkerPool,
};

/// How long the handshake (banner exchange plus greeting) may take before
/// the connection is abandoned (`spec.md` §6, §8 scenario 1).
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Self-describing value tags used only for [`MessageKind::CallbackResponse`]
/// payloads, the one place a value arrives with no declared type to shape
/// its decoding (`spec.md` §4.7).
mod callback_value_tag {
    pub const BOOLEAN: u8 = 0;
    pub const INT: u8 = 1;
    pub const LONG: u8 = 2;
    pub const DOUBLE: u8 = 3;
    pub const STR: u8 = 4;
    pub const REFERENCE: u8 = 5;
    pub const CLIENT_OBJECT: u8 = 6;
}

/// Per-connection collaborators the dispatcher needs but does not own
/// itself (`spec.md` §4.6): instance lookup, array allocation, class
/// injection, and constructor resolution. One implementation is shared
/// across every connection a [`ConnectionSupervisor`] accepts, the same
/// way the teacher threads one `DbPool`/`Argon2` pair through every
/// `HandlerContext`.
pub trait ConnectionHooks: Send + Sync {
    /// Build (or hand back a shared) instance-lookup hook for a new
    /// connection.
    fn instance_lookup(&self) -> Arc<dyn InstanceLookup>;
    /// Build (or hand back a shared) array factory for a new connection.
    fn array_factory(&self) -> Arc<dyn ArrayFactory>;
    /// Build (or hand back a shared) class injector for a new connection,
    /// or `None` to disable `INJECT_CLASS`/`INJECT_SOURCE`.
    fn class_injector(&self) -> Option<Arc<dyn ClassInjector>>;
    /// Build (or hand back a shared) constructor registry for a new
    /// connection.
    fn constructor_registry(&self) -> Arc<dyn ConstructorRegistry>;
}

/// Process-wide state shared by every connection: the type registry, the
/// lock manager, engine configuration, and the embedder's connection
/// hooks (`spec.md` §5: "registry and lock manager are process-wide;
/// everything else is per-connection").
pub struct Engine {
    /// Shared, process-wide type registry.
    pub registry: Arc<TypeRegistry>,
    /// Shared lock manager.
    pub locks: Arc<crate::locks::LockManager>,
    /// Engine-wide configuration, cloned into each connection's
    /// dispatcher.
    pub config: EngineConfig,
    /// Embedder-supplied per-connection collaborators.
    pub hooks: Arc<dyn ConnectionHooks>,
}

/// Accepts connections on a bound listener and runs each to completion
/// under a shared shutdown signal (`spec.md` §5, §8).
pub struct ConnectionSupervisor {
    listener: TcpListener,
    engine: Arc<Engine>,
    next_connection_id: AtomicU64,
}

impl ConnectionSupervisor {
    /// Construct a supervisor for an already-bound listener.
    #[must_use]
    pub const fn new(listener: TcpListener, engine: Arc<Engine>) -> Self {
        Self {
            listener,
            engine,
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Run the accept loop until `shutdown` fires, then wait for every
    /// spawned connection task to finish (`spec.md` §5, §8 scenario 7:
    /// "graceful shutdown drains in-flight connections").
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut join_set = JoinSet::new();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("connection supervisor received shutdown signal");
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    self.handle_accept(accepted, shutdown.clone(), &mut join_set);
                }
            }
        }
        await_spawned_tasks(&mut join_set).await;
    }

    fn handle_accept(
        &self,
        accepted: std::io::Result<(TcpStream, SocketAddr)>,
        shutdown: watch::Receiver<bool>,
        join_set: &mut JoinSet<()>,
    ) {
        match accepted {
            Ok((socket, peer)) => {
                let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                let engine = Arc::clone(&self.engine);
                join_set.spawn(async move {
                    if let Err(err) = handle_connection(socket, peer, connection_id, engine, shutdown).await {
                        warn!(%peer, %err, "connection ended with an error");
                    }
                });
            }
            Err(err) => error!(%err, "accept failed"),
        }
    }
}

async fn await_spawned_tasks(join_set: &mut JoinSet<()>) {
    while let Some(result) = join_set.join_next().await {
        if let Err(err) = result {
            error!(%err, "connection task panicked");
        }
    }
}

/// Per-connection admission control gating how many frames may be
/// processed concurrently (`spec.md` §4.8, §5). Mirrors
/// [`crate::config::DispatchMode`]: direct dispatch runs every frame's
/// work as soon as it is spawned, pooled dispatch admits through a
/// [`WorkerPool`] sized by [`crate::config::DispatchMode::Pooled`].
enum Admission {
    /// No admission limit beyond Tokio's own scheduler.
    Direct,
    /// Bounded by a fixed-size worker pool.
    Pooled(WorkerPool),
}

impl Admission {
    fn new(mode: DispatchMode) -> Self {
        match mode {
            DispatchMode::Direct => Self::Direct,
            DispatchMode::Pooled { worker_pool_size } => Self::Pooled(WorkerPool::new(worker_pool_size)),
        }
    }

    async fn admit<F: std::future::Future>(&self, task: F) -> F::Output {
        match self {
            Self::Direct => task.await,
            Self::Pooled(pool) => pool.run(task).await,
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    connection_id: u64,
    engine: Arc<Engine>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), EngineError> {
    let (mut read_half, mut write_half) = tokio_io::split(socket);
    if !perform_handshake(&mut read_half, &mut write_half, &engine.config).await? {
        return Ok(());
    }
    debug!(%peer, connection_id, "handshake complete");

    let socket = read_half.unsplit(write_half);
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
    let callback = Arc::new(CallbackEngine::new(outbound_tx.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&engine.registry),
        Arc::clone(&engine.locks),
        engine.config.clone(),
        engine.hooks.instance_lookup(),
        callback,
        engine.hooks.array_factory(),
        engine.hooks.class_injector(),
    ));
    let constructors = engine.hooks.constructor_registry();
    let admission = Arc::new(Admission::new(engine.config.dispatch_mode));

    let (mut sink, mut stream) = Framed::new(socket, FrameCodec::new()).split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let mut frame_tasks = JoinSet::new();
    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    None => break,
                    Some(Ok(frame)) if frame.kind == MessageKind::CallbackResponse => {
                        let request_id = frame.request_id;
                        let mut payload = BytesMut::from(&frame.payload[..]);
                        if let Err(err) = handle_callback_response(&dispatcher, request_id, &mut payload) {
                            warn!(%err, "malformed callback response");
                        }
                    }
                    Some(Ok(frame)) => {
                        let dispatcher = Arc::clone(&dispatcher);
                        let constructors = Arc::clone(&constructors);
                        let admission = Arc::clone(&admission);
                        let outbound_tx = outbound_tx.clone();
                        frame_tasks.spawn(async move {
                            let reply = admission
                                .admit(process_frame(&dispatcher, &constructors, connection_id, frame))
                                .await;
                            let _ = outbound_tx.send(reply);
                        });
                    }
                    Some(Err(err)) => {
                        warn!(%peer, %err, "frame decode error");
                        break;
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    dispatcher.callback.cancel_all();
    await_spawned_tasks(&mut frame_tasks).await;
    dispatcher.handles.clear();
    drop(outbound_tx);
    writer.abort();
    Ok(())
}

/// Perform the versioned handshake on the split halves of a freshly
/// accepted socket (`spec.md` §6, §8 scenario 1). Returns `true` if the
/// connection should proceed to steady-state frame I/O, `false` if the
/// handshake failed and the connection should simply be dropped (the
/// failure itself has already been reported to the peer where possible).
async fn perform_handshake<R, W>(reader: &mut R, writer: &mut W, config: &EngineConfig) -> Result<bool, EngineError>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    match timeout(HANDSHAKE_TIMEOUT, exchange_banner(reader, writer)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(%err, "banner exchange failed");
            return Ok(false);
        }
        Err(_) => return Ok(false),
    }
    let greeting = match timeout(HANDSHAKE_TIMEOUT, read_client_greeting(reader)).await {
        Ok(Ok(greeting)) => greeting,
        Ok(Err(err)) => {
            let _ = write_error_reply(writer, "malformed client greeting").await;
            warn!(%err, "client greeting failed to parse");
            return Ok(false);
        }
        Err(_) => {
            let _ = write_error_reply(writer, "greeting timed out").await;
            return Ok(false);
        }
    };
    debug!(pid = greeting.pid, instance_id = greeting.instance_id, "client greeting received");
    if let Err(err) = write_success_reply(writer, config).await {
        warn!(%err, "failed to write handshake success reply");
        return Ok(false);
    }
    Ok(true)
}

fn malformed(what: &str) -> EngineError {
    EngineError::MalformedRequest(format!("payload too short reading {what}"))
}

fn read_u8(src: &mut BytesMut) -> Result<u8, EngineError> {
    if src.remaining() < 1 {
        return Err(malformed("u8"));
    }
    Ok(src.get_u8())
}

fn read_u32(src: &mut BytesMut) -> Result<u32, EngineError> {
    if src.remaining() < 4 {
        return Err(malformed("u32"));
    }
    Ok(src.get_u32())
}

fn read_i32(src: &mut BytesMut) -> Result<i32, EngineError> {
    if src.remaining() < 4 {
        return Err(malformed("i32"));
    }
    Ok(src.get_i32())
}

fn read_u64(src: &mut BytesMut) -> Result<u64, EngineError> {
    if src.remaining() < 8 {
        return Err(malformed("u64"));
    }
    Ok(src.get_u64())
}

fn read_handle(src: &mut BytesMut) -> Result<Handle, EngineError> { Ok(Handle(read_u64(src)?)) }

fn read_type_id(src: &mut BytesMut) -> Result<TypeId, EngineError> { Ok(TypeId(read_u32(src)?)) }

fn read_bytes(src: &mut BytesMut, len: usize) -> Result<Vec<u8>, EngineError> {
    if src.remaining() < len {
        return Err(malformed("byte block"));
    }
    Ok(src.split_to(len).to_vec())
}

fn read_string(src: &mut BytesMut) -> Result<String, EngineError> { Ok(marshal::read_string(src)?) }

/// Map a declared type to the shape its values take on the wire. This
/// connection layer's only use of type descriptors for marshalling: the
/// eight primitives and `java.lang.String` get their natural shape, every
/// other declared type travels by reference.
fn shape_for_type(registry: &TypeRegistry, type_id: TypeId) -> ValueShape {
    let Ok(descriptor) = registry.get(type_id) else {
        return ValueShape::Reference;
    };
    primitive_code_for_name(&descriptor.name).map_or_else(
        || {
            if descriptor.name == "java.lang.String" {
                ValueShape::Str
            } else {
                ValueShape::Reference
            }
        },
        ValueShape::Scalar,
    )
}

fn primitive_code_for_name(name: &str) -> Option<PrimitiveCode> {
    Some(match name {
        "boolean" => PrimitiveCode::Boolean,
        "byte" => PrimitiveCode::Byte,
        "char" => PrimitiveCode::Char,
        "short" => PrimitiveCode::Short,
        "int" => PrimitiveCode::Int,
        "long" => PrimitiveCode::Long,
        "float" => PrimitiveCode::Float,
        "double" => PrimitiveCode::Double,
        _ => return None,
    })
}

/// Wire tag marking an inlined string alongside an object reference,
/// distinct from every [`PrimitiveCode::code`] byte (`spec.md` §4.5).
const INLINE_STRING_TAG: u8 = b'L';

/// Canonical boxed-primitive type names eligible for opportunistic
/// inlining alongside a by-reference result (`spec.md` §4.5).
const BOXED_PRIMITIVE_NAMES: [&str; 8] = [
    "java.lang.Boolean",
    "java.lang.Byte",
    "java.lang.Character",
    "java.lang.Short",
    "java.lang.Integer",
    "java.lang.Long",
    "java.lang.Float",
    "java.lang.Double",
];

fn primitive_code_for_value(value: &Value) -> Option<PrimitiveCode> {
    Some(match value {
        Value::Boolean(_) => PrimitiveCode::Boolean,
        Value::Byte(_) => PrimitiveCode::Byte,
        Value::Char(_) => PrimitiveCode::Char,
        Value::Short(_) => PrimitiveCode::Short,
        Value::Int(_) => PrimitiveCode::Int,
        Value::Long(_) => PrimitiveCode::Long,
        Value::Float(_) => PrimitiveCode::Float,
        Value::Double(_) => PrimitiveCode::Double,
        _ => return None,
    })
}

/// The scalar value behind `handle`, if it is live and its registered
/// type is a boxed primitive or `java.lang.String` eligible for
/// opportunistic inlining (`spec.md` §4.5).
fn inline_candidate(dispatcher: &Dispatcher, handle: Handle) -> Option<Value> {
    if handle.is_null() {
        return None;
    }
    let object = dispatcher.handles.lookup(handle)?;
    let name = object.type_name();
    if BOXED_PRIMITIVE_NAMES.contains(&name) || name == "java.lang.String" {
        dispatcher.get_value_of(handle).ok()
    } else {
        None
    }
}

/// Write a type ID, handle, and opportunistic inline value (`spec.md`
/// §4.5): a trailing `i32` that is either [`marshal::NO_INLINE_SENTINEL`]
/// or a non-negative shape tag (a [`PrimitiveCode::code`] byte, or
/// [`INLINE_STRING_TAG`]) followed by the inlined value's own encoding.
fn write_object_reference(dispatcher: &Dispatcher, out: &mut BytesMut, reported_type: TypeId, handle: Handle) {
    out.put_u32(reported_type.0);
    out.put_u64(handle.0);
    match inline_candidate(dispatcher, handle) {
        Some(Value::Str(s)) if marshal::should_inline_string(s.encode_utf16().count()) => {
            out.put_i32(i32::from(INLINE_STRING_TAG));
            marshal::write_value(out, &Value::Str(s));
        }
        Some(value) => match primitive_code_for_value(&value) {
            Some(code) => {
                out.put_i32(i32::from(code.code()));
                marshal::write_value(out, &value);
            }
            None => out.put_i32(marshal::NO_INLINE_SENTINEL),
        },
        None => out.put_i32(marshal::NO_INLINE_SENTINEL),
    }
}

/// The declared type backing `descriptor`'s field/element at `index`
/// (`spec.md` §4.6 "get/set field": arrays index by element, everything
/// else by its field vector).
fn field_type_at(descriptor: &TypeDescriptor, index: u32) -> TypeId {
    if descriptor.flags.contains(crate::registry::TypeFlags::ARRAY) {
        return descriptor.element_type.unwrap_or(TypeId::VOID);
    }
    descriptor
        .fields
        .get(index as usize)
        .map_or(TypeId::VOID, |field| field.declared_type)
}

fn reply_for(request_id: RequestId, client_thread_id: ClientThreadId, result: Result<Vec<u8>, EngineError>) -> Frame {
    match result {
        Ok(payload) => Frame::new(MessageKind::Response, client_thread_id, request_id, payload),
        Err(err) => {
            let mut payload = BytesMut::new();
            marshal::write_value(&mut payload, &Value::Str(err.to_string()));
            Frame::new(MessageKind::Exception, client_thread_id, request_id, payload.to_vec())
        }
    }
}

/// Route one parsed client frame to its dispatcher handler, returning the
/// reply frame to send back. The caller guarantees `frame` is never a
/// [`MessageKind::CallbackResponse`]; those are resolved inline on the
/// reader task instead, since completing one unblocks another in-flight
/// spawned call awaiting it (`spec.md` §4.7, §5).
async fn process_frame(
    dispatcher: &Arc<Dispatcher>,
    constructors: &Arc<dyn ConstructorRegistry>,
    connection_id: u64,
    frame: Frame,
) -> Frame {
    let thread = LogicalThreadId::new(connection_id, frame.client_thread_id);
    let kind = frame.kind;
    let client_thread_id = frame.client_thread_id;
    let request_id = frame.request_id;
    let mut payload = BytesMut::from(&frame.payload[..]);

    let result = handle_message(dispatcher, constructors, thread, kind, &mut payload).await;
    reply_for(request_id, client_thread_id, result)
}

fn handle_callback_response(dispatcher: &Dispatcher, request_id: RequestId, payload: &mut BytesMut) -> Result<(), EngineError> {
    let is_exception = read_u8(payload)?;
    let outcome = if is_exception == 0 {
        Ok(read_callback_value(payload)?)
    } else {
        Err(ClientException {
            message: read_string(payload)?,
        })
    };
    dispatcher.callback_response(request_id, outcome);
    Ok(())
}

fn read_callback_value(src: &mut BytesMut) -> Result<Value, EngineError> {
    let tag = read_u8(src)?;
    let shape = match tag {
        callback_value_tag::BOOLEAN => ValueShape::Scalar(PrimitiveCode::Boolean),
        callback_value_tag::INT => ValueShape::Scalar(PrimitiveCode::Int),
        callback_value_tag::LONG => ValueShape::Scalar(PrimitiveCode::Long),
        callback_value_tag::DOUBLE => ValueShape::Scalar(PrimitiveCode::Double),
        callback_value_tag::STR => ValueShape::Str,
        callback_value_tag::REFERENCE => ValueShape::Reference,
        callback_value_tag::CLIENT_OBJECT => ValueShape::ClientObject,
        other => return Err(EngineError::MalformedRequest(format!("unknown callback value tag {other}"))),
    };
    Ok(marshal::read_value(src, &shape)?)
}

#[expect(clippy::too_many_lines, reason = "one arm per client message kind")]
async fn handle_message(
    dispatcher: &Arc<Dispatcher>,
    constructors: &Arc<dyn ConstructorRegistry>,
    thread: LogicalThreadId,
    kind: MessageKind,
    payload: &mut BytesMut,
) -> Result<Vec<u8>, EngineError> {
    match kind {
        MessageKind::InstanceLookup => {
            let has_name = read_u8(payload)? != 0;
            let name = has_name.then(|| read_string(payload)).transpose()?;
            let handle = dispatcher.instance_lookup(name.as_deref());
            let type_id = dispatcher.handle_runtime_type(handle);
            let mut out = BytesMut::new();
            out.put_u32(type_id.0);
            out.put_u64(handle.0);
            out.put_i32(marshal::NO_INLINE_SENTINEL);
            Ok(out.to_vec())
        }
        MessageKind::AddRef | MessageKind::DropRef => {
            let count = read_u32(payload)?;
            let mut handles = Vec::with_capacity(count as usize);
            for _ in 0..count {
                handles.push(read_handle(payload)?);
            }
            if kind == MessageKind::AddRef {
                dispatcher.add_refs(&handles)?;
            } else {
                dispatcher.drop_refs(&handles)?;
            }
            Ok(Vec::new())
        }
        MessageKind::TypeRequest => {
            let by_name = read_u8(payload)? != 0;
            let descriptor = if by_name {
                let name = read_string(payload)?;
                dispatcher.type_request_by_name(&name)?
            } else {
                let type_id = read_type_id(payload)?;
                dispatcher.type_request_by_id(type_id)?
            };
            let mut out = BytesMut::new();
            encode_type_descriptor(&mut out, &descriptor);
            Ok(out.to_vec())
        }
        MessageKind::MethodCall => handle_method_call(dispatcher, constructors, thread, payload).await,
        MessageKind::ToString => {
            let handle = read_handle(payload)?;
            let rendered = dispatcher.to_string_of(handle)?;
            let mut out = BytesMut::new();
            match rendered {
                Some(s) => {
                    out.put_u8(1);
                    marshal::write_value(&mut out, &Value::Str(s));
                }
                None => out.put_u8(0),
            }
            Ok(out.to_vec())
        }
        MessageKind::GetField => {
            let handle = read_handle(payload)?;
            let index = read_u32(payload)?;
            let value = dispatcher.get_field(handle, index)?;
            let mut out = BytesMut::new();
            marshal::write_value(&mut out, &value);
            Ok(out.to_vec())
        }
        MessageKind::SetField => {
            let handle = read_handle(payload)?;
            let index = read_u32(payload)?;
            let field_type = declared_field_type(dispatcher, handle, index)?;
            let shape = shape_for_type(&dispatcher.registry, field_type);
            let value = marshal::read_value(payload, &shape)?;
            dispatcher.set_field(handle, index, value)?;
            Ok(Vec::new())
        }
        MessageKind::ArrayLength => {
            let handle = read_handle(payload)?;
            let length = dispatcher.array_length(handle)?;
            let mut out = BytesMut::new();
            out.put_u32(length);
            Ok(out.to_vec())
        }
        MessageKind::NewArray => {
            let element_type = read_type_id(payload)?;
            let length = read_u32(payload)?;
            let handle = dispatcher.new_array(element_type, length)?;
            let mut out = BytesMut::new();
            out.put_u64(handle.0);
            Ok(out.to_vec())
        }
        MessageKind::Cast => {
            let handle = read_handle(payload)?;
            let from_type = read_type_id(payload)?;
            let target_type = read_type_id(payload)?;
            let cast = dispatcher.cast(handle, from_type, target_type)?;
            let mut out = BytesMut::new();
            out.put_u64(cast.0);
            Ok(out.to_vec())
        }
        MessageKind::Lock | MessageKind::Unlock => {
            let name = read_string(payload)?;
            if kind == MessageKind::Lock {
                dispatcher.lock(thread, &name)?;
            } else {
                dispatcher.unlock(thread, &name)?;
            }
            Ok(Vec::new())
        }
        MessageKind::InjectClass => {
            let len = read_u32(payload)? as usize;
            let bytecode = read_bytes(payload, len)?;
            let type_id = dispatcher.inject_class(&bytecode)?;
            let mut out = BytesMut::new();
            out.put_u32(type_id.0);
            Ok(out.to_vec())
        }
        MessageKind::InjectSource => {
            let name = read_string(payload)?;
            let source = read_string(payload)?;
            let type_id = dispatcher.inject_source(&name, &source)?;
            let mut out = BytesMut::new();
            out.put_u32(type_id.0);
            Ok(out.to_vec())
        }
        MessageKind::GetValueOf => {
            let handle = read_handle(payload)?;
            let value = dispatcher.get_value_of(handle)?;
            let mut out = BytesMut::new();
            marshal::write_value(&mut out, &value);
            Ok(out.to_vec())
        }
        MessageKind::GetCallbackHandle | MessageKind::GetProxy => {
            let target_interface = if kind == MessageKind::GetProxy {
                Some(read_type_id(payload)?)
            } else {
                let has_interface = read_u8(payload)? != 0;
                has_interface.then(|| read_type_id(payload)).transpose()?
            };
            let function_id = read_i32(payload)?;
            let proxy = dispatcher.get_callback_handle(target_interface, function_id, |_, _| false)?;
            let mut out = BytesMut::new();
            out.put_i32(proxy.function_id);
            out.put_u32(proxy.arg_count);
            Ok(out.to_vec())
        }
        MessageKind::CallbackResponse => unreachable!("resolved inline on the reader task before reaching handle_message"),
        MessageKind::Response
        | MessageKind::Exception
        | MessageKind::Evaluate
        | MessageKind::Invoke
        | MessageKind::ObjectCallback
        | MessageKind::GetAttribute
        | MessageKind::SetGlobal
        | MessageKind::CallbackToCallable
        | MessageKind::DropRefs
        | MessageKind::GetObject
        | MessageKind::InvokeAndGetObject => Err(EngineError::MalformedRequest(format!(
            "{kind:?} is a server->client message kind and is never sent by a client"
        ))),
    }
}

fn declared_field_type(dispatcher: &Dispatcher, handle: Handle, index: u32) -> Result<TypeId, EngineError> {
    let object = dispatcher.handles.lookup(handle).ok_or(crate::error::HandleError::Unknown(handle))?;
    let descriptor = dispatcher.registry.get_by_name(object.type_name())?;
    Ok(field_type_at(&descriptor, index))
}

async fn handle_method_call(
    dispatcher: &Arc<Dispatcher>,
    constructors: &Arc<dyn ConstructorRegistry>,
    thread: LogicalThreadId,
    payload: &mut BytesMut,
) -> Result<Vec<u8>, EngineError> {
    let is_constructor = read_u8(payload)? != 0;
    let call_mode = if read_u8(payload)? == 0 {
        CallMode::Synchronous
    } else {
        CallMode::NewHostThread
    };
    let type_id = read_type_id(payload)?;
    let target = read_handle(payload)?;
    let callable_index = read_u32(payload)?;
    let return_format = decode_return_format(read_u8(payload)?)?;
    let callable = dispatcher.registry.callable(type_id, callable_index, is_constructor)?;
    let args = read_call_args(dispatcher, constructors, thread, &callable, payload)?;

    let factory = constructors.constructible(type_id);
    let result = match call_mode {
        CallMode::Synchronous => {
            dispatcher.call(thread, is_constructor, type_id, target, callable_index, &args, factory.as_deref())
        }
        CallMode::NewHostThread => {
            match dispatcher
                .call_async(thread, is_constructor, type_id, target, callable_index, args)
                .wait()
                .await
            {
                Ok(inner) => inner,
                Err(crate::workers::CallFutureError::Timeout) => Err(EngineError::FutureTimeout),
                Err(crate::workers::CallFutureError::Abandoned) => Err(EngineError::ReflectionFailure {
                    cause: "method caller task was abandoned before producing a result".to_owned(),
                }),
            }
        }
    }?;

    let mut out = BytesMut::new();
    encode_call_result(dispatcher, return_format, &result.value, result.reported_type, &mut out)?;
    Ok(out.to_vec())
}

fn decode_return_format(byte: u8) -> Result<ReturnFormat, EngineError> {
    Ok(match byte {
        0 => ReturnFormat::ByReference,
        1 => ReturnFormat::ByClientReference,
        2 => ReturnFormat::ByPickle,
        3 => ReturnFormat::ByCompressedPickle,
        4 => ReturnFormat::ByBestEffortPickle,
        5 => ReturnFormat::ByCompressedBestEffortPickle,
        6 => ReturnFormat::BySharedMemory,
        other => return Err(EngineError::MalformedRequest(format!("unknown return format {other}"))),
    })
}

/// A host-side proxy binding a bound method or constructor reference into
/// a functional-interface argument value (`spec.md` §4.5
/// `ArgEncoding::MethodHandle`). Registered into the handle table like any
/// other host object; invoking it forwards to the callable it was bound
/// to at construction, ignoring the index the caller invokes through
/// since the interface it stands in for has exactly one abstract method.
struct MethodHandleProxy {
    dispatcher: Arc<Dispatcher>,
    constructors: Arc<dyn ConstructorRegistry>,
    thread: LogicalThreadId,
    is_constructor: bool,
    owning_type: TypeId,
    callable_index: u32,
    bound_instance: Option<Handle>,
    interface_name: String,
}

impl HostObject for MethodHandleProxy {
    fn type_name(&self) -> &str { &self.interface_name }

    fn as_any(&self) -> &dyn std::any::Any { self }

    fn as_invokable(&self) -> Option<&dyn Invokable> { Some(self) }
}

impl Invokable for MethodHandleProxy {
    fn invoke_method(&self, _index: u32, args: &[Value]) -> Result<Value, EngineError> {
        let factory = self.constructors.constructible(self.owning_type);
        let result = self.dispatcher.call(
            self.thread,
            self.is_constructor,
            self.owning_type,
            self.bound_instance.unwrap_or(Handle::NULL),
            self.callable_index,
            args,
            factory.as_deref(),
        )?;
        Ok(result.value)
    }

    fn get_field(&self, _index: u32) -> Result<Value, EngineError> {
        Err(EngineError::MalformedRequest("method-handle proxies have no fields".to_owned()))
    }

    fn set_field(&self, _index: u32, _value: Value) -> Result<(), EngineError> {
        Err(EngineError::MalformedRequest("method-handle proxies have no fields".to_owned()))
    }

    fn display_string(&self) -> String { format!("MethodHandle({}#{})", self.owning_type, self.callable_index) }
}

/// Read an optional handle: a flag byte, then the handle itself if the
/// flag is nonzero (`spec.md` §4.5 method-handle "bound instance").
fn read_optional_handle(payload: &mut BytesMut) -> Result<Option<Handle>, EngineError> {
    let present = read_u8(payload)? != 0;
    present.then(|| read_handle(payload)).transpose()
}

/// Confirm `descriptor` has an abstract method of arity `arg_count`,
/// either a well-known single-method interface of matching arity or the
/// unique non-default, non-static method of that arity (`spec.md` §4.7,
/// reusing the same resolution `Dispatcher::get_callback_handle` performs
/// for the opposite, client-bound direction).
fn validate_functional_arity(descriptor: &TypeDescriptor, arg_count: u32) -> Result<(), EngineError> {
    let arity_matches = WellKnownInterface::from_type_name(&descriptor.name).map_or_else(
        || find_single_abstract_method(descriptor, arg_count, |_, _| false).is_some(),
        |well_known| well_known.arity() == arg_count,
    );
    if arity_matches {
        Ok(())
    } else {
        Err(EngineError::MalformedRequest(format!(
            "interface {} has no abstract method of arity {arg_count}",
            descriptor.name
        )))
    }
}

/// Read an `ArgEncoding::MethodHandle` argument: bind a method or
/// constructor reference into a [`MethodHandleProxy`] implementing the
/// declared functional interface (`spec.md` §4.5).
fn read_method_handle_arg(
    dispatcher: &Arc<Dispatcher>,
    constructors: &Arc<dyn ConstructorRegistry>,
    thread: LogicalThreadId,
    payload: &mut BytesMut,
) -> Result<Value, EngineError> {
    let is_constructor = read_u8(payload)? != 0;
    let interface_type = read_type_id(payload)?;
    let owning_type = read_type_id(payload)?;
    let callable_index = read_u32(payload)?;
    let bound_instance = read_optional_handle(payload)?;

    let interface_descriptor = dispatcher.registry.get(interface_type)?;
    let callable = dispatcher.registry.callable(owning_type, callable_index, is_constructor)?;
    let arity = u32::try_from(callable.arg_types.len()).unwrap_or(u32::MAX);
    validate_functional_arity(&interface_descriptor, arity)?;

    let proxy = MethodHandleProxy {
        dispatcher: Arc::clone(dispatcher),
        constructors: Arc::clone(constructors),
        thread,
        is_constructor,
        owning_type,
        callable_index,
        bound_instance,
        interface_name: interface_descriptor.name,
    };
    let handle = dispatcher.handles.add_ref_object(Arc::new(proxy));
    Ok(Value::Reference(handle))
}

/// Read an `ArgEncoding::Lambda` argument: invoke the bound callable
/// immediately and use its result as the argument value (`spec.md` §4.5).
fn read_lambda_arg(
    dispatcher: &Arc<Dispatcher>,
    constructors: &Arc<dyn ConstructorRegistry>,
    thread: LogicalThreadId,
    payload: &mut BytesMut,
) -> Result<Value, EngineError> {
    let is_constructor = read_u8(payload)? != 0;
    let owning_type = read_type_id(payload)?;
    let callable_index = read_u32(payload)?;
    let bound_instance = read_optional_handle(payload)?;
    let callable = dispatcher.registry.callable(owning_type, callable_index, is_constructor)?;
    let args = read_call_args(dispatcher, constructors, thread, &callable, payload)?;
    let factory = constructors.constructible(owning_type);
    let result = dispatcher.call(
        thread,
        is_constructor,
        owning_type,
        bound_instance.unwrap_or(Handle::NULL),
        callable_index,
        &args,
        factory.as_deref(),
    )?;
    Ok(result.value)
}

fn read_call_args(
    dispatcher: &Arc<Dispatcher>,
    constructors: &Arc<dyn ConstructorRegistry>,
    thread: LogicalThreadId,
    callable: &CallableDescriptor,
    payload: &mut BytesMut,
) -> Result<Vec<Value>, EngineError> {
    let arg_count = read_u32(payload)? as usize;
    let mut args = Vec::with_capacity(arg_count);
    for position in 0..arg_count {
        let declared_type = callable.arg_types.get(position).copied().unwrap_or(TypeId::VOID);
        args.push(read_call_arg(dispatcher, constructors, thread, declared_type, payload)?);
    }
    Ok(args)
}

fn read_call_arg(
    dispatcher: &Arc<Dispatcher>,
    constructors: &Arc<dyn ConstructorRegistry>,
    thread: LogicalThreadId,
    declared_type: TypeId,
    payload: &mut BytesMut,
) -> Result<Value, EngineError> {
    let encoding = marshal::ArgEncoding::from_wire_byte(read_u8(payload)?)
        .ok_or_else(|| EngineError::MalformedRequest("unknown argument encoding".to_owned()))?;
    match encoding {
        marshal::ArgEncoding::Reference => Ok(Value::Reference(read_handle(payload)?)),
        marshal::ArgEncoding::Value => {
            let shape = shape_for_type(&dispatcher.registry, declared_type);
            Ok(marshal::read_value(payload, &shape)?)
        }
        marshal::ArgEncoding::SharedMemory => read_shared_memory_arg(payload),
        marshal::ArgEncoding::MethodHandle => read_method_handle_arg(dispatcher, constructors, thread, payload),
        marshal::ArgEncoding::Lambda => read_lambda_arg(dispatcher, constructors, thread, payload),
    }
}

fn read_shared_memory_arg(payload: &mut BytesMut) -> Result<Value, EngineError> {
    let filename = read_string(payload)?;
    let count = read_u32(payload)?;
    let code = PrimitiveCode::from_code(read_u8(payload)?)
        .ok_or_else(|| EngineError::MalformedRequest("unknown shared-memory element code".to_owned()))?;
    let packed = std::fs::read(&filename)
        .map_err(|err| EngineError::MalformedRequest(format!("shared-memory read of {filename:?} failed: {err}")))?;
    let expected = count as usize * code.element_width();
    if packed.len() != expected {
        return Err(EngineError::MalformedRequest(format!(
            "shared-memory file {filename:?} holds {} bytes, expected {expected}",
            packed.len()
        )));
    }
    Ok(Value::PrimitiveArray(marshal::PrimitiveArray { code, packed }))
}

/// Leading tag distinguishing a plain best-effort pickle payload from a
/// construct-call fallback (`spec.md` §4.6 "best-effort pickle").
mod best_effort_tag {
    pub const PLAIN: u8 = 0;
    pub const CONSTRUCT_CALL: u8 = 1;
}

/// Encode `value` as a best-effort pickle: a tag byte, then either the
/// value's ordinary encoding or a construct-call fallback triple
/// (`spec.md` §4.6 "best-effort pickle").
fn write_best_effort_pickle(dispatcher: &Dispatcher, out: &mut BytesMut, value: &Value) {
    match best_effort_pickle_fallback(dispatcher, value) {
        Some(fallback) => {
            out.put_u8(best_effort_tag::CONSTRUCT_CALL);
            marshal::write_value(out, &fallback);
        }
        None => {
            out.put_u8(best_effort_tag::PLAIN);
            marshal::write_value(out, value);
        }
    }
}

/// A construct-call fallback for a reference result whose runtime type
/// has no direct pickle representation: `[runtime_type_name, handle]`,
/// letting the client reconstruct the object itself rather than the
/// whole pickle failing (`spec.md` §4.6 "best-effort pickle"). `None`
/// when `value` is not a live, non-inlinable reference, in which case
/// the plain encoding already represents it.
fn best_effort_pickle_fallback(dispatcher: &Dispatcher, value: &Value) -> Option<Value> {
    let Value::Reference(handle) = value else {
        return None;
    };
    if handle.is_null() || inline_candidate(dispatcher, *handle).is_some() {
        return None;
    }
    let object = dispatcher.handles.lookup(*handle)?;
    Some(Value::List(vec![
        Value::Str(object.runtime_type_name().to_owned()),
        Value::Long(i64::try_from(handle.0).unwrap_or(i64::MAX)),
    ]))
}

fn encode_call_result(
    dispatcher: &Dispatcher,
    format: ReturnFormat,
    value: &Value,
    reported_type: TypeId,
    out: &mut BytesMut,
) -> Result<(), EngineError> {
    match format {
        ReturnFormat::ByReference => match value {
            Value::Reference(handle) => write_object_reference(dispatcher, out, reported_type, *handle),
            other => {
                out.put_u32(reported_type.0);
                marshal::write_value(out, other);
            }
        },
        ReturnFormat::ByClientReference => {
            let Value::ClientObject(id) = value else {
                return Err(EngineError::MalformedRequest(
                    "by-client-reference format requires a client-owned result".to_owned(),
                ));
            };
            out.put_u32(reported_type.0);
            out.put_i32(*id);
        }
        ReturnFormat::ByPickle | ReturnFormat::ByCompressedPickle => {
            out.put_u32(reported_type.0);
            marshal::write_value(out, value);
        }
        ReturnFormat::ByBestEffortPickle | ReturnFormat::ByCompressedBestEffortPickle => {
            out.put_u32(reported_type.0);
            write_best_effort_pickle(dispatcher, out, value);
        }
        ReturnFormat::BySharedMemory => {
            if !dispatcher.config.shared_memory_enabled {
                return Err(EngineError::AccessDenied("shared-memory channel is not enabled".to_owned()));
            }
            let Value::PrimitiveArray(array) = value else {
                return Err(EngineError::MalformedRequest(
                    "by-shared-memory format requires a primitive array result".to_owned(),
                ));
            };
            write_shared_memory_result(out, reported_type, array)?;
        }
    }
    Ok(())
}

fn write_shared_memory_result(out: &mut BytesMut, reported_type: TypeId, array: &marshal::PrimitiveArray) -> Result<(), EngineError> {
    let filename = std::env::temp_dir().join(format!("pjrmi-{}-{:x}", std::process::id(), reported_type.0));
    std::fs::write(&filename, &array.packed)
        .map_err(|err| EngineError::MalformedRequest(format!("shared-memory write failed: {err}")))?;
    let filename = filename.to_string_lossy().into_owned();
    out.put_u32(reported_type.0);
    marshal::write_value(out, &Value::Str(filename));
    out.put_u32(u32::try_from(array.len()).unwrap_or(u32::MAX));
    out.put_u8(array.code.code());
    Ok(())
}

fn encode_callable(dst: &mut BytesMut, callable: &CallableDescriptor) {
    dst.put_u32(callable.index);
    marshal::write_value(dst, &Value::Str(callable.name.clone()));
    let mut flags = 0_u8;
    if callable.flags.is_static {
        flags |= 1 << 0;
    }
    if callable.flags.is_deprecated {
        flags |= 1 << 1;
    }
    if callable.flags.is_default {
        flags |= 1 << 2;
    }
    if callable.flags.has_explicit_binding {
        flags |= 1 << 3;
    }
    if callable.flags.has_keyword_args {
        flags |= 1 << 4;
    }
    dst.put_u8(flags);
    dst.put_u32(callable.return_type.0);
    dst.put_u8(u8::from(callable.generic_return));
    dst.put_u32(u32::try_from(callable.arg_types.len()).unwrap_or(u32::MAX));
    for arg_type in &callable.arg_types {
        dst.put_u32(arg_type.0);
    }
    dst.put_u32(u32::try_from(callable.arg_names.len()).unwrap_or(u32::MAX));
    for name in &callable.arg_names {
        marshal::write_value(dst, &Value::Str(name.clone()));
    }
    match &callable.keyword_args {
        Some(names) => {
            dst.put_u8(1);
            dst.put_u32(u32::try_from(names.len()).unwrap_or(u32::MAX));
            for name in names {
                marshal::write_value(dst, &Value::Str(name.clone()));
            }
        }
        None => dst.put_u8(0),
    }
}

fn encode_specificity(dst: &mut BytesMut, matrix: &SpecificityMatrix) {
    let n = matrix.len();
    dst.put_u32(u32::try_from(n).unwrap_or(u32::MAX));
    for a in 0..n {
        for b in 0..n {
            dst.put_i8(matrix.get(a, b).unwrap_or(0));
        }
    }
}

/// Encode a [`TypeDescriptor`] for a `TYPE_REQUEST` reply (`spec.md` §3,
/// §4.6): ID, name, flags, supertypes, array element type, fields,
/// constructors, methods, and the two specificity matrices, in that
/// order.
fn encode_type_descriptor(dst: &mut BytesMut, descriptor: &TypeDescriptor) {
    dst.put_u32(descriptor.id.0);
    marshal::write_value(dst, &Value::Str(descriptor.name.clone()));
    dst.put_u8(descriptor.flags.bits());
    dst.put_u32(u32::try_from(descriptor.supertypes.len()).unwrap_or(u32::MAX));
    for supertype in &descriptor.supertypes {
        dst.put_u32(supertype.0);
    }
    match descriptor.element_type {
        Some(element_type) => {
            dst.put_u8(1);
            dst.put_u32(element_type.0);
        }
        None => dst.put_u8(0),
    }
    dst.put_u32(u32::try_from(descriptor.fields.len()).unwrap_or(u32::MAX));
    for field in &descriptor.fields {
        marshal::write_value(dst, &Value::Str(field.name.clone()));
        dst.put_u32(field.declared_type.0);
        dst.put_u8(u8::from(field.is_static));
    }
    dst.put_u32(u32::try_from(descriptor.constructors.len()).unwrap_or(u32::MAX));
    for constructor in &descriptor.constructors {
        encode_callable(dst, constructor);
    }
    dst.put_u32(u32::try_from(descriptor.methods.len()).unwrap_or(u32::MAX));
    for method in &descriptor.methods {
        encode_callable(dst, method);
    }
    encode_specificity(dst, &descriptor.constructor_specificity);
    encode_specificity(dst, &descriptor.method_specificity);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::{BufMut, BytesMut};

    use super::{
        ConnectionHooks, Engine, HEADER_LEN, field_type_at, primitive_code_for_name, read_call_arg, read_u32,
        shape_for_type,
    };
    use crate::{
        callback::CallbackEngine,
        config::EngineConfig,
        dispatcher::{ArrayFactory, ConstructorRegistry, Constructible, Dispatcher, Invokable, InstanceLookup},
        ids::{ClientThreadId, LogicalThreadId, TypeId},
        locks::LockManager,
        marshal::{PrimitiveCode, Value},
        registry::{DescribeType, SpecificityMatrix, TypeDescriptor, TypeFlags, TypeRegistry},
    };

    struct NoLookup;
    impl InstanceLookup for NoLookup {
        fn lookup(&self, _name: &str) -> Option<Arc<dyn Invokable>> { None }
    }

    struct NoArrays;
    impl ArrayFactory for NoArrays {
        fn new_array(&self, element_type: TypeId, _length: u32) -> Result<Arc<dyn Invokable>, crate::error::EngineError> {
            Err(crate::error::EngineError::MalformedRequest(format!("no array support for {element_type}")))
        }
    }

    struct NoConstructors;
    impl ConstructorRegistry for NoConstructors {
        fn constructible(&self, _type_id: TypeId) -> Option<Arc<dyn Constructible>> { None }
    }

    struct NoHooks;
    impl ConnectionHooks for NoHooks {
        fn instance_lookup(&self) -> Arc<dyn InstanceLookup> { Arc::new(NoLookup) }
        fn array_factory(&self) -> Arc<dyn ArrayFactory> { Arc::new(NoArrays) }
        fn class_injector(&self) -> Option<Arc<dyn crate::dispatcher::ClassInjector>> { None }
        fn constructor_registry(&self) -> Arc<dyn ConstructorRegistry> { Arc::new(NoConstructors) }
    }

    fn make_dispatcher(registry: Arc<TypeRegistry>) -> Dispatcher {
        let (outbound, _rx) = tokio::sync::mpsc::unbounded_channel();
        Dispatcher::new(
            registry,
            Arc::new(LockManager::new(true)),
            EngineConfig::default(),
            Arc::new(NoLookup),
            Arc::new(CallbackEngine::new(outbound)),
            Arc::new(NoArrays),
            None,
        )
    }

    #[test]
    fn header_len_matches_frame_module() {
        assert_eq!(HEADER_LEN, 17);
    }

    #[test]
    fn engine_hooks_are_object_safe_and_constructible() {
        let engine = Engine {
            registry: Arc::new(TypeRegistry::new(|_| true)),
            locks: Arc::new(LockManager::new(true)),
            config: EngineConfig::default(),
            hooks: Arc::new(NoHooks),
        };
        assert!(engine.hooks.class_injector().is_none());
    }

    #[test]
    fn primitive_names_map_to_their_codes() {
        assert_eq!(primitive_code_for_name("int"), Some(PrimitiveCode::Int));
        assert_eq!(primitive_code_for_name("double"), Some(PrimitiveCode::Double));
        assert_eq!(primitive_code_for_name("java.lang.Object"), None);
    }

    #[test]
    fn shape_for_unknown_type_falls_back_to_reference() {
        let registry = TypeRegistry::new(|_| true);
        let shape = shape_for_type(&registry, TypeId(999));
        assert!(matches!(shape, crate::marshal::ValueShape::Reference));
    }

    #[test]
    fn field_type_for_array_uses_element_type() {
        let descriptor = TypeDescriptor {
            id: TypeId(5),
            name: "int[]".to_owned(),
            flags: TypeFlags::ARRAY,
            supertypes: Vec::new(),
            element_type: Some(TypeId(1)),
            fields: Vec::new(),
            constructors: Vec::new(),
            methods: Vec::new(),
            constructor_specificity: SpecificityMatrix::default(),
            method_specificity: SpecificityMatrix::default(),
        };
        assert_eq!(field_type_at(&descriptor, 3), TypeId(1));
    }

    #[test]
    fn reading_an_unknown_arg_encoding_byte_is_malformed() {
        let registry = Arc::new(TypeRegistry::new(|_| true));
        let dispatcher = Arc::new(make_dispatcher(Arc::clone(&registry)));
        let constructors: Arc<dyn ConstructorRegistry> = Arc::new(NoConstructors);
        let thread = LogicalThreadId::new(1, ClientThreadId(1));
        let mut payload = BytesMut::new();
        payload.put_u8(200);
        let err = read_call_arg(&dispatcher, &constructors, thread, TypeId::VOID, &mut payload).unwrap_err();
        assert!(matches!(err, crate::error::EngineError::MalformedRequest(_)));
    }

    #[test]
    fn reading_a_reference_arg_decodes_the_handle() {
        let registry = Arc::new(TypeRegistry::new(|_| true));
        let dispatcher = Arc::new(make_dispatcher(Arc::clone(&registry)));
        let constructors: Arc<dyn ConstructorRegistry> = Arc::new(NoConstructors);
        let thread = LogicalThreadId::new(1, ClientThreadId(1));
        let mut payload = BytesMut::new();
        payload.put_u8(crate::marshal::ArgEncoding::Reference.wire_byte());
        payload.put_u64(42);
        let value = read_call_arg(&dispatcher, &constructors, thread, TypeId::VOID, &mut payload).expect("decodes");
        assert_eq!(value, Value::Reference(crate::ids::Handle(42)));
    }

    #[test]
    fn read_u32_on_a_short_buffer_is_an_error() {
        let mut payload = BytesMut::new();
        payload.put_u8(1);
        assert!(read_u32(&mut payload).is_err());
    }

    #[test]
    fn type_request_registers_a_runnable_type_for_lookup() {
        struct AlwaysRunnable;
        impl DescribeType for AlwaysRunnable {
            fn describe(&self, id: TypeId, _supertypes: &[TypeDescriptor]) -> TypeDescriptor {
                TypeDescriptor {
                    id,
                    name: "java.lang.Runnable".to_owned(),
                    flags: TypeFlags::INTERFACE | TypeFlags::FUNCTIONAL_INTERFACE,
                    supertypes: Vec::new(),
                    element_type: None,
                    fields: Vec::new(),
                    constructors: Vec::new(),
                    methods: Vec::new(),
                    constructor_specificity: SpecificityMatrix::default(),
                    method_specificity: SpecificityMatrix::default(),
                }
            }
        }
        let registry = Arc::new(TypeRegistry::new(|_| true));
        let id = registry.register("java.lang.Runnable", &AlwaysRunnable, &[]);
        let dispatcher = make_dispatcher(Arc::clone(&registry));
        let descriptor = dispatcher.type_request_by_id(id).expect("registered type resolves");
        assert_eq!(descriptor.name, "java.lang.Runnable");
    }
}
