//! Callback engine: outbound requests from host code back into the
//! client, callback-slot correlation, and proxy synthesis for
//! client-side callables (`spec.md` §4.7).
//!
//! Each outbound call allocates a monotonically increasing request ID,
//! posts a frame on the connection's shared outbound channel, and awaits
//! a one-shot mailbox keyed by that ID. A `tokio::sync::oneshot` channel
//! plays the role of the original engine's busy-waiting mailbox: the
//! exact backoff policy is left undocumented by `spec.md` §9, and `await`
//! on a oneshot receiver is the idiomatic replacement for a park/unpark
//! loop, matching how the teacher's `server/outbound.rs` correlates
//! outbound requests to client replies by ID.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    },
};

use tokio::sync::{mpsc, oneshot};

use crate::{
    frame::{Frame, MessageKind},
    ids::{ClientThreadId, LogicalThreadId, RequestId, TypeId},
    marshal::Value,
    registry::{CallableDescriptor, TypeDescriptor},
};

/// The outcome of an outbound call: either the client's result value or
/// the client's own exception, wrapped for propagation (`spec.md` §7
/// "client-callback exception").
pub type CallbackOutcome = Result<Value, ClientException>;

/// A client-side exception raised during a callback round-trip, carried
/// back to the caller without interpretation (`spec.md` §1 Non-goals:
/// "masking exceptions from the client's host language").
#[derive(Debug, Clone, thiserror::Error)]
#[error("client callback raised: {message}")]
pub struct ClientException {
    /// Rendered message of the client's exception, as sent on the wire.
    pub message: String,
}

/// Error from an outbound call that never produced a [`CallbackOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    /// The connection's outbound channel is closed; the transport has
    /// torn down mid-call (`spec.md` §5, §7).
    #[error("client callback failed: connection is closing")]
    ConnectionClosed,
    /// The client's own exception.
    #[error(transparent)]
    Client(#[from] ClientException),
}

struct PendingTable {
    slots: Mutex<HashMap<RequestId, oneshot::Sender<CallbackOutcome>>>,
    next_id: AtomicU32,
}

impl PendingTable {
    fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(0),
        }
    }

    fn allocate(&self) -> (RequestId, oneshot::Receiver<CallbackOutcome>) {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = oneshot::channel();
        self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(id, sender);
        (id, receiver)
    }

    fn resolve(&self, id: RequestId, outcome: CallbackOutcome) {
        if let Some(sender) =
            self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(&id)
        {
            let _ = sender.send(outcome);
        }
    }

    /// Drain every pending slot, failing each with connection closure
    /// (`spec.md` §5: "callback waits observe transport close").
    fn cancel_all(&self) {
        let drained: Vec<_> =
            std::mem::take(&mut *self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner))
                .into_values()
                .collect();
        for sender in drained {
            let _ = sender.send(Err(ClientException {
                message: "connection closed while awaiting callback".to_owned(),
            }));
        }
    }
}

/// Issues outbound requests to the client and correlates their replies
/// (`spec.md` §4.7). One instance per connection, shared with every
/// [`crate::callback::CallbackProxy`] it synthesises.
pub struct CallbackEngine {
    outbound: mpsc::UnboundedSender<Frame>,
    pending: PendingTable,
}

impl std::fmt::Debug for CallbackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackEngine").finish_non_exhaustive()
    }
}

impl CallbackEngine {
    /// Construct a callback engine posting frames onto `outbound`, the
    /// same channel the connection's writer task drains to serialise
    /// sends per connection (`spec.md` §4.1, §5).
    #[must_use]
    pub fn new(outbound: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            outbound,
            pending: PendingTable::new(),
        }
    }

    /// Issue one outbound call of the given `kind` with `payload`,
    /// tagged with `thread`'s client-thread-id so that lock ownership on
    /// the client is consistent across the round-trip (`spec.md` §4.7).
    ///
    /// # Errors
    /// Returns [`CallbackError::ConnectionClosed`] if the outbound
    /// channel has no receiver, or [`CallbackError::Client`] if the
    /// client's call itself raised an exception.
    pub async fn call(
        &self,
        kind: MessageKind,
        thread: LogicalThreadId,
        payload: Vec<u8>,
    ) -> Result<Value, CallbackError> {
        let (request_id, receiver) = self.pending.allocate();
        let frame = Frame::new(kind, thread.client_thread, request_id, payload);
        self.outbound.send(frame).map_err(|_| CallbackError::ConnectionClosed)?;
        match receiver.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(exception)) => Err(CallbackError::Client(exception)),
            Err(_) => Err(CallbackError::ConnectionClosed),
        }
    }

    /// Route an incoming [`MessageKind::CallbackResponse`] frame's result
    /// or exception to the waiting slot (`spec.md` §4.6 "callback
    /// response").
    pub fn resolve(&self, request_id: RequestId, outcome: CallbackOutcome) {
        self.pending.resolve(request_id, outcome);
    }

    /// Fail every still-pending call because the transport has closed
    /// (`spec.md` §5).
    pub fn cancel_all(&self) { self.pending.cancel_all(); }
}

/// The well-known single-method interfaces the engine synthesises a
/// direct proxy implementation for, without needing to inspect a full
/// [`TypeDescriptor`] (`spec.md` §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WellKnownInterface {
    /// Nullary runnable: takes no arguments, returns nothing.
    Runnable,
    /// Unary function: one argument, one return value.
    UnaryFunction,
    /// Binary function: two arguments, one return value.
    BinaryFunction,
    /// Unary consumer: one argument, no return value.
    UnaryConsumer,
    /// Binary consumer: two arguments, no return value.
    BinaryConsumer,
    /// Unary predicate: one argument, boolean return value.
    UnaryPredicate,
    /// Binary predicate: two arguments, boolean return value.
    BinaryPredicate,
    /// Unary operator: one argument, same-typed return value.
    UnaryOperator,
    /// A function accepting keyword arguments.
    KeywordFunction,
}

impl WellKnownInterface {
    /// Argument arity this interface's single method expects.
    #[must_use]
    pub const fn arity(self) -> u32 {
        match self {
            Self::Runnable => 0,
            Self::UnaryFunction | Self::UnaryConsumer | Self::UnaryPredicate | Self::UnaryOperator => 1,
            Self::BinaryFunction | Self::BinaryConsumer | Self::BinaryPredicate => 2,
            Self::KeywordFunction => 0,
        }
    }

    /// Recognise a well-known interface by its canonical type name.
    #[must_use]
    pub fn from_type_name(name: &str) -> Option<Self> {
        Some(match name {
            "java.lang.Runnable" => Self::Runnable,
            "java.util.function.Function" => Self::UnaryFunction,
            "java.util.function.BiFunction" => Self::BinaryFunction,
            "java.util.function.Consumer" => Self::UnaryConsumer,
            "java.util.function.BiConsumer" => Self::BinaryConsumer,
            "java.util.function.Predicate" => Self::UnaryPredicate,
            "java.util.function.BiPredicate" => Self::BinaryPredicate,
            "java.util.function.UnaryOperator" => Self::UnaryOperator,
            "org.pjrmi.KeywordFunction" => Self::KeywordFunction,
            _ => return None,
        })
    }
}

/// Given a non-well-known interface's methods, find the single eligible
/// abstract method to route a dynamic proxy through (`spec.md` §4.7):
/// filters out static/default methods and any method matching a
/// root-object signature (by name and arity, since this crate has no
/// single universal root type), then requires exactly one survivor whose
/// arity matches `arg_count`.
#[must_use]
pub fn find_single_abstract_method(
    descriptor: &TypeDescriptor,
    arg_count: u32,
    is_root_method: impl Fn(&str, usize) -> bool,
) -> Option<&CallableDescriptor> {
    let mut candidates = descriptor.methods.iter().filter(|m| {
        !m.flags.is_default
            && !m.flags.is_static
            && !is_root_method(&m.name, m.arg_types.len())
            && m.arg_types.len() as u32 == arg_count
    });
    let only = candidates.next()?;
    if candidates.next().is_some() {
        return None;
    }
    Some(only)
}

/// A host-side proxy implementing a functional interface by routing its
/// single method to a client-side function (`spec.md` §4.7).
///
/// Construction and drop mirror the client object's reference lifetime:
/// an external caller is expected to send an add-reference when building
/// one of these and a drop-reference when it is discarded, since Rust
/// destructors running during unwind must not perform fallible I/O
/// (`spec.md` §9 "ref-counted handle table across finalisation").
#[derive(Debug, Clone, Copy)]
pub struct CallbackProxyHandle {
    /// Client-assigned function ID this proxy dispatches to.
    pub function_id: i32,
    /// The functional interface type this proxy was synthesised for, if
    /// the client specified one.
    pub target_interface: Option<TypeId>,
    /// Expected argument count.
    pub arg_count: u32,
}

/// Proxy over a client-owned object, dispatching by method name
/// (`spec.md` §4.7). Equality short-circuits by comparing client object
/// IDs rather than round-tripping; an unhandled default method falls
/// back to a caller-supplied default implementation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientObjectProxy {
    /// Client-assigned object ID this proxy wraps.
    pub client_object_id: i32,
}

impl ClientObjectProxy {
    /// Short-circuit equality against another proxy by comparing client
    /// object IDs, without a round trip (`spec.md` §4.7).
    #[must_use]
    pub const fn equals(&self, other: &Self) -> bool { self.client_object_id == other.client_object_id }
}
