//! Error taxonomy for the engine.
//!
//! Each layer gets its own [`thiserror`]-derived enum, mirroring how the
//! teacher separates framing failures (`TransactionError`) from
//! command-level failures (`CommandError`). [`EngineError`] unifies all of
//! them into the shape the dispatcher needs to render an exception frame
//! (`spec.md` §7).

use thiserror::Error;

use crate::ids::{Handle, TypeId};

/// Errors raised by the frame codec while reading or writing a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The header or payload was truncated before the expected length.
    #[error("short read: expected {expected} bytes, connection closed early")]
    ShortRead {
        /// Number of bytes still expected when the stream ended.
        expected: usize,
    },
    /// The first header byte did not match any known message kind.
    #[error("unknown message kind byte 0x{0:02x}")]
    UnknownKind(u8),
    /// The declared payload size exceeds the configured maximum frame size.
    #[error("payload size {size} exceeds maximum frame size {max}")]
    PayloadTooLarge {
        /// Declared payload size in bytes.
        size: u32,
        /// Configured maximum.
        max: u32,
    },
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while marshalling or unmarshalling a value on the wire.
#[derive(Debug, Error)]
pub enum MarshalError {
    /// A numeric value did not fit in the target primitive width.
    #[error("value overflows target type {target_type}")]
    Overflow {
        /// The declared target type.
        target_type: TypeId,
    },
    /// A UTF-16 string payload contained an unpaired surrogate or similar.
    #[error("invalid UTF-16 string payload")]
    InvalidString,
    /// The buffer ended before a fixed-width or length-prefixed value
    /// could be fully read.
    #[error("short payload while decoding a value")]
    ShortPayload,
    /// The wire discriminator byte did not match any known argument encoding.
    #[error("unknown argument encoding discriminator {0}")]
    UnknownEncoding(u8),
    /// A handle referenced by the marshaller is not live.
    #[error("handle {0} does not resolve to a live object")]
    DanglingHandle(Handle),
    /// The shared-memory side channel was used when it is not available.
    #[error("shared-memory transfer requested but not available for this connection")]
    SharedMemoryUnavailable,
    /// Reading or writing the shared-memory region failed.
    #[error("shared-memory I/O error: {0}")]
    SharedMemoryIo(#[from] std::io::Error),
    /// A value could not be converted to the type the declared field or
    /// argument requires.
    #[error("cannot convert value to {target_type}")]
    ConversionFailure {
        /// The declared target type.
        target_type: TypeId,
    },
}

/// Errors raised by the handle table.
#[derive(Debug, Error)]
pub enum HandleError {
    /// `lookup`/`add_ref(handle)`/`drop_ref` was given a handle not present
    /// in the table.
    #[error("unknown handle {0}")]
    Unknown(Handle),
}

/// Errors raised by the type registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No type is registered under the requested ID.
    #[error("unknown type id {0}")]
    UnknownType(TypeId),
    /// No type is registered under the requested canonical name.
    #[error("unknown type name {0:?}")]
    UnknownTypeName(String),
    /// A constructor or method index was out of range for its type.
    #[error("callable index {index} out of range for type {type_id}")]
    BadCallableIndex {
        /// The type the callable was looked up on.
        type_id: TypeId,
        /// The out-of-range index.
        index: u32,
    },
    /// The class-authorisation predicate rejected access to a type.
    #[error("access to type {0:?} denied by authorisation policy")]
    AccessDenied(String),
}

/// Errors raised by the named-lock manager.
#[derive(Debug, Error)]
pub enum LockError {
    /// Acquiring this lock would close a cycle in the waits-for graph.
    #[error("deadlock detected acquiring lock {0:?}")]
    Deadlock(String),
    /// Shared locks were requested; only exclusive locks are supported.
    #[error("shared locks are not supported")]
    SharedUnsupported,
    /// An unlock was attempted by a logical thread that does not hold the
    /// lock.
    #[error("lock {0:?} is not held by the requesting logical thread")]
    NotHeld(String),
}

/// Top-level error type surfaced by the dispatcher, unifying every lower
/// layer's error into the eight wire-visible kinds from `spec.md` §7.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed request: bad kind byte, short payload, unknown type or
    /// callable index.
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    /// Access denied: class not permitted, injection not permitted, or
    /// authentication rejected.
    #[error("access denied: {0}")]
    AccessDenied(String),
    /// Value conversion failure: overflow, precision loss, unhandled target
    /// type.
    #[error("value conversion failed: {0}")]
    ValueConversion(#[from] MarshalError),
    /// Reflection failure: the target call threw; `cause` is the unwrapped
    /// original exception's rendered message.
    #[error("reflection call failed: {cause}")]
    ReflectionFailure {
        /// Rendered message of the unwrapped target exception.
        cause: String,
    },
    /// Deadlock detected in the lock manager.
    #[error("deadlock detected: {0}")]
    Deadlock(#[from] LockError),
    /// The per-connection recursion depth guard was exceeded.
    #[error("recursion depth exceeded (limit {limit})")]
    RecursionDepthExceeded {
        /// The configured limit that was exceeded.
        limit: u32,
    },
    /// A future's timed wait expired before a result arrived.
    #[error("future wait timed out")]
    FutureTimeout,
    /// A callback round-trip to the client raised an exception there.
    #[error("client callback raised an exception: {0}")]
    ClientCallback(String),
    /// Error from the handle table.
    #[error(transparent)]
    Handle(#[from] HandleError),
    /// Error from the type registry.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Error from the frame codec; always connection-fatal.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl EngineError {
    /// Whether this error should terminate the connection rather than be
    /// reported as an exception frame and continue processing.
    ///
    /// Per `spec.md` §7: dispatch errors continue processing; only
    /// connection-level I/O failures and lock-manager failures discovered
    /// while sending a reply are fatal. The frame codec only ever produces
    /// connection-fatal errors.
    #[must_use]
    pub const fn is_connection_fatal(&self) -> bool { matches!(self, Self::Frame(_)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_errors_are_connection_fatal() {
        let err = EngineError::Frame(FrameError::UnknownKind(0xff));
        assert!(err.is_connection_fatal());
    }

    #[test]
    fn dispatch_errors_are_not_connection_fatal() {
        let err = EngineError::MalformedRequest("bad callable index".into());
        assert!(!err.is_connection_fatal());
        let err = EngineError::Deadlock(LockError::Deadlock("A".into()));
        assert!(!err.is_connection_fatal());
    }
}
