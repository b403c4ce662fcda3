//! Small newtype identifiers shared across the engine.
//!
//! Keeping these as distinct types (rather than bare `u32`/`u64`/`i64`)
//! stops a type ID from being passed where a handle or request ID is
//! expected, which is exactly the kind of mixup that is easy to make once
//! several of these values are threaded through the dispatcher.

use std::fmt;

/// Dense non-negative integer identifying a type in the [`TypeRegistry`].
///
/// `0` is reserved for the void type.
///
/// [`TypeRegistry`]: crate::registry::TypeRegistry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct TypeId(pub u32);

impl TypeId {
    /// The reserved void type ID.
    pub const VOID: Self = Self(0);

    /// Returns `true` if this is the reserved void type ID.
    #[must_use]
    pub const fn is_void(self) -> bool { self.0 == 0 }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "#{}", self.0) }
}

/// Opaque 64-bit handle naming a live host object across the wire.
///
/// `0` denotes the null reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Handle(pub u64);

impl Handle {
    /// The reserved null handle.
    pub const NULL: Self = Self(0);

    /// Returns `true` if this handle denotes the null reference.
    #[must_use]
    pub const fn is_null(self) -> bool { self.0 == 0 }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "h{}", self.0) }
}

/// Client-assigned identifier for an in-flight request, used to correlate a
/// response with its request on both the client->server and server->client
/// directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u32);

/// Client-side logical thread identifier, as carried verbatim on every
/// frame the client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientThreadId(pub u64);

/// Identity token representing a client-side thread's continuation on the
/// server: a `(connection, client-thread-id)` pair.
///
/// Lock ownership is keyed by this token, never by OS thread, so that N
/// client threads multiplexed over a worker pool share lock ownership
/// correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogicalThreadId {
    /// Identifies the owning connection.
    pub connection: u64,
    /// The client's own thread identifier on that connection.
    pub client_thread: ClientThreadId,
}

impl LogicalThreadId {
    /// Construct a new logical thread identity.
    #[must_use]
    pub const fn new(connection: u64, client_thread: ClientThreadId) -> Self {
        Self {
            connection,
            client_thread,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn void_type_id_is_zero() {
        assert!(TypeId::VOID.is_void());
        assert!(!TypeId(1).is_void());
    }

    #[test]
    fn null_handle_is_zero() {
        assert!(Handle::NULL.is_null());
        assert!(!Handle(7).is_null());
    }

    #[test]
    fn logical_thread_ids_distinguish_connection_and_client_thread() {
        let a = LogicalThreadId::new(1, ClientThreadId(5));
        let b = LogicalThreadId::new(2, ClientThreadId(5));
        let c = LogicalThreadId::new(1, ClientThreadId(6));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, LogicalThreadId::new(1, ClientThreadId(5)));
    }
}
