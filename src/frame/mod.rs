//! Frame-level framing: the fixed 17-byte header plus message-kind table
//! (`spec.md` §4.1, §6).
//!
//! A frame is `message-kind (1B) | client-thread-id (8B, BE) | request-id
//! (4B, BE) | size (4B, BE) | payload (size bytes)`. Higher-level codec
//! glue (the [`Decoder`](tokio_util::codec::Decoder)/[`Encoder`](tokio_util::codec::Encoder)
//! pair) lives in the sibling [`codec`] module, the same split the teacher
//! uses between `transaction/frame.rs` (header layout) and
//! `transaction/reader.rs`/`writer.rs` (stream plumbing).

pub mod codec;

use crate::ids::{ClientThreadId, RequestId};

/// Length of the fixed frame header, in bytes.
pub const HEADER_LEN: usize = 17;

/// Message-kind identifiers, drawn from a closed ASCII set (`spec.md` §6).
/// Uppercase letters are client->server requests; lowercase letters and
/// digits are server->client responses/unsolicited events. These bytes are
/// part of the wire protocol and must never be reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum MessageKind {
    /// Client->server: look up an instance by name.
    InstanceLookup,
    /// Client->server: add a reference to one or more handles.
    AddRef,
    /// Client->server: drop a reference to one or more handles.
    DropRef,
    /// Client->server: request a type descriptor by ID or name.
    TypeRequest,
    /// Client->server: invoke a constructor or method.
    MethodCall,
    /// Client->server: render an object's `toString()`.
    ToString,
    /// Client->server: read a field.
    GetField,
    /// Client->server: write a field.
    SetField,
    /// Client->server: read an array's length.
    ArrayLength,
    /// Client->server: allocate a new array instance.
    NewArray,
    /// Client->server: cast a handle to a requested type.
    Cast,
    /// Client->server: acquire a named lock.
    Lock,
    /// Client->server: release a named lock.
    Unlock,
    /// Client->server: inject a precompiled class.
    InjectClass,
    /// Client->server: inject source to be compiled into a class.
    InjectSource,
    /// Client->server: serialise an object's value.
    GetValueOf,
    /// Client->server: synthesise a callback proxy for a client function.
    GetCallbackHandle,
    /// Client->server: deliver the result or exception of an outbound call.
    CallbackResponse,
    /// Client->server: wrap a client object ID behind a host-side proxy.
    GetProxy,
    /// Server->client: a value-plane or control-plane response.
    Response,
    /// Server->client: an exception frame.
    Exception,
    /// Server->client: evaluate/execute a snippet on the client.
    Evaluate,
    /// Server->client: invoke a client-side callable.
    Invoke,
    /// Server->client: invoke a method on a client object.
    ObjectCallback,
    /// Server->client: read a client-side attribute.
    GetAttribute,
    /// Server->client: set a client-side global variable.
    SetGlobal,
    /// Server->client: adapt a callback into a client-side callable.
    CallbackToCallable,
    /// Server->client: drop references held on client objects.
    DropRefs,
    /// Server->client: fetch a client object's value.
    GetObject,
    /// Server->client: invoke and fetch the resulting client object.
    InvokeAndGetObject,
}

impl MessageKind {
    /// The single-byte wire identifier for this message kind.
    #[must_use]
    pub const fn wire_byte(self) -> u8 {
        match self {
            Self::InstanceLookup => b'L',
            Self::AddRef => b'A',
            Self::DropRef => b'D',
            Self::TypeRequest => b'T',
            Self::MethodCall => b'M',
            Self::ToString => b'S',
            Self::GetField => b'G',
            Self::SetField => b'F',
            Self::ArrayLength => b'N',
            Self::NewArray => b'W',
            Self::Cast => b'C',
            Self::Lock => b'K',
            Self::Unlock => b'U',
            Self::InjectClass => b'J',
            Self::InjectSource => b'X',
            Self::GetValueOf => b'V',
            Self::GetCallbackHandle => b'H',
            Self::CallbackResponse => b'R',
            Self::GetProxy => b'P',
            Self::Response => b'r',
            Self::Exception => b'e',
            Self::Evaluate => b'v',
            Self::Invoke => b'i',
            Self::ObjectCallback => b'o',
            Self::GetAttribute => b'g',
            Self::SetGlobal => b's',
            Self::CallbackToCallable => b'c',
            Self::DropRefs => b'd',
            Self::GetObject => b'1',
            Self::InvokeAndGetObject => b'2',
        }
    }

    /// Parse a wire byte back into a [`MessageKind`].
    #[must_use]
    pub const fn from_wire_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            b'L' => Self::InstanceLookup,
            b'A' => Self::AddRef,
            b'D' => Self::DropRef,
            b'T' => Self::TypeRequest,
            b'M' => Self::MethodCall,
            b'S' => Self::ToString,
            b'G' => Self::GetField,
            b'F' => Self::SetField,
            b'N' => Self::ArrayLength,
            b'W' => Self::NewArray,
            b'C' => Self::Cast,
            b'K' => Self::Lock,
            b'U' => Self::Unlock,
            b'J' => Self::InjectClass,
            b'X' => Self::InjectSource,
            b'V' => Self::GetValueOf,
            b'H' => Self::GetCallbackHandle,
            b'R' => Self::CallbackResponse,
            b'P' => Self::GetProxy,
            b'r' => Self::Response,
            b'e' => Self::Exception,
            b'v' => Self::Evaluate,
            b'i' => Self::Invoke,
            b'o' => Self::ObjectCallback,
            b'g' => Self::GetAttribute,
            b's' => Self::SetGlobal,
            b'c' => Self::CallbackToCallable,
            b'd' => Self::DropRefs,
            b'1' => Self::GetObject,
            b'2' => Self::InvokeAndGetObject,
            _ => return None,
        })
    }

    /// Whether the dispatcher must hold the connection's global lock while
    /// handling this message kind. Value-plane messages (method call, field
    /// get/set, `toString`, value-of) do; control-plane messages
    /// (lock/unlock, ref add/drop, type/instance lookup) do not
    /// (`spec.md` §4.1).
    #[must_use]
    pub const fn requires_global_lock(self) -> bool {
        matches!(
            self,
            Self::MethodCall
                | Self::GetField
                | Self::SetField
                | Self::ToString
                | Self::GetValueOf
                | Self::ArrayLength
                | Self::NewArray
        )
    }
}

/// A single parsed frame: header fields plus the raw payload.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The message kind carried by this frame.
    pub kind: MessageKind,
    /// The client-side logical thread ID this frame belongs to.
    pub client_thread_id: ClientThreadId,
    /// Request ID used to correlate a reply with its request.
    pub request_id: RequestId,
    /// The frame's raw payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Construct a new frame with the given fields.
    #[must_use]
    pub const fn new(
        kind: MessageKind,
        client_thread_id: ClientThreadId,
        request_id: RequestId,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            client_thread_id,
            request_id,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(MessageKind::InstanceLookup, b'L')]
    #[case(MessageKind::MethodCall, b'M')]
    #[case(MessageKind::Exception, b'e')]
    #[case(MessageKind::InvokeAndGetObject, b'2')]
    fn wire_byte_round_trips(#[case] kind: MessageKind, #[case] byte: u8) {
        assert_eq!(kind.wire_byte(), byte);
        assert_eq!(MessageKind::from_wire_byte(byte), Some(kind));
    }

    #[test]
    fn unknown_byte_does_not_parse() {
        assert_eq!(MessageKind::from_wire_byte(0x00), None);
    }

    #[test]
    fn value_plane_kinds_require_global_lock() {
        assert!(MessageKind::MethodCall.requires_global_lock());
        assert!(MessageKind::GetField.requires_global_lock());
        assert!(MessageKind::ToString.requires_global_lock());
    }

    #[test]
    fn control_plane_kinds_do_not_require_global_lock() {
        assert!(!MessageKind::Lock.requires_global_lock());
        assert!(!MessageKind::AddRef.requires_global_lock());
        assert!(!MessageKind::TypeRequest.requires_global_lock());
        assert!(!MessageKind::InstanceLookup.requires_global_lock());
    }
}
