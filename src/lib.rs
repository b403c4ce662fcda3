//! Core library for the `pjrmi` engine: a bidirectional reflective RMI
//! runtime over an ordered byte stream (`spec.md` §1).
//!
//! A host process embeds this crate to let a remote client reflectively
//! look up, call, construct, and hold references to host-side objects, and
//! to let the host call back into client-side callables the client has
//! handed over as proxies. The frame codec, type registry, handle table,
//! overload resolver, lock manager, callback engine, worker pool, and
//! versioned handshake are all implemented here; [`supervisor`] wires them
//! together into a running connection supervisor.

#![cfg_attr(test, expect(clippy::str_to_string, reason = "test code"))]
#![cfg_attr(test, expect(clippy::unwrap_used, reason = "test code can panic"))]
#![cfg_attr(
    test,
    expect(clippy::indexing_slicing, reason = "test code with known bounds")
)]
#![cfg_attr(test, expect(clippy::shadow_reuse, reason = "test code shadowing"))]
#![cfg_attr(
    test,
    expect(clippy::let_underscore_must_use, reason = "test cleanup code")
)]

pub mod callback;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod handles;
pub mod handshake;
pub mod ids;
pub mod locks;
pub mod marshal;
pub mod overload;
pub mod registry;
pub mod supervisor;
pub mod workers;
