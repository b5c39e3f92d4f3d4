//! # hyprtavern-core
//!
//! Wire protocol library for the hyprtavern service bus.
//!
//! This crate is the transport the tavern and its peripherals speak over
//! `AF_UNIX` stream sockets:
//!
//! - **Framing**: length-prefixed binary frames ([`FrameCodec`]), length
//!   validated before allocation.
//! - **Fd passing**: frames that carry a file descriptor attach it as
//!   `SCM_RIGHTS` ancillary data on the same `sendmsg` ([`fd_passing`]).
//! - **Handshake**: `Hello`/`HelloAck` protocol negotiation preceding all
//!   protocol traffic ([`handshake`]).
//! - **Messages**: typed, already-demuxed protocol events for the three
//!   tavern protocols ([`proto`]).
//! - **Connection**: an async duplex wire over a Unix stream
//!   ([`WireConnection`]) delivering typed messages plus their descriptors.
//!
//! Payloads are JSON; the envelope types in [`proto`] are the single source
//! of truth for what travels on the wire.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod error;
pub mod fd_passing;
pub mod framing;
pub mod handshake;
pub mod proto;

pub use connection::{WireConnection, WireReader, WireWriter};
pub use error::{WireError, WireResult};
pub use framing::{FrameCodec, MAX_FRAME_SIZE};
pub use handshake::{Hello, HelloAck};
