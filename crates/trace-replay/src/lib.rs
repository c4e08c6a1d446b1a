//! Client-side driver for the trace replay/mutation streaming protocol.
//!
//! [`drive_session`] opens a `StreamCommands` call against a trace service,
//! runs the handshake, and feeds every replayed command to a user-supplied
//! [`Handler`]. The [`Command`]'s parameters are already bound to a live
//! value graph ([`Value`], [`PointerHandle`], [`StructHandle`],
//! [`ArrayHandle`]) whose pointers lazily resolve against the same stream
//! and track their own dirty state so a handler's writes get flushed back
//! automatically.

mod api;
mod command;
mod error;
mod handler;
mod rt;
mod stream;
mod types;
mod value;

pub use api::ApiScope;
pub use command::{bind, Command, Parameter};
pub use error::ReplayError;
pub use handler::{DispatchContext, Handler, Verdict};
pub use stream::{connect, drive_session, GrpcTransport, SessionConfig, SessionStats, Transport};
pub use types::{GrpcTypeSource, PodKind, SizedKind, Type, TypeKind, TypeManager, TypeResolver, TypeSource};
pub use value::{ArrayHandle, PodScalar, PointerHandle, StructHandle, Value, ValueKind};

pub use trace_proto::v1 as wire;
