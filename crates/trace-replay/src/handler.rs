//! The trait user code implements to react to replayed commands, plus the
//! context object it's given to read memory and allocate fresh buffers.

use trace_proto::v1::{self as wire, stream_commands_request, stream_commands_response};

use crate::api::ApiScope;
use crate::command::Command;
use crate::error::ReplayError;
use crate::rt::Rt;
use crate::types::Type;
use crate::value::PointerHandle;

/// What a handler wants done with the command it just inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Forward the command to the trace service unmodified.
    Pass,
    /// Drop the command: the trace service never sees it.
    Drop,
}

/// Per-command capabilities a [`Handler`] gets beyond the command itself:
/// reading the replay target's memory snapshot and allocating client-side
/// buffers (`Make<T>(n)`).
pub struct DispatchContext {
    pub(crate) rt: Rt,
}

impl DispatchContext {
    pub(crate) fn new(rt: Rt) -> Self {
        DispatchContext { rt }
    }

    pub async fn resolve_type(&self, id: u64, api: &ApiScope) -> Result<Type, ReplayError> {
        self.rt.get_type(id, api).await
    }

    pub async fn resolve_type_by_name(&self, name: &str, api: &ApiScope) -> Result<Type, ReplayError> {
        self.rt.get_type_by_name(name, api).await
    }

    /// Allocates a fresh, client-owned pointer to `n` contiguous `ty`
    /// elements, pre-filled with `ty`'s default value.
    pub async fn make(&self, ty: Type, n: u64) -> Result<PointerHandle, ReplayError> {
        let ptr = PointerHandle::fictional(ty, self.rt.clone());
        ptr.prefill(n).await?;
        Ok(ptr)
    }

    /// Pulls a full memory snapshot of the replay target.
    pub async fn get_memory(&self) -> Result<Vec<u8>, ReplayError> {
        let req = wire::StreamCommandsRequest {
            kind: Some(stream_commands_request::Kind::GetMemory(wire::GetMemory {})),
        };
        let resp = self.rt.send_and_recv(req).await?;
        match resp.kind {
            Some(stream_commands_response::Kind::Memory(snapshot)) => Ok(snapshot.data),
            other => Err(ReplayError::Protocol(format!("expected memory snapshot, got {other:?}"))),
        }
    }
}

/// User-supplied logic for a replay session. One instance lives for the
/// whole session; `dispatch` is called once per command in stream order.
#[tonic::async_trait]
pub trait Handler: Send {
    async fn dispatch(&mut self, ctx: &mut DispatchContext, cmd: &Command) -> Result<Verdict, ReplayError>;

    /// Fires once, after the trace service has finished replaying any
    /// commands it chose to run before handing control to the client
    /// (`StreamStart.include_initial_commands`). The default is a no-op.
    async fn initial_commands_done(&mut self, _ctx: &mut DispatchContext) -> Result<(), ReplayError> {
        Ok(())
    }
}
