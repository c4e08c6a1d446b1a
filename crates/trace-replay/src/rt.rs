//! Shared context threaded through type resolution and value-graph access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::ReplayError;
use crate::stream::Transport;
use crate::types::{Type, TypeResolver};
use crate::value::PointerHandle;
use trace_proto::v1 as wire;

/// Identity of a [`crate::value::PointerHandle`] for the purposes of the
/// per-command dirty set. We use the address of the handle's inner `Arc`
/// rather than minting a separate counter.
pub(crate) type PointerId = usize;

/// Session-scoped state shared by every live value-graph handle: the
/// connection used to satisfy `ResolveObject`/`GetMemory` sub-requests, and
/// the set of pointers written to since the last flush.
#[derive(Clone)]
pub struct Rt {
    pub(crate) resolver: Arc<dyn TypeResolver>,
    pub(crate) transport: Arc<tokio::sync::Mutex<Box<dyn Transport>>>,
    pub(crate) dirty: Arc<Mutex<HashMap<PointerId, PointerHandle>>>,
    /// Every client-minted (`external_init`) pointer, keyed by its fictional
    /// address, so a pointer discovered only as a nested field of another
    /// dirty value can be found again and flushed in its own right.
    pub(crate) fictional: Arc<Mutex<HashMap<u64, PointerHandle>>>,
    pub(crate) alloc: Arc<AtomicU64>,
    pub(crate) sent: Arc<AtomicU64>,
    pub(crate) received: Arc<AtomicU64>,
}

impl Rt {
    pub(crate) fn new(resolver: Arc<dyn TypeResolver>, transport: Box<dyn Transport>) -> Self {
        Rt {
            resolver,
            transport: Arc::new(tokio::sync::Mutex::new(transport)),
            dirty: Arc::new(Mutex::new(HashMap::new())),
            fictional: Arc::new(Mutex::new(HashMap::new())),
            alloc: Arc::new(AtomicU64::new(1)),
            sent: Arc::new(AtomicU64::new(0)),
            received: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Mints a fresh, process-unique fictional address for a client-allocated
    /// (`external_init`) pointer.
    pub(crate) fn alloc_address(&self) -> u64 {
        self.alloc.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_fictional(&self, address: u64, ptr: PointerHandle) {
        self.fictional.lock().unwrap().insert(address, ptr);
    }

    pub(crate) fn lookup_fictional(&self, address: u64) -> Option<PointerHandle> {
        self.fictional.lock().unwrap().get(&address).cloned()
    }

    pub(crate) fn mark_dirty(&self, id: PointerId, ptr: PointerHandle) {
        self.dirty.lock().unwrap().insert(id, ptr);
    }

    pub(crate) fn take_dirty(&self) -> Vec<PointerHandle> {
        std::mem::take(&mut *self.dirty.lock().unwrap()).into_values().collect()
    }

    pub(crate) async fn get_type(&self, id: u64, api: &crate::api::ApiScope) -> Result<Type, ReplayError> {
        self.resolver.get_type(id, api).await
    }

    pub(crate) async fn get_type_by_name(&self, name: &str, api: &crate::api::ApiScope) -> Result<Type, ReplayError> {
        self.resolver.get_type_by_name(name, api).await
    }

    /// Sends a request with no corresponding reply (`PutMemory`, `Pass`,
    /// `Drop`, `StreamStart`).
    pub(crate) async fn send_only(&self, req: wire::StreamCommandsRequest) -> Result<(), ReplayError> {
        let mut transport = self.transport.lock().await;
        transport.send(req).await?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Blocks for the next message off the incoming half, with no send of
    /// its own. Used by the driver's main loop between commands.
    pub(crate) async fn recv_only(&self) -> Result<wire::StreamCommandsResponse, ReplayError> {
        let mut transport = self.transport.lock().await;
        let resp = transport.recv().await?;
        self.received.fetch_add(1, Ordering::Relaxed);
        Ok(resp)
    }

    /// Sends a single `StreamCommandsRequest` sub-request and blocks for its
    /// matching response (`ResolveObject` -> a value, `GetMemory` -> a
    /// snapshot). The protocol guarantees at most one sub-request is
    /// outstanding at a time.
    pub(crate) async fn send_and_recv(
        &self,
        req: wire::StreamCommandsRequest,
    ) -> Result<wire::StreamCommandsResponse, ReplayError> {
        self.send_only(req).await?;
        self.recv_only().await
    }

    pub(crate) fn total_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub(crate) fn total_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}
