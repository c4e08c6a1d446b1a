//! The send/receive half of a live `StreamCommands` call, abstracted so the
//! driver loop can be exercised against an in-memory double in tests.

use tokio::sync::mpsc;
use trace_proto::v1 as wire;

use crate::error::ReplayError;

#[tonic::async_trait]
pub trait Transport: Send {
    async fn send(&mut self, req: wire::StreamCommandsRequest) -> Result<(), ReplayError>;
    async fn recv(&mut self) -> Result<wire::StreamCommandsResponse, ReplayError>;
}

/// [`Transport`] backed by a real `TraceService.StreamCommands` call: an
/// `mpsc` sender feeding the outgoing half and the server's `Streaming`
/// response on the incoming half.
pub struct GrpcTransport {
    outgoing: mpsc::Sender<wire::StreamCommandsRequest>,
    incoming: tonic::Streaming<wire::StreamCommandsResponse>,
}

impl GrpcTransport {
    pub(crate) fn new(
        outgoing: mpsc::Sender<wire::StreamCommandsRequest>,
        incoming: tonic::Streaming<wire::StreamCommandsResponse>,
    ) -> Self {
        GrpcTransport { outgoing, incoming }
    }
}

#[tonic::async_trait]
impl Transport for GrpcTransport {
    async fn send(&mut self, req: wire::StreamCommandsRequest) -> Result<(), ReplayError> {
        self.outgoing.send(req).await.map_err(|_| ReplayError::Protocol("outgoing stream closed".into()))
    }

    async fn recv(&mut self) -> Result<wire::StreamCommandsResponse, ReplayError> {
        self.incoming.message().await?.ok_or(ReplayError::UnexpectedEof)
    }
}
