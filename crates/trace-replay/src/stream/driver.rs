//! Drives one `StreamCommands` session: sends the handshake, then loops
//! binding commands, dispatching them to a [`Handler`], and flushing any
//! dirty pointers before telling the trace service to pass or drop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use trace_proto::v1::{self as wire, stream_commands_request, trace_service_client::TraceServiceClient};
use tracing::{debug, info, instrument, trace, warn};

use crate::api::ApiScope;
use crate::command;
use crate::error::ReplayError;
use crate::handler::{DispatchContext, Handler, Verdict};
use crate::rt::Rt;
use crate::stream::transport::GrpcTransport;
use crate::types::{GrpcTypeSource, TypeManager, TypeResolver};

/// Knobs for the handshake the driver sends as the first `StreamCommands`
/// message.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Serialized capture to replay, as returned by `LoadCapture`.
    pub capture: Vec<u8>,
    /// Restricts replay to these command names; empty means all commands.
    pub command_names: Vec<String>,
    /// Tells the trace service what verdict to assume for any command this
    /// session never issues a `Pass`/`Drop` for itself.
    pub pass_default: bool,
    pub include_initial_commands: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub commands_processed: u64,
    pub total_sent: u64,
    pub total_received: u64,
}

/// Dials `addr` (e.g. `http://127.0.0.1:9008`) and returns a client ready to
/// pass to [`drive_session`].
pub async fn connect(addr: impl Into<String>) -> Result<TraceServiceClient<Channel>, ReplayError> {
    let addr = addr.into();
    trace!(%addr, "dialling trace service");
    let channel = Channel::from_shared(addr)
        .map_err(|e| ReplayError::Protocol(format!("bad trace service address: {e}")))?
        .connect_timeout(Duration::from_secs(20))
        .connect()
        .await
        .map_err(ReplayError::Connect)?;
    Ok(TraceServiceClient::new(channel))
}

/// Runs the handshake against an already-connected `client`, then drives
/// `handler` until the trace service sends `Done` or the stream ends.
#[instrument(skip(client, handler), fields(capture_len = config.capture.len()))]
pub async fn drive_session<H: Handler>(
    client: TraceServiceClient<Channel>,
    config: SessionConfig,
    handler: H,
) -> Result<SessionStats, ReplayError> {
    let resolver: Arc<dyn TypeResolver> = Arc::new(TypeManager::new(GrpcTypeSource::new(client.clone())));

    let (tx, rx) = mpsc::channel(1);
    let mut stream_client = client;
    let call = tokio::spawn(async move { stream_client.stream_commands(ReceiverStream::new(rx)).await });

    let start = wire::StreamCommandsRequest {
        kind: Some(stream_commands_request::Kind::Start(wire::StreamStart {
            capture: config.capture.clone(),
            command_names: config.command_names.clone(),
            pass_default: config.pass_default,
            include_initial_commands: config.include_initial_commands,
        })),
    };
    tx.send(start).await.map_err(|_| ReplayError::Protocol("stream task ended before handshake was sent".into()))?;

    let response = call
        .await
        .map_err(|e| ReplayError::Protocol(format!("stream task panicked: {e}")))??;
    let incoming = response.into_inner();

    let rt = Rt::new(resolver, Box::new(GrpcTransport::new(tx, incoming)));
    run(rt, config, handler).await
}

async fn run<H: Handler>(rt: Rt, config: SessionConfig, mut handler: H) -> Result<SessionStats, ReplayError> {
    let mut ctx = DispatchContext::new(rt.clone());
    let mut stats = SessionStats::default();
    let mut seen_initial_commands_done = false;

    loop {
        let resp = rt.recv_only().await?;
        use trace_proto::v1::stream_commands_response::Kind as RespKind;

        match resp.kind {
            Some(RespKind::Done(_)) => {
                info!(commands = stats.commands_processed, "replay session done");
                break;
            }
            Some(RespKind::Error(e)) => return Err(ReplayError::Protocol(e.message)),
            Some(RespKind::InitialCommandsDone(_)) => {
                debug!("initial commands done");
                seen_initial_commands_done = true;
                handler.initial_commands_done(&mut ctx).await?;
            }
            Some(RespKind::Command(wire_cmd)) => {
                let name = wire_cmd.name.clone();
                let cmd = command::bind(wire_cmd, &rt).await?;

                let verdict = if seen_initial_commands_done || config.include_initial_commands {
                    let verdict = handler.dispatch(&mut ctx, &cmd).await?;
                    flush_dirty(&rt, &cmd.api).await?;
                    verdict
                } else {
                    trace!(command = %name, "skipping dispatch for a command before initial_commands_done");
                    Verdict::Pass
                };

                send_verdict(&rt, verdict).await?;
                stats.commands_processed += 1;
                debug!(command = %name, ?verdict, "dispatched command");
            }
            other => {
                warn!(?other, "unexpected message outside a sub-request round trip");
                return Err(ReplayError::Protocol(format!("unexpected top-level message: {other:?}")));
            }
        }
    }

    stats.total_sent = rt.total_sent();
    stats.total_received = rt.total_received();
    Ok(stats)
}

/// Densifies and sends every pointer written to while dispatching the
/// command just finished, then clears the session's dirty set.
///
/// A flushed value can itself carry freshly-made ("fictional") pointers
/// nested inside an already-dirty struct or array field — `Make<T>`'d but
/// never individually marked dirty. After encoding each pointer's slice, the
/// encoded tree is scanned for such pointers and any found are pushed onto
/// the worklist, so the flush reaches a fixed point instead of one static
/// snapshot.
async fn flush_dirty(rt: &Rt, api: &ApiScope) -> Result<(), ReplayError> {
    let mut worklist = rt.take_dirty();
    let mut flushed = std::collections::HashSet::new();
    let mut objects = Vec::new();

    while let Some(ptr) = worklist.pop() {
        if !flushed.insert(ptr.address()) {
            continue;
        }
        let Some(write_object) = ptr.flush().await? else { continue };

        collect_fictional_pointers(&write_object, rt, &flushed, &mut worklist);

        let slice_type_name = format!("{}&", ptr.underlying().name());
        let slice_type = rt.get_type_by_name(&slice_type_name, api).await?;
        objects.push(wire::MemoryObject {
            pointer: Some(wire::PointerValue { address: ptr.address(), fictional: ptr.is_fictional() }),
            r#type: Some(wire::TypeRef { type_index: slice_type.id() }),
            write_object: Some(write_object),
        });
    }

    if !objects.is_empty() {
        let req = wire::StreamCommandsRequest {
            kind: Some(stream_commands_request::Kind::PutMemory(wire::PutMemory { objects })),
        };
        rt.send_only(req).await?;
    }
    Ok(())
}

/// Walks an encoded wire value for nested `PointerValue`s that name a
/// fictional pointer not yet flushed, appending each to `worklist`.
fn collect_fictional_pointers(
    value: &wire::Value,
    rt: &Rt,
    flushed: &std::collections::HashSet<u64>,
    worklist: &mut Vec<crate::value::PointerHandle>,
) {
    match &value.kind {
        Some(wire::value::Kind::Pointer(p)) if p.fictional && !flushed.contains(&p.address) => {
            if let Some(handle) = rt.lookup_fictional(p.address) {
                worklist.push(handle);
            }
        }
        Some(wire::value::Kind::StructValue(s)) => {
            for field in &s.fields {
                collect_fictional_pointers(field, rt, flushed, worklist);
            }
        }
        Some(wire::value::Kind::Array(a)) => {
            for entry in &a.entries {
                collect_fictional_pointers(entry, rt, flushed, worklist);
            }
        }
        Some(wire::value::Kind::Slice(s)) => {
            for entry in &s.values {
                collect_fictional_pointers(entry, rt, flushed, worklist);
            }
        }
        _ => {}
    }
}

async fn send_verdict(rt: &Rt, verdict: Verdict) -> Result<(), ReplayError> {
    let kind = match verdict {
        Verdict::Pass => stream_commands_request::Kind::PassCommand(wire::Pass {}),
        Verdict::Drop => stream_commands_request::Kind::DropCommand(wire::Drop {}),
    };
    rt.send_only(wire::StreamCommandsRequest { kind: Some(kind) }).await
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::command::Command;
    use crate::rt::test_support::test_rt;
    use crate::value::{PodScalar, Value};
    use trace_proto::v1::stream_commands_response;

    fn api_id() -> wire::ApiId {
        wire::ApiId { data: vec![1] }
    }

    fn uint8_type(id: u64) -> wire::Type {
        wire::Type { type_id: id, name: "uint8_t".into(), kind: Some(wire::r#type::Kind::Pod(wire::Pod::Uint8 as i32)) }
    }

    fn pointer_type(id: u64, pointee: u64) -> wire::Type {
        wire::Type {
            type_id: id,
            name: "uint8_t*".into(),
            kind: Some(wire::r#type::Kind::Pointer(wire::PointerType { pointee, is_const: false })),
        }
    }

    /// The `"&"`-suffixed slice type a flushed pointer's memory is reported
    /// under, distinct from its pointee's own element type.
    fn slice_type(id: u64, name: &str) -> wire::Type {
        wire::Type { type_id: id, name: name.into(), kind: Some(wire::r#type::Kind::Pod(wire::Pod::Uint8 as i32)) }
    }

    fn command_response(name: &str, params: Vec<wire::Parameter>) -> wire::StreamCommandsResponse {
        wire::StreamCommandsResponse {
            kind: Some(stream_commands_response::Kind::Command(wire::Command { name: name.into(), api: Some(api_id()), parameters: params })),
        }
    }

    fn done_response() -> wire::StreamCommandsResponse {
        wire::StreamCommandsResponse { kind: Some(stream_commands_response::Kind::Done(wire::Done {})) }
    }

    fn initial_commands_done_response() -> wire::StreamCommandsResponse {
        wire::StreamCommandsResponse { kind: Some(stream_commands_response::Kind::InitialCommandsDone(wire::InitialCommandsDone {})) }
    }

    /// The historical test default: every command is dispatched from the
    /// start of the session, as if `initial_commands_done` had already fired.
    fn all_commands_config() -> SessionConfig {
        SessionConfig { include_initial_commands: true, ..Default::default() }
    }

    struct PassAllHandler {
        seen: Vec<String>,
    }

    #[tonic::async_trait]
    impl Handler for PassAllHandler {
        async fn dispatch(&mut self, _ctx: &mut DispatchContext, cmd: &Command) -> Result<Verdict, ReplayError> {
            self.seen.push(cmd.name.clone());
            Ok(Verdict::Pass)
        }
    }

    #[tokio::test]
    async fn passthrough_session_forwards_every_command_and_stops_on_done() {
        let (rt, sent) = test_rt(vec![], vec![command_response("vkQueueSubmit", vec![]), done_response()]);
        let handler = PassAllHandler { seen: Vec::new() };

        let stats = run(rt, all_commands_config(), handler).await.unwrap();

        assert_eq!(stats.commands_processed, 1);
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].kind, Some(stream_commands_request::Kind::PassCommand(_))));
    }

    struct DropOneHandler;

    #[tonic::async_trait]
    impl Handler for DropOneHandler {
        async fn dispatch(&mut self, _ctx: &mut DispatchContext, _cmd: &Command) -> Result<Verdict, ReplayError> {
            Ok(Verdict::Drop)
        }
    }

    #[tokio::test]
    async fn dropped_command_is_never_forwarded() {
        let (rt, sent) = test_rt(vec![], vec![command_response("vkQueuePresentKHR", vec![]), done_response()]);
        let stats = run(rt, all_commands_config(), DropOneHandler).await.unwrap();

        assert_eq!(stats.commands_processed, 1);
        assert!(matches!(sent.lock().unwrap()[0].kind, Some(stream_commands_request::Kind::DropCommand(_))));
    }

    struct WriteThroughPointerHandler;

    #[tonic::async_trait]
    impl Handler for WriteThroughPointerHandler {
        async fn dispatch(&mut self, _ctx: &mut DispatchContext, cmd: &Command) -> Result<Verdict, ReplayError> {
            let ptr = cmd.param("buf").unwrap().value.as_pointer().unwrap().clone();
            ptr.get(0).await?;
            ptr.set(0, Value::Pod(PodScalar::U8(42))).await?;
            Ok(Verdict::Pass)
        }
    }

    #[tokio::test]
    async fn mutating_a_pointer_flushes_put_memory_before_the_verdict() {
        let pointer_param = wire::Parameter {
            name: "buf".into(),
            r#type: Some(wire::TypeRef { type_index: 2 }),
            value: Some(wire::Value { kind: Some(wire::value::Kind::Pointer(wire::PointerValue { address: 0x4000, fictional: false })) }),
        };
        let resolve_response = wire::StreamCommandsResponse {
            kind: Some(stream_commands_response::Kind::ReadObject(wire::Value {
                kind: Some(wire::value::Kind::Pod(wire::PodValue { value: Some(wire::pod_value::Value::Uint8(0)) })),
            })),
        };

        let (rt, sent) = test_rt(
            vec![uint8_type(1), pointer_type(2, 1), slice_type(3, "uint8_t&")],
            vec![command_response("vkMapMemory", vec![pointer_param]), resolve_response, done_response()],
        );

        let stats = run(rt, all_commands_config(), WriteThroughPointerHandler).await.unwrap();
        assert_eq!(stats.commands_processed, 1);

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 3, "expected a ResolveObject, a PutMemory, then the Pass verdict");
        assert!(matches!(sent[0].kind, Some(stream_commands_request::Kind::ResolveObject(_))));
        match &sent[1].kind {
            Some(stream_commands_request::Kind::PutMemory(put)) => {
                assert_eq!(put.objects.len(), 1);
                assert_eq!(put.objects[0].pointer.as_ref().unwrap().address, 0x4000);
                assert_eq!(
                    put.objects[0].r#type.as_ref().unwrap().type_index,
                    3,
                    "the memory object's type must be the `&`-suffixed slice type, not the pointee's own type"
                );
            }
            other => panic!("expected PutMemory, got {other:?}"),
        }
        assert!(matches!(sent[2].kind, Some(stream_commands_request::Kind::PassCommand(_))));
    }

    #[tokio::test]
    async fn a_protocol_error_from_the_service_aborts_the_session() {
        let err_response =
            wire::StreamCommandsResponse { kind: Some(stream_commands_response::Kind::Error(wire::Error { message: "boom".into() })) };
        let (rt, _) = test_rt(vec![], vec![err_response]);
        let err = run(rt, all_commands_config(), PassAllHandler { seen: Vec::new() }).await.unwrap_err();
        assert!(matches!(err, ReplayError::Protocol(msg) if msg == "boom"));
    }

    struct MakeBufferHandler;

    #[tonic::async_trait]
    impl Handler for MakeBufferHandler {
        async fn dispatch(&mut self, ctx: &mut DispatchContext, cmd: &Command) -> Result<Verdict, ReplayError> {
            let outer = cmd.param("pSubmits").unwrap().value.as_pointer().unwrap().clone();
            let pointee = ctx.rt.get_type_by_name("uint8_t", &cmd.api).await?;
            let inner = ctx.make(pointee, 1).await?;
            inner.set(0, Value::Pod(PodScalar::U8(72))).await?;
            outer.set(0, Value::Pointer(inner)).await?;
            Ok(Verdict::Pass)
        }
    }

    #[tokio::test]
    async fn a_fictional_pointer_nested_in_an_already_dirty_field_is_also_flushed() {
        let pointer_param = wire::Parameter {
            name: "pSubmits".into(),
            r#type: Some(wire::TypeRef { type_index: 2 }),
            value: Some(wire::Value { kind: Some(wire::value::Kind::Pointer(wire::PointerValue { address: 0x5000, fictional: false })) }),
        };
        let resolve_response = wire::StreamCommandsResponse {
            kind: Some(stream_commands_response::Kind::ReadObject(wire::Value {
                kind: Some(wire::value::Kind::Pointer(wire::PointerValue { address: 0, fictional: true })),
            })),
        };

        let (rt, sent) = test_rt(
            vec![
                uint8_type(1),
                pointer_type(5, 1),
                pointer_type(2, 5),
                slice_type(3, "uint8_t&"),
                slice_type(4, "uint8_t*&"),
            ],
            vec![command_response("vkQueueSubmit", vec![pointer_param]), resolve_response, done_response()],
        );

        let stats = run(rt, all_commands_config(), MakeBufferHandler).await.unwrap();
        assert_eq!(stats.commands_processed, 1);

        let sent = sent.lock().unwrap();
        match &sent[1].kind {
            Some(stream_commands_request::Kind::PutMemory(put)) => {
                assert_eq!(put.objects.len(), 2, "both the outer slot and the newly-made pointer must flush");
                let addresses: Vec<u64> = put.objects.iter().map(|o| o.pointer.as_ref().unwrap().address).collect();
                assert!(addresses.contains(&0x5000), "the outer pointer's own slot must flush");
                assert!(
                    addresses.iter().any(|a| *a != 0x5000),
                    "the nested fictional pointer discovered only inside the outer slot must also flush"
                );
            }
            other => panic!("expected PutMemory, got {other:?}"),
        }
    }

    struct RecordingHandler {
        seen: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[tonic::async_trait]
    impl Handler for RecordingHandler {
        async fn dispatch(&mut self, _ctx: &mut DispatchContext, cmd: &Command) -> Result<Verdict, ReplayError> {
            self.seen.lock().unwrap().push(cmd.name.clone());
            Ok(Verdict::Pass)
        }
    }

    #[tokio::test]
    async fn commands_before_initial_commands_done_are_not_dispatched_when_disabled() {
        let (rt, sent) = test_rt(
            vec![],
            vec![
                command_response("vkCreateInstance", vec![]),
                initial_commands_done_response(),
                command_response("vkQueueSubmit", vec![]),
                done_response(),
            ],
        );
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let handler = RecordingHandler { seen: seen.clone() };

        let stats = run(rt, SessionConfig::default(), handler).await.unwrap();

        assert_eq!(stats.commands_processed, 2);
        assert_eq!(*seen.lock().unwrap(), vec!["vkQueueSubmit".to_string()]);
        // Both commands still get an explicit verdict even when skipped.
        let sent = sent.lock().unwrap();
        assert!(matches!(sent[0].kind, Some(stream_commands_request::Kind::PassCommand(_))));
    }
}
