//! Lazily-resolved pointer handle: the one node in the value graph that can
//! trigger a round trip to the trace service.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use trace_proto::v1::{self as wire, stream_commands_request, stream_commands_response};

use crate::error::ReplayError;
use crate::rt::Rt;
use crate::types::Type;
use crate::value::Value;

struct PointerInner {
    underlying: Type,
    address: u64,
    /// True for pointers the client minted itself (via `Make`, or as the
    /// default value of a pointer-typed field): reads never hit the wire,
    /// they materialise `underlying`'s default value the first time an
    /// index is touched.
    external_init: bool,
    rt: Rt,
    items: Mutex<BTreeMap<u64, Value>>,
    dirty: Mutex<BTreeSet<u64>>,
}

/// A handle onto memory the trace service addresses by `(pointer, offset)`.
/// Every index is resolved at most once; subsequent reads and writes hit
/// the local cache. Clones share the same underlying state.
#[derive(Clone)]
pub struct PointerHandle(Arc<PointerInner>);

impl PointerHandle {
    pub(crate) fn from_wire(underlying: Type, address: u64, rt: Rt) -> Self {
        PointerHandle(Arc::new(PointerInner {
            underlying,
            address,
            external_init: false,
            rt,
            items: Mutex::new(BTreeMap::new()),
            dirty: Mutex::new(BTreeSet::new()),
        }))
    }

    /// A client-minted pointer with no remote backing: `Make<T>(n)` and the
    /// default value of a pointer-typed field both go through here.
    pub(crate) fn fictional(underlying: Type, rt: Rt) -> Self {
        let address = rt.alloc_address();
        let handle = PointerHandle(Arc::new(PointerInner {
            underlying,
            address,
            external_init: true,
            rt: rt.clone(),
            items: Mutex::new(BTreeMap::new()),
            dirty: Mutex::new(BTreeSet::new()),
        }));
        rt.register_fictional(address, handle.clone());
        handle
    }

    pub fn address(&self) -> u64 {
        self.0.address
    }

    pub fn is_fictional(&self) -> bool {
        self.0.external_init
    }

    pub fn underlying(&self) -> &Type {
        &self.0.underlying
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Materialises `Make<T>(n)`'s `n` contiguous default elements without
    /// issuing any sub-requests.
    pub(crate) async fn prefill(&self, n: u64) -> Result<(), ReplayError> {
        for i in 0..n {
            self.get(i).await?;
        }
        Ok(())
    }

    pub async fn get(&self, index: u64) -> Result<Value, ReplayError> {
        if let Some(v) = self.0.items.lock().unwrap().get(&index) {
            return Ok(v.clone());
        }

        let value = if self.0.external_init {
            self.0.underlying.default_value(&self.0.rt, Some((self.clone(), index))).await?
        } else {
            let req = wire::StreamCommandsRequest {
                kind: Some(stream_commands_request::Kind::ResolveObject(wire::ResolveObject {
                    pointer: self.0.address,
                    r#type: Some(wire::TypeRef { type_index: self.0.underlying.id() }),
                    offset: index,
                })),
            };
            let resp = self.0.rt.send_and_recv(req).await?;
            let wire_val = match resp.kind {
                Some(stream_commands_response::Kind::ReadObject(v)) => v,
                other => return Err(ReplayError::Protocol(format!("expected read_object, got {other:?}"))),
            };
            self.0.underlying.decode(&self.0.rt, &wire_val, Some((self.clone(), index))).await?
        };

        self.0.items.lock().unwrap().insert(index, value.clone());
        Ok(value)
    }

    /// External (client-allocated) pointers never had a service-provided
    /// value to check against, so a write to one always succeeds outright;
    /// writing a remote pointer's offset first reads (and caches) the
    /// existing value and rejects a kind-changing write.
    pub async fn set(&self, index: u64, value: Value) -> Result<(), ReplayError> {
        if !self.0.external_init {
            let old = self.get(index).await?;
            if old.kind() != value.kind() {
                return Err(ReplayError::KindMismatch { expected: old.kind(), found: value.kind() });
            }
        }
        self.0.items.lock().unwrap().insert(index, value);
        self.mark_dirty(index);
        Ok(())
    }

    pub(crate) fn mark_dirty(&self, index: u64) {
        self.0.dirty.lock().unwrap().insert(index);
        self.0.rt.mark_dirty(self.identity(), self.clone());
    }

    pub fn is_dirty(&self) -> bool {
        !self.0.dirty.lock().unwrap().is_empty()
    }

    /// Densifies the dirty range `0..=max(dirty offsets)` into a single
    /// `SliceValue`, materialising any untouched offsets in between via
    /// their type's default/resolve path, and clears the dirty set.
    pub(crate) async fn flush(&self) -> Result<Option<wire::Value>, ReplayError> {
        let max = match self.0.dirty.lock().unwrap().iter().next_back().copied() {
            Some(m) => m,
            None => return Ok(None),
        };

        let mut values = Vec::with_capacity(max as usize + 1);
        for i in 0..=max {
            let v = self.get(i).await?;
            values.push(self.0.underlying.encode(&self.0.rt, &v).await?);
        }
        self.0.dirty.lock().unwrap().clear();
        Ok(Some(wire::Value { kind: Some(wire::value::Kind::Slice(wire::SliceValue { values })) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiScope;
    use crate::rt::test_support::test_rt;
    use crate::value::PodScalar;
    use trace_proto::v1::stream_commands_response;

    fn api() -> ApiScope {
        ApiScope::from_wire(wire::ApiId { data: vec![9] })
    }

    fn uint8_type(id: u64) -> wire::Type {
        wire::Type { type_id: id, name: "uint8_t".into(), kind: Some(wire::r#type::Kind::Pod(wire::Pod::Uint8 as i32)) }
    }

    fn pod_value(v: u8) -> wire::Value {
        wire::Value { kind: Some(wire::value::Kind::Pod(wire::PodValue { value: Some(wire::pod_value::Value::Uint8(v as u32)) })) }
    }

    #[tokio::test]
    async fn writing_one_offset_densifies_the_whole_prefix_on_flush() {
        let (rt, sent) = test_rt(vec![uint8_type(1)], vec![]);
        let underlying = rt.get_type(1, &api()).await.unwrap();
        let ptr = PointerHandle::fictional(underlying, rt);

        ptr.set(5, Value::Pod(PodScalar::U8(9))).await.unwrap();
        let flushed = ptr.flush().await.unwrap().expect("dirty pointer flushes a slice");

        match flushed.kind {
            Some(wire::value::Kind::Slice(s)) => {
                let values: Vec<u8> = s
                    .values
                    .into_iter()
                    .map(|v| match v.kind {
                        Some(wire::value::Kind::Pod(p)) => match p.value {
                            Some(wire::pod_value::Value::Uint8(n)) => n as u8,
                            _ => panic!("expected a uint8"),
                        },
                        _ => panic!("expected a pod value"),
                    })
                    .collect();
                assert_eq!(values, vec![0, 0, 0, 0, 0, 9]);
            }
            _ => panic!("expected a slice value"),
        }

        assert!(sent.lock().unwrap().is_empty(), "a fictional pointer never touches the transport");
    }

    #[tokio::test]
    async fn remote_reads_are_memoised() {
        let response = wire::StreamCommandsResponse { kind: Some(stream_commands_response::Kind::ReadObject(pod_value(7))) };
        let (rt, sent) = test_rt(vec![uint8_type(1)], vec![response]);
        let underlying = rt.get_type(1, &api()).await.unwrap();
        let ptr = PointerHandle::from_wire(underlying, 0x1000, rt);

        let first = ptr.get(3).await.unwrap();
        let second = ptr.get(3).await.unwrap();

        assert_eq!(first.as_pod(), Some(&PodScalar::U8(7)));
        assert_eq!(second.as_pod(), Some(&PodScalar::U8(7)));
        assert_eq!(sent.lock().unwrap().len(), 1, "the second read must hit the cache, not the wire");
    }

    #[tokio::test]
    async fn remote_pointer_rejects_a_kind_changing_write() {
        let response = wire::StreamCommandsResponse { kind: Some(stream_commands_response::Kind::ReadObject(pod_value(0))) };
        let (rt, _) = test_rt(vec![uint8_type(1)], vec![response]);
        let underlying = rt.get_type(1, &api()).await.unwrap();
        let ptr = PointerHandle::from_wire(underlying.clone(), 0x2000, rt.clone());

        let other_ptr = PointerHandle::fictional(underlying, rt);
        let err = ptr.set(0, Value::Pointer(other_ptr)).await.unwrap_err();
        assert!(matches!(err, ReplayError::KindMismatch { .. }));
    }

    #[tokio::test]
    async fn external_pointer_write_never_checks_kind() {
        let (rt, _) = test_rt(vec![uint8_type(1)], vec![]);
        let underlying = rt.get_type(1, &api()).await.unwrap();
        let ptr = PointerHandle::fictional(underlying.clone(), rt.clone());
        let other_ptr = PointerHandle::fictional(underlying, rt);

        // `ptr`'s own declared element type is uint8, but a fresh,
        // client-allocated pointer has no service-provided value to check a
        // write against, so this must succeed despite the kind swap.
        ptr.set(0, Value::Pointer(other_ptr)).await.unwrap();
        assert!(ptr.get(0).await.unwrap().as_pointer().is_some());
    }
}
