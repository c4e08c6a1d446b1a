//! Memoising type catalogue. Wraps a [`TypeSource`] — normally the trace
//! service's unary `Get` RPC — with the `(type_id)` primary and
//! `(name, api)` secondary indices the protocol promises are stable.

use std::sync::Mutex;

use fxhash::FxHashMap;
use tonic::transport::Channel;
use trace_proto::v1::{self as wire, any_path, get_response, trace_service_client::TraceServiceClient};

use crate::api::ApiScope;
use crate::error::ReplayError;
use crate::types::Type;

/// Anything that can answer a type lookup by id or by name. Exists so the
/// resolver can be swapped for an in-memory fake in tests without standing
/// up a real `TraceService`.
#[tonic::async_trait]
pub trait TypeSource: Send + Sync {
    async fn fetch_by_id(&self, id: u64) -> Result<wire::Type, ReplayError>;
    async fn fetch_by_name(&self, name: &str, api: &ApiScope) -> Result<wire::Type, ReplayError>;
}

/// Type-erased resolver handle threaded through the value graph. Every
/// lookup is scoped to an [`ApiScope`] and is safe to call repeatedly —
/// cache hits never touch the network.
#[tonic::async_trait]
pub trait TypeResolver: Send + Sync {
    async fn get_type(&self, id: u64, api: &ApiScope) -> Result<Type, ReplayError>;
    async fn get_type_by_name(&self, name: &str, api: &ApiScope) -> Result<Type, ReplayError>;
}

pub struct TypeManager<S> {
    source: S,
    by_id: Mutex<FxHashMap<u64, Type>>,
    by_name: Mutex<FxHashMap<(String, Vec<u8>), u64>>,
}

impl<S: TypeSource> TypeManager<S> {
    pub fn new(source: S) -> Self {
        TypeManager { source, by_id: Mutex::new(FxHashMap::default()), by_name: Mutex::new(FxHashMap::default()) }
    }

    fn cached_by_id(&self, id: u64) -> Option<Type> {
        self.by_id.lock().unwrap().get(&id).cloned()
    }

    fn index_name(&self, ty: &Type) {
        let key = (ty.name().to_string(), ty.api().bytes().to_vec());
        self.by_name.lock().unwrap().entry(key).or_insert_with(|| ty.id());
    }
}

#[tonic::async_trait]
impl<S: TypeSource> TypeResolver for TypeManager<S> {
    async fn get_type(&self, id: u64, api: &ApiScope) -> Result<Type, ReplayError> {
        if let Some(ty) = self.cached_by_id(id) {
            return Ok(ty);
        }
        let wire_ty = self.source.fetch_by_id(id).await?;
        let ty = Type::from_wire(wire_ty, api.clone());
        self.by_id.lock().unwrap().insert(ty.id(), ty.clone());
        self.index_name(&ty);
        Ok(ty)
    }

    async fn get_type_by_name(&self, name: &str, api: &ApiScope) -> Result<Type, ReplayError> {
        let key = (name.to_string(), api.bytes().to_vec());
        let cached_id = self.by_name.lock().unwrap().get(&key).copied();
        if let Some(id) = cached_id {
            return self.get_type(id, api).await;
        }
        let wire_ty = self.source.fetch_by_name(name, api).await?;
        let ty = Type::from_wire(wire_ty, api.clone());
        self.by_id.lock().unwrap().insert(ty.id(), ty.clone());
        self.index_name(&ty);
        Ok(ty)
    }
}

/// [`TypeSource`] backed by the real `TraceService.Get` unary RPC. The
/// generated client wraps a `Channel`, which is cheap to clone, so each call
/// borrows its own clone rather than serialising lookups behind a lock.
#[derive(Clone)]
pub struct GrpcTypeSource {
    client: TraceServiceClient<Channel>,
}

impl GrpcTypeSource {
    pub fn new(client: TraceServiceClient<Channel>) -> Self {
        GrpcTypeSource { client }
    }
}

#[tonic::async_trait]
impl TypeSource for GrpcTypeSource {
    async fn fetch_by_id(&self, id: u64) -> Result<wire::Type, ReplayError> {
        let path = wire::AnyPath { kind: Some(any_path::Kind::Type(wire::TypeRef { type_index: id })) };
        self.get(path).await
    }

    async fn fetch_by_name(&self, name: &str, api: &ApiScope) -> Result<wire::Type, ReplayError> {
        let path = wire::AnyPath {
            kind: Some(any_path::Kind::TypeByName(wire::TypeByNameRef {
                type_name: name.to_string(),
                api: Some(api.to_wire()),
            })),
        };
        self.get(path).await
    }
}

impl GrpcTypeSource {
    async fn get(&self, path: wire::AnyPath) -> Result<wire::Type, ReplayError> {
        let mut client = self.client.clone();
        let resp = client.get(wire::GetRequest { path: Some(path) }).await?.into_inner();
        match resp.kind {
            Some(get_response::Kind::TypeInfo(info)) => info.r#type.ok_or(ReplayError::MissingField("type_info.type")),
            Some(get_response::Kind::Error(e)) => Err(ReplayError::UnknownType(e.message)),
            None => Err(ReplayError::MissingField("get_response.kind")),
        }
    }
}
