//! In-memory representation of a resolved type, and the decode/encode/default
//! operations that translate between wire [`wire::Value`] messages and the
//! live value graph.

use std::sync::Arc;

use futures::future::BoxFuture;
use trace_proto::v1 as wire;

use crate::api::ApiScope;
use crate::error::ReplayError;
use crate::rt::Rt;
use crate::value::{ArrayHandle, Owner, PodScalar, PointerHandle, StructHandle, Value};

/// The twelve primitive wire scalars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodKind {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Bool,
    Str,
}

/// A platform-width integer whose concrete wire encoding depends on its
/// role rather than its declared width, distinct from the fixed-width pods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizedKind {
    Int,
    UInt,
    /// Encoded as a single byte on the wire, not the platform width its name
    /// suggests; callers rely on the narrower range.
    Char,
    Size,
}

#[derive(Clone)]
pub enum TypeKind {
    Pod(PodKind),
    Sized(SizedKind),
    Pointer { pointee: u64, is_const: bool },
    Array { element: u64, size: u64 },
    Struct { fields: Vec<(String, u64)> },
    Enum { underlying: u64 },
    Pseudonym { underlying: u64 },
    /// A discriminator this crate doesn't recognise. Resolvable and
    /// nameable, but any attempt to decode or encode a value of this type
    /// fails with [`ReplayError::UnknownType`].
    Unknown,
}

struct TypeInner {
    id: u64,
    name: String,
    api: ApiScope,
    kind: TypeKind,
}

/// A resolved, reference-counted handle to an entry in the type catalogue.
/// Cheap to clone; every clone shares the same underlying identity and API
/// scope, so `underlying()` calls never need the caller to re-supply one.
#[derive(Clone)]
pub struct Type(Arc<TypeInner>);

impl Type {
    pub(crate) fn from_wire(wire_ty: wire::Type, api: ApiScope) -> Self {
        use wire::r#type::Kind as WireKind;

        let kind = match wire_ty.kind {
            Some(WireKind::Pod(pod)) => match wire::Pod::try_from(pod) {
                Ok(wire::Pod::Uint8) => TypeKind::Pod(PodKind::U8),
                Ok(wire::Pod::Uint16) => TypeKind::Pod(PodKind::U16),
                Ok(wire::Pod::Uint32) => TypeKind::Pod(PodKind::U32),
                Ok(wire::Pod::Uint64) => TypeKind::Pod(PodKind::U64),
                Ok(wire::Pod::Sint8) => TypeKind::Pod(PodKind::I8),
                Ok(wire::Pod::Sint16) => TypeKind::Pod(PodKind::I16),
                Ok(wire::Pod::Sint32) => TypeKind::Pod(PodKind::I32),
                Ok(wire::Pod::Sint64) => TypeKind::Pod(PodKind::I64),
                Ok(wire::Pod::Float32) => TypeKind::Pod(PodKind::F32),
                Ok(wire::Pod::Float64) => TypeKind::Pod(PodKind::F64),
                Ok(wire::Pod::Bool) => TypeKind::Pod(PodKind::Bool),
                Ok(wire::Pod::String) => TypeKind::Pod(PodKind::Str),
                Ok(wire::Pod::Unspecified) | Err(_) => TypeKind::Unknown,
            },
            Some(WireKind::Sized(sized)) => match wire::SizedPrimitive::try_from(sized) {
                Ok(wire::SizedPrimitive::SizedprimInt) => TypeKind::Sized(SizedKind::Int),
                Ok(wire::SizedPrimitive::SizedprimUint) => TypeKind::Sized(SizedKind::UInt),
                Ok(wire::SizedPrimitive::SizedprimChar) => TypeKind::Sized(SizedKind::Char),
                Ok(wire::SizedPrimitive::SizedprimSize) => TypeKind::Sized(SizedKind::Size),
                Ok(wire::SizedPrimitive::SizedprimUnspecified) | Err(_) => TypeKind::Unknown,
            },
            Some(WireKind::Pointer(p)) => TypeKind::Pointer { pointee: p.pointee, is_const: p.is_const },
            Some(WireKind::Array(a)) => TypeKind::Array { element: a.element_type, size: a.size },
            Some(WireKind::StructType(s)) => TypeKind::Struct {
                fields: s.fields.into_iter().map(|f| (f.name, f.type_id)).collect(),
            },
            Some(WireKind::EnumType(e)) => TypeKind::Enum { underlying: e.underlying },
            Some(WireKind::Pseudonym(p)) => TypeKind::Pseudonym { underlying: p.underlying },
            None => TypeKind::Unknown,
        };

        Type(Arc::new(TypeInner { id: wire_ty.type_id, name: wire_ty.name, api, kind }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn api(&self) -> &ApiScope {
        &self.0.api
    }

    pub fn kind(&self) -> &TypeKind {
        &self.0.kind
    }

    /// Follows one level of indirection: pointee, element, enum, or
    /// pseudonym underlying type. Pods and structs have no single
    /// underlying type and return `None`.
    pub fn underlying<'a>(&'a self, rt: &'a Rt) -> BoxFuture<'a, Result<Option<Type>, ReplayError>> {
        Box::pin(async move {
            let child_id = match &self.0.kind {
                TypeKind::Pointer { pointee, .. } => *pointee,
                TypeKind::Array { element, .. } => *element,
                TypeKind::Enum { underlying } => *underlying,
                TypeKind::Pseudonym { underlying } => *underlying,
                _ => return Ok(None),
            };
            Ok(Some(rt.get_type(child_id, &self.0.api).await?))
        })
    }

    /// Decodes a wire value according to this type. `owner` threads the
    /// (pointer, offset) this value lives inside, so nested struct/array
    /// writes can mark the enclosing pointer dirty; it does not propagate
    /// into freshly decoded pointer values, which track their own dirty
    /// state independently.
    pub fn decode<'a>(
        &'a self,
        rt: &'a Rt,
        wire_val: &'a wire::Value,
        owner: Option<Owner>,
    ) -> BoxFuture<'a, Result<Value, ReplayError>> {
        Box::pin(async move {
            use wire::value::Kind as WireKind;

            match (&self.0.kind, &wire_val.kind) {
                (TypeKind::Pod(pod), Some(WireKind::Pod(p))) => Ok(Value::Pod(decode_pod(*pod, p)?)),
                (TypeKind::Sized(sized), Some(WireKind::Pod(p))) => Ok(Value::Pod(decode_sized(*sized, p)?)),
                (TypeKind::Pointer { .. }, Some(WireKind::Pointer(p))) => {
                    let underlying = self.underlying(rt).await?.ok_or(ReplayError::Protocol(
                        "pointer type resolved with no pointee".into(),
                    ))?;
                    Ok(Value::Pointer(PointerHandle::from_wire(underlying, p.address, rt.clone())))
                }
                (TypeKind::Struct { fields }, Some(WireKind::StructValue(s))) => {
                    if fields.len() != s.fields.len() {
                        return Err(ReplayError::Protocol(format!(
                            "struct `{}` has {} fields but wire value carried {}",
                            self.0.name,
                            fields.len(),
                            s.fields.len()
                        )));
                    }
                    let handle = StructHandle::new(self.clone(), owner.clone());
                    for ((name, type_id), wire_field) in fields.iter().zip(s.fields.iter()) {
                        let field_ty = rt.get_type(*type_id, &self.0.api).await?;
                        let value = field_ty.decode(rt, wire_field, owner.clone()).await?;
                        handle.init_field(name.clone(), value);
                    }
                    Ok(Value::Struct(handle))
                }
                (TypeKind::Array { element, size }, Some(WireKind::Array(a))) => {
                    let element_ty = rt.get_type(*element, &self.0.api).await?;
                    let mut items = Vec::with_capacity(a.entries.len());
                    for entry in &a.entries {
                        items.push(element_ty.decode(rt, entry, owner.clone()).await?);
                    }
                    Ok(Value::Array(ArrayHandle::new(self.clone(), *size, items, owner)))
                }
                (TypeKind::Array { element, size }, Some(WireKind::Pod(p))) => {
                    let element_ty = rt.get_type(*element, &self.0.api).await?;
                    let scalars = decode_pod_array(&element_ty, p)?;
                    let items = scalars.into_iter().map(Value::Pod).collect();
                    Ok(Value::Array(ArrayHandle::new(self.clone(), *size, items, owner)))
                }
                (TypeKind::Enum { underlying } | TypeKind::Pseudonym { underlying }, _) => {
                    let real = rt.get_type(*underlying, &self.0.api).await?;
                    real.decode(rt, wire_val, owner).await
                }
                (TypeKind::Unknown, _) => Err(ReplayError::UnknownType(self.0.name.clone())),
                (_, None) => Err(ReplayError::MissingField("value.kind")),
                (other, _) => Err(ReplayError::Protocol(format!(
                    "type `{}` ({:?}) cannot decode this wire value shape",
                    self.0.name,
                    std::mem::discriminant(other)
                ))),
            }
        })
    }

    /// Produces a default ("zero") value for this type without consulting
    /// the wire. Used to populate client-allocated (`external_init`)
    /// pointers and freshly-made arrays.
    pub fn default_value<'a>(&'a self, rt: &'a Rt, owner: Option<Owner>) -> BoxFuture<'a, Result<Value, ReplayError>> {
        Box::pin(async move {
            match &self.0.kind {
                TypeKind::Pod(pod) => Ok(Value::Pod(default_pod(*pod))),
                TypeKind::Sized(sized) => Ok(Value::Pod(default_sized(*sized))),
                TypeKind::Pointer { .. } => {
                    let underlying = self.underlying(rt).await?.ok_or(ReplayError::Protocol(
                        "pointer type resolved with no pointee".into(),
                    ))?;
                    Ok(Value::Pointer(PointerHandle::fictional(underlying, rt.clone())))
                }
                TypeKind::Struct { fields } => {
                    let handle = StructHandle::new(self.clone(), owner.clone());
                    for (name, type_id) in fields {
                        let field_ty = rt.get_type(*type_id, &self.0.api).await?;
                        let value = field_ty.default_value(rt, owner.clone()).await?;
                        handle.init_field(name.clone(), value);
                    }
                    Ok(Value::Struct(handle))
                }
                TypeKind::Array { element, size } => {
                    let element_ty = rt.get_type(*element, &self.0.api).await?;
                    let mut items = Vec::with_capacity(*size as usize);
                    for _ in 0..*size {
                        items.push(element_ty.default_value(rt, owner.clone()).await?);
                    }
                    Ok(Value::Array(ArrayHandle::new(self.clone(), *size, items, owner)))
                }
                TypeKind::Enum { underlying } | TypeKind::Pseudonym { underlying } => {
                    let real = rt.get_type(*underlying, &self.0.api).await?;
                    real.default_value(rt, owner).await
                }
                TypeKind::Unknown => Err(ReplayError::UnknownType(self.0.name.clone())),
            }
        })
    }

    /// Encodes a live value back into a wire message using this type as the
    /// authority on wire shape. Callers are expected to have already
    /// checked `value.kind()` against this type where it matters.
    pub fn encode<'a>(&'a self, rt: &'a Rt, value: &'a Value) -> BoxFuture<'a, Result<wire::Value, ReplayError>> {
        Box::pin(async move {
            match (&self.0.kind, value) {
                (TypeKind::Pod(pod), Value::Pod(scalar)) => Ok(wire_value_pod(encode_pod(*pod, scalar)?)),
                (TypeKind::Sized(sized), Value::Pod(scalar)) => Ok(wire_value_pod(encode_sized(*sized, scalar)?)),
                (TypeKind::Pointer { .. }, Value::Pointer(ptr)) => Ok(wire::Value {
                    kind: Some(wire::value::Kind::Pointer(wire::PointerValue {
                        address: ptr.address(),
                        fictional: ptr.is_fictional(),
                    })),
                }),
                (TypeKind::Struct { fields }, Value::Struct(handle)) => {
                    let mut wire_fields = Vec::with_capacity(fields.len());
                    for (name, type_id) in fields {
                        let field_ty = rt.get_type(*type_id, &self.0.api).await?;
                        let field_val = handle.field(name).ok_or_else(|| {
                            ReplayError::Protocol(format!("struct `{}` missing field `{name}`", self.0.name))
                        })?;
                        wire_fields.push(field_ty.encode(rt, &field_val).await?);
                    }
                    Ok(wire::Value { kind: Some(wire::value::Kind::StructValue(wire::StructValue { fields: wire_fields })) })
                }
                (TypeKind::Array { element, .. }, Value::Array(handle)) => {
                    let element_ty = rt.get_type(*element, &self.0.api).await?;
                    let mut entries = Vec::with_capacity(handle.len());
                    for item in handle.items() {
                        entries.push(element_ty.encode(rt, &item).await?);
                    }
                    Ok(wire::Value { kind: Some(wire::value::Kind::Array(wire::ArrayValue { entries })) })
                }
                (TypeKind::Enum { underlying } | TypeKind::Pseudonym { underlying }, _) => {
                    let real = rt.get_type(*underlying, &self.0.api).await?;
                    real.encode(rt, value).await
                }
                (TypeKind::Unknown, _) => Err(ReplayError::UnknownType(self.0.name.clone())),
                _ => Err(ReplayError::KindMismatch { expected: self.expected_kind(), found: value.kind() }),
            }
        })
    }

    fn expected_kind(&self) -> crate::value::ValueKind {
        use crate::value::ValueKind;
        match &self.0.kind {
            TypeKind::Pod(_) | TypeKind::Sized(_) => ValueKind::Pod,
            TypeKind::Pointer { .. } => ValueKind::Pointer,
            TypeKind::Struct { .. } => ValueKind::Struct,
            TypeKind::Array { .. } => ValueKind::Array,
            TypeKind::Enum { .. } | TypeKind::Pseudonym { .. } | TypeKind::Unknown => ValueKind::Pod,
        }
    }
}

fn wire_value_pod(pod: wire::PodValue) -> wire::Value {
    wire::Value { kind: Some(wire::value::Kind::Pod(pod)) }
}

fn decode_pod(kind: PodKind, p: &wire::PodValue) -> Result<PodScalar, ReplayError> {
    use wire::pod_value::Value as V;
    match (kind, &p.value) {
        (PodKind::U8, Some(V::Uint8(v))) => Ok(PodScalar::U8(*v as u8)),
        (PodKind::U16, Some(V::Uint16(v))) => Ok(PodScalar::U16(*v as u16)),
        (PodKind::U32, Some(V::Uint32(v))) => Ok(PodScalar::U32(*v)),
        (PodKind::U64, Some(V::Uint64(v))) => Ok(PodScalar::U64(*v)),
        (PodKind::I8, Some(V::Sint8(v))) => Ok(PodScalar::I8(*v as i8)),
        (PodKind::I16, Some(V::Sint16(v))) => Ok(PodScalar::I16(*v as i16)),
        (PodKind::I32, Some(V::Sint32(v))) => Ok(PodScalar::I32(*v)),
        (PodKind::I64, Some(V::Sint64(v))) => Ok(PodScalar::I64(*v)),
        (PodKind::F32, Some(V::Float32(v))) => Ok(PodScalar::F32(*v)),
        (PodKind::F64, Some(V::Float64(v))) => Ok(PodScalar::F64(*v)),
        (PodKind::Bool, Some(V::BoolValue(v))) => Ok(PodScalar::Bool(*v)),
        (PodKind::Str, Some(V::StringValue(v))) => Ok(PodScalar::Str(v.clone())),
        _ => Err(ReplayError::Protocol(format!("pod value did not match declared kind {kind:?}"))),
    }
}

fn default_pod(kind: PodKind) -> PodScalar {
    match kind {
        PodKind::U8 => PodScalar::U8(0),
        PodKind::U16 => PodScalar::U16(0),
        PodKind::U32 => PodScalar::U32(0),
        PodKind::U64 => PodScalar::U64(0),
        PodKind::I8 => PodScalar::I8(0),
        PodKind::I16 => PodScalar::I16(0),
        PodKind::I32 => PodScalar::I32(0),
        PodKind::I64 => PodScalar::I64(0),
        PodKind::F32 => PodScalar::F32(0.0),
        PodKind::F64 => PodScalar::F64(0.0),
        PodKind::Bool => PodScalar::Bool(false),
        PodKind::Str => PodScalar::Str(String::new()),
    }
}

fn encode_pod(kind: PodKind, scalar: &PodScalar) -> Result<wire::PodValue, ReplayError> {
    use wire::pod_value::Value as V;
    let value = match (kind, scalar) {
        (PodKind::U8, PodScalar::U8(v)) => V::Uint8(*v as u32),
        (PodKind::U16, PodScalar::U16(v)) => V::Uint16(*v as u32),
        (PodKind::U32, PodScalar::U32(v)) => V::Uint32(*v),
        (PodKind::U64, PodScalar::U64(v)) => V::Uint64(*v),
        (PodKind::I8, PodScalar::I8(v)) => V::Sint8(*v as i32),
        (PodKind::I16, PodScalar::I16(v)) => V::Sint16(*v as i32),
        (PodKind::I32, PodScalar::I32(v)) => V::Sint32(*v),
        (PodKind::I64, PodScalar::I64(v)) => V::Sint64(*v),
        (PodKind::F32, PodScalar::F32(v)) => V::Float32(*v),
        (PodKind::F64, PodScalar::F64(v)) => V::Float64(*v),
        (PodKind::Bool, PodScalar::Bool(v)) => V::BoolValue(*v),
        (PodKind::Str, PodScalar::Str(v)) => V::StringValue(v.clone()),
        _ => return Err(ReplayError::KindMismatch { expected: crate::value::ValueKind::Pod, found: crate::value::ValueKind::Pod }),
    };
    Ok(wire::PodValue { value: Some(value) })
}

/// Sized primitives decode at fixed widths: signed/unsigned 64-bit for
/// `int`/`uint`/`size`, but a single byte for `char`.
fn decode_sized(kind: SizedKind, p: &wire::PodValue) -> Result<PodScalar, ReplayError> {
    use wire::pod_value::Value as V;
    match (kind, &p.value) {
        (SizedKind::Int, Some(V::Sint64(v))) => Ok(PodScalar::I64(*v)),
        (SizedKind::UInt, Some(V::Uint64(v))) => Ok(PodScalar::U64(*v)),
        (SizedKind::Size, Some(V::Uint64(v))) => Ok(PodScalar::U64(*v)),
        (SizedKind::Char, Some(V::Uint8(v))) => Ok(PodScalar::U8(*v as u8)),
        _ => Err(ReplayError::Protocol(format!("pod value did not match sized kind {kind:?}"))),
    }
}

fn default_sized(kind: SizedKind) -> PodScalar {
    match kind {
        SizedKind::Int => PodScalar::I64(0),
        SizedKind::UInt | SizedKind::Size => PodScalar::U64(0),
        SizedKind::Char => PodScalar::U8(0),
    }
}

fn encode_sized(kind: SizedKind, scalar: &PodScalar) -> Result<wire::PodValue, ReplayError> {
    use wire::pod_value::Value as V;
    let value = match (kind, scalar) {
        (SizedKind::Int, PodScalar::I64(v)) => V::Sint64(*v),
        (SizedKind::UInt, PodScalar::U64(v)) | (SizedKind::Size, PodScalar::U64(v)) => V::Uint64(*v),
        (SizedKind::Char, PodScalar::U8(v)) => V::Uint8(*v as u32),
        _ => return Err(ReplayError::KindMismatch { expected: crate::value::ValueKind::Pod, found: crate::value::ValueKind::Pod }),
    };
    Ok(wire::PodValue { value: Some(value) })
}

/// An array whose wire form fell back to the homogeneous `PodArray` fast
/// path rather than a per-entry `ArrayValue`.
fn decode_pod_array(element_ty: &Type, p: &wire::PodValue) -> Result<Vec<PodScalar>, ReplayError> {
    use wire::pod_array::Kind as A;
    use wire::pod_value::Value as V;
    let Some(V::Array(arr)) = &p.value else {
        return Err(ReplayError::Protocol("expected a pod array fast path".into()));
    };
    let kind = element_ty.kind().clone();
    match (&kind, &arr.kind) {
        (TypeKind::Pod(PodKind::U8), Some(A::Uint8(a))) => Ok(a.val.iter().map(|b| PodScalar::U8(*b)).collect()),
        (TypeKind::Pod(PodKind::U16), Some(A::Uint16(a))) => Ok(a.val.iter().map(|v| PodScalar::U16(*v as u16)).collect()),
        (TypeKind::Pod(PodKind::U32), Some(A::Uint32(a))) => Ok(a.val.iter().map(|v| PodScalar::U32(*v)).collect()),
        (TypeKind::Pod(PodKind::U64), Some(A::Uint64(a))) => Ok(a.val.iter().map(|v| PodScalar::U64(*v)).collect()),
        (TypeKind::Pod(PodKind::I8), Some(A::Sint8(a))) => Ok(a.val.iter().map(|v| PodScalar::I8(*v as i8)).collect()),
        (TypeKind::Pod(PodKind::I16), Some(A::Sint16(a))) => Ok(a.val.iter().map(|v| PodScalar::I16(*v as i16)).collect()),
        (TypeKind::Pod(PodKind::I32), Some(A::Sint32(a))) => Ok(a.val.iter().map(|v| PodScalar::I32(*v)).collect()),
        (TypeKind::Pod(PodKind::I64), Some(A::Sint64(a))) => Ok(a.val.iter().map(|v| PodScalar::I64(*v)).collect()),
        (TypeKind::Pod(PodKind::F32), Some(A::Float32(a))) => Ok(a.val.iter().map(|v| PodScalar::F32(*v)).collect()),
        (TypeKind::Pod(PodKind::F64), Some(A::Float64(a))) => Ok(a.val.iter().map(|v| PodScalar::F64(*v)).collect()),
        (TypeKind::Pod(PodKind::Bool), Some(A::BoolValue(a))) => Ok(a.val.iter().map(|v| PodScalar::Bool(*v)).collect()),
        (TypeKind::Pod(PodKind::Str), Some(A::StringValue(a))) => Ok(a.val.iter().cloned().map(PodScalar::Str).collect()),
        _ => Err(ReplayError::Protocol("pod array payload did not match element type".into())),
    }
}
