//! Struct values: an ordered set of named fields, each independently
//! kind-checked on write.

use std::sync::{Arc, Mutex};

use crate::error::ReplayError;
use crate::types::Type;
use crate::value::{Owner, Value};

struct StructInner {
    ty: Type,
    owner: Option<Owner>,
    fields: Mutex<Vec<(String, Value)>>,
}

#[derive(Clone)]
pub struct StructHandle(Arc<StructInner>);

impl StructHandle {
    pub(crate) fn new(ty: Type, owner: Option<Owner>) -> Self {
        StructHandle(Arc::new(StructInner { ty, owner, fields: Mutex::new(Vec::new()) }))
    }

    /// Used only while decoding/defaulting: appends a field in declaration
    /// order without any kind check, since there is no prior value yet.
    pub(crate) fn init_field(&self, name: String, value: Value) {
        self.0.fields.lock().unwrap().push((name, value));
    }

    pub fn type_name(&self) -> &str {
        self.0.ty.name()
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        self.0.fields.lock().unwrap().iter().find(|(n, _)| n == name).map(|(_, v)| v.clone())
    }

    pub fn field_names(&self) -> Vec<String> {
        self.0.fields.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }

    /// Replaces a field's value, rejecting a write whose kind doesn't match
    /// the field's current value, and marking the owning pointer (if any)
    /// dirty.
    pub fn set_field(&self, name: &str, value: Value) -> Result<(), ReplayError> {
        let mut fields = self.0.fields.lock().unwrap();
        let slot = fields
            .iter_mut()
            .find(|(n, _)| n == name)
            .ok_or_else(|| ReplayError::Protocol(format!("struct `{}` has no field `{name}`", self.0.ty.name())))?;
        if slot.1.kind() != value.kind() {
            return Err(ReplayError::KindMismatch { expected: slot.1.kind(), found: value.kind() });
        }
        slot.1 = value;
        drop(fields);
        if let Some((ptr, offset)) = &self.0.owner {
            ptr.mark_dirty(*offset);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiScope;
    use crate::rt::test_support::test_rt;
    use crate::value::{PodScalar, PointerHandle};
    use trace_proto::v1 as wire;

    fn api() -> ApiScope {
        ApiScope::from_wire(wire::ApiId { data: vec![3] })
    }

    fn uint8_type(id: u64) -> Type {
        let wire_ty = wire::Type { type_id: id, name: "uint8_t".into(), kind: Some(wire::r#type::Kind::Pod(wire::Pod::Uint8 as i32)) };
        Type::from_wire(wire_ty, api())
    }

    #[test]
    fn field_write_rejects_a_kind_change() {
        let s = StructHandle::new(uint8_type(1), None);
        s.init_field("count".into(), Value::Pod(PodScalar::U8(0)));

        let err = s.set_field("count", Value::Pod(PodScalar::Bool(true))).unwrap_err();
        assert!(matches!(err, ReplayError::KindMismatch { .. }));
    }

    #[test]
    fn unknown_field_is_rejected() {
        let s = StructHandle::new(uint8_type(1), None);
        s.init_field("count".into(), Value::Pod(PodScalar::U8(0)));

        assert!(s.set_field("missing", Value::Pod(PodScalar::U8(1))).is_err());
    }

    #[tokio::test]
    async fn field_write_marks_the_owning_pointer_dirty() {
        let (rt, _) = test_rt(vec![], vec![]);
        let ty = uint8_type(1);
        let owner_ptr = PointerHandle::fictional(ty.clone(), rt);

        let s = StructHandle::new(ty, Some((owner_ptr.clone(), 4)));
        s.init_field("count".into(), Value::Pod(PodScalar::U8(0)));
        assert!(!owner_ptr.is_dirty());

        s.set_field("count", Value::Pod(PodScalar::U8(1))).unwrap();
        assert!(owner_ptr.is_dirty());
    }
}
