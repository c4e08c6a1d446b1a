//! Fixed-size array values: indexed, not named, and — unlike struct fields —
//! writable without a kind check, since every element is a pod by
//! construction.

use std::sync::{Arc, Mutex};

use crate::error::ReplayError;
use crate::types::Type;
use crate::value::{Owner, Value};

struct ArrayInner {
    ty: Type,
    declared_size: u64,
    owner: Option<Owner>,
    items: Mutex<Vec<Value>>,
}

#[derive(Clone)]
pub struct ArrayHandle(Arc<ArrayInner>);

impl ArrayHandle {
    pub(crate) fn new(ty: Type, declared_size: u64, items: Vec<Value>, owner: Option<Owner>) -> Self {
        ArrayHandle(Arc::new(ArrayInner { ty, declared_size, owner, items: Mutex::new(items) }))
    }

    pub fn type_name(&self) -> &str {
        self.0.ty.name()
    }

    pub fn declared_size(&self) -> u64 {
        self.0.declared_size
    }

    pub fn len(&self) -> usize {
        self.0.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn items(&self) -> Vec<Value> {
        self.0.items.lock().unwrap().clone()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.items.lock().unwrap().get(index).cloned()
    }

    /// Elements are pods by construction, so a write only needs to land
    /// within bounds; unlike a struct field, there is no declared per-index
    /// kind to check a write against.
    pub fn set(&self, index: usize, value: Value) -> Result<(), ReplayError> {
        let mut items = self.0.items.lock().unwrap();
        let slot = items.get_mut(index).ok_or(ReplayError::IndexOutOfRange(index as u64))?;
        *slot = value;
        drop(items);
        if let Some((ptr, offset)) = &self.0.owner {
            ptr.mark_dirty(*offset);
        }
        Ok(())
    }
}
