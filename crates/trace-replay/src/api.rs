//! The opaque API identifier that scopes type and command resolution.

use std::hash::{Hash, Hasher};

use trace_proto::v1 as wire;

/// A graphics API family, as handed back by the trace service. Two commands
/// carrying equal `ApiScope`s are guaranteed to share a type namespace; two
/// different APIs may reuse the same type names for unrelated types.
#[derive(Debug, Clone, Eq)]
pub struct ApiScope {
    data: Vec<u8>,
}

impl ApiScope {
    pub(crate) fn from_wire(id: wire::ApiId) -> Self {
        ApiScope { data: id.data }
    }

    pub(crate) fn to_wire(&self) -> wire::ApiId {
        wire::ApiId { data: self.data.clone() }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl PartialEq for ApiScope {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Hash for ApiScope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.hash(state);
    }
}
