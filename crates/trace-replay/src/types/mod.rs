pub(crate) mod manager;
mod repr;

pub use manager::{GrpcTypeSource, TypeManager, TypeResolver, TypeSource};
pub use repr::{PodKind, SizedKind, Type, TypeKind};
