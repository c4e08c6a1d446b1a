//! Generated message and service types for the trace replay/mutation
//! streaming protocol. This crate carries no behavior of its own; it is the
//! thin, generated layer that `trace-replay` programs against.

pub mod v1 {
    tonic::include_proto!("replay.v1");
}
