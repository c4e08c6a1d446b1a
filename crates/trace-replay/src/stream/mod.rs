mod driver;
mod transport;

pub use driver::{connect, drive_session, SessionConfig, SessionStats};
pub use transport::{GrpcTransport, Transport};
