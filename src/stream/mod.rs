pub mod broadcaster;
pub mod encode;
pub mod registry;

pub use broadcaster::{Broadcaster, CycleOutcome, StreamError};
#[cfg(feature = "desktop")]
pub use encode::JpegEncoder;
pub use encode::FrameEncoder;
pub use registry::{BroadcastReport, Connection, ConnectionId, ConnectionInfo, ConnectionRegistry};
