pub mod clock;
pub mod config;
pub mod error;
pub mod initiator;
pub mod metadata;
mod net;
pub mod packet;
pub mod responder;
pub mod timesync;

pub use clock::{Clock, SystemClock};
pub use config::{InitiatorConfig, ResponderConfig, DEFAULT_PORT};
pub use error::SyncError;
pub use initiator::Initiator;
pub use metadata::{InitiatorStats, TimeSyncMetadata};
pub use responder::Responder;
