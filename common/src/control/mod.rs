// Control plane: request/reply administration of a running scheduler

pub mod channel;
pub mod handler;
pub mod protocol;

pub use channel::{ControlChannel, ControlClient, NatsControlServer};
pub use handler::ControlHandler;
pub use protocol::{ControlOperation, ControlReply, ControlRequest, ControlSettings};
