pub mod bus;
pub mod client;
pub mod frame;
pub mod message;
pub mod zmq_bus;

pub use bus::{Inbound, MessageBus};
#[cfg(any(test, feature = "test-support"))]
pub use bus::ScriptedBus;
pub use client::{ClientStats, StreamClient, TtlEvent};
pub use frame::{ChannelBlock, ChannelFragment, Frame, FrameAssembler};
pub use zmq_bus::ZmqBus;
