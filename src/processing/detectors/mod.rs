pub mod initiation;
pub mod reference;
pub mod threshold;

pub use initiation::{choose_phase_duration, InitiationMonitor};
pub use reference::ReferenceDistribution;
pub use threshold::{Adjustment, Bound, EditOp, OperatorCommand, ThresholdBand};
