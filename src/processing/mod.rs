pub mod conditioner;
pub mod detectors;
pub mod filters;
pub mod stages;
pub mod triggers;
