pub mod codec;
pub mod config;
pub mod error;
pub mod ingest;
pub mod local;
pub mod processing;
pub mod session;
pub mod stream;
pub mod utils;
