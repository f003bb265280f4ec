pub mod controller;
pub mod log;
pub mod message;
pub mod records;
pub mod storage;

pub use controller::SessionController;
pub use self::log::{SessionData, SessionWriter};
pub use message::{NotificationSink, SessionMessage, StageEvent};
pub use storage::SessionStorage;
