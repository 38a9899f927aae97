pub mod api;
pub mod app_config;
pub mod logging;
pub mod message_queue;
pub mod topology;

pub use api::*;
pub use app_config::*;
pub use logging::*;
pub use message_queue::*;
pub use topology::*;
