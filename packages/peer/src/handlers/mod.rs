pub mod error;
pub mod health;
pub mod websocket;

pub use error::ApiError;
pub use health::{health_handler, health_live_handler, health_ready_handler, metrics_handler};
pub use websocket::{chat_websocket_handler, diff_websocket_handler, queue_websocket_handler};
