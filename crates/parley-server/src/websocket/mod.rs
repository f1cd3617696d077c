//! WebSocket transport: socket reader and writer tasks per connection.

pub mod session;

pub use session::run_ws_session;
