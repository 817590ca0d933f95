//! Server side of the live layer: the SQLite-backed `Store`, the broadcast
//! `Dispatcher` behind it, the presence reaper and the WebSocket gateway.

pub mod connection;
pub mod dispatcher;
pub mod reaper;
pub mod store;

pub use connection::handle_connection;
pub use dispatcher::Dispatcher;
pub use reaper::run_reaper_loop;
pub use store::Store;
