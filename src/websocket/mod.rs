pub mod connection;
pub mod gateway;
pub mod handler;
pub mod types;

pub use connection::ConnectionManager;
pub use gateway::Gateway;
pub use handler::ws_handler;
