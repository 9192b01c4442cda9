pub mod handlers;
pub mod rpc;
pub mod server;
pub mod stdio;

pub use handlers::HandlerState;
pub use server::{ServerConfig, ServerHandle};
