pub mod bus;
pub mod chat;
pub mod filters;
pub mod registry;
pub mod server;
pub mod wire;
