mod connection;
mod pserver;

pub use connection::serve;
pub use pserver::ParameterServer;
