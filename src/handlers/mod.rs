pub mod config;
pub mod connection;
pub mod page;

pub use config::*;
pub use connection::*;
pub use page::*;
