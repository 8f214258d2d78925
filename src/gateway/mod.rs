pub mod client;
pub mod clients;
pub mod error;
pub mod http;
pub mod registry;
pub mod types;
