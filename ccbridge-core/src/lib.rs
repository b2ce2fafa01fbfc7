pub mod backend;
pub mod backends;
pub mod config;
pub mod credentials;
pub mod error;
pub mod factory;
pub mod framing;
pub mod http_client;
pub mod model;
pub mod normalizer;
pub mod openai;
pub mod server;
pub mod stream;
pub mod telemetry;
pub mod translate;

pub use error::{BridgeError, CoreResult};
