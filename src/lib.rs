pub mod client;
pub mod codec;
pub mod common;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod logging;
pub mod orchestrator;
pub mod pbft;
pub mod transport;

pub use error::PbftError;
