pub mod errors;
pub mod events;
pub mod ids;
pub mod session;

pub use errors::RelayError;
