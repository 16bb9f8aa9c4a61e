//! SSH side of an ephemeral payment server

pub mod line_reader;
pub mod script;
pub mod session;

#[cfg(test)]
pub(crate) mod test_client;

pub use session::PaymentSessionHandler;
