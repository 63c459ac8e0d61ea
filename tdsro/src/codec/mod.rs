//! Conversion between packets and primitive values.
mod request;
mod response;

pub use request::RequestStream;
pub use response::ResponseStream;
