mod chunk;
mod message;
mod request;
mod response;

use std::collections::HashMap;

pub use chunk::BodyChunk;
pub use message::{ErrorCode, Message};
pub use request::RequestFrame;
pub use response::ResponseFrame;

/// Lowercased header name to the ordered list of its values
pub type Headers = HashMap<String, Vec<String>>;
