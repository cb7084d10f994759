mod encoding;
mod headers;
mod id;
mod time;

pub use encoding::{ChunkBuffer, decode_body, encode_body};
pub use headers::{header_value, headers_to_map, is_hop_by_hop, map_to_headers};
pub use id::{generate_connection_id, generate_secret_key, generate_subdomain};
pub use time::current_timestamp_millis;
