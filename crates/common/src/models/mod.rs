mod stats;
mod user;

pub use stats::{ConnectionStatus, StatsSnapshot};
pub use user::TunnelUser;
