pub mod rate_limit_middleware;

pub use rate_limit_middleware::{client_ip, rate_limit};
