pub mod config;
pub mod error;
pub mod harness;
pub mod judge;
pub mod language;
pub mod problems;
pub mod queue;
pub mod routes;
pub mod sandbox;
pub mod session;
pub mod toolchain;
pub mod web_server;
pub mod worker;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
