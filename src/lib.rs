pub mod config;
pub mod connection;
pub mod error;
pub mod logger;
pub mod probe;
pub mod server;
pub mod socket;
pub mod throttle;

pub use config::Config;
pub use error::{Error, Result, ServerError};

pub mod prelude {
    pub use crate::connection::{Connection, CHUNK_SIZE};
    pub use crate::error::{Error, ServerError};
    pub use crate::probe::{run_probe, ProbeReport, ProbeSummary};
    pub use crate::server::{ServerOptions, TrafficServer};
    pub use crate::socket::SocketOptions;
    pub use crate::throttle::BandwidthThrottler;
}
