pub mod clock;
pub mod error;
pub mod fetch;
pub mod infra;
pub mod ingest;
pub mod modes;
pub mod parser;
pub mod publish;
pub mod report;
pub mod services;
pub mod token;

pub use error::HarvestError;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
