pub mod aggregate;
pub mod config;
pub mod feeds;
pub mod fetch;
pub mod materialize;
pub mod output;
pub mod parser;
pub mod pipeline;
pub mod publish;
pub mod resolve;
pub mod score;
pub mod stats;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
