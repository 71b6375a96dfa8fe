pub mod cluster;
pub mod config;
pub mod discovery;
pub mod http;
pub mod node;
pub mod protocol;
pub mod replication;
pub mod snapshot;
pub mod store;
