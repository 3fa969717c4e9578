pub mod auth;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod follower;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod registry;
pub mod snapshot;
pub mod wire;
