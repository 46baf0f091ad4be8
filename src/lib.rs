pub mod auth;
pub mod closer;
pub mod config;
pub mod engine;
pub mod gate;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sql;
pub mod tenant;
pub mod tls;
pub mod wal;
pub mod wire;
