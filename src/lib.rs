pub mod activity;
pub mod apps;
pub mod config;
pub mod connection;
pub mod logger;
pub mod manager;
pub mod server;
pub mod worker;
