pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod file_channel;
pub mod instruction;
pub mod jog;
pub mod logging;
pub mod machine;
pub mod models;
pub mod reporter;
