pub mod app;
pub mod backend;
pub mod checksum;
pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod logging;
pub mod markup;
pub mod output;
pub mod recorder;
pub mod scheduler;
pub mod store;
pub mod transfer;
pub mod transport;
