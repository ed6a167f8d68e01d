pub mod cluster_master;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod messaging;
pub mod scheduler;
pub mod shutdown;
pub mod slicer;
pub mod store;
pub mod worker;
