pub mod config;
pub mod deconz;
pub mod events;
pub mod registry;
pub mod sensors;
pub mod sink;
