pub mod cli;
pub mod config;
pub mod events;
pub mod paths;
pub mod ports;
pub mod probe;
pub mod registry;
pub mod status;
pub mod supervisor;
pub mod sys;
