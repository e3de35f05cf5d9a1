pub mod agent;
pub mod artifact;
pub mod closer;
pub mod config;
pub mod errors;
pub mod event;
pub mod inbox;
pub mod logging;
pub mod orchestrator;
pub mod params;
pub mod persistence;
pub mod phase;
pub mod remote;
pub mod spawner;
pub mod submit;
pub mod supervisor;
pub mod tracker;
