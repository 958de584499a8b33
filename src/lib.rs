pub mod behavior;
pub mod config;
pub mod context;
pub mod health;
pub mod inputs;
pub mod lifecycle;
pub mod messages;
pub mod motor;
pub mod runtime;
pub mod safety;
