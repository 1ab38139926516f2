#![doc = include_str!("../README.md")]

pub mod config;
pub mod error;
pub mod facade;
pub mod ledger;
pub mod queue;
pub mod rewards;
pub mod server;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod users;

pub use error::{Error, Result};
pub use facade::{ScooterService, ServiceSettings};
pub use server::{Server, ServerHandle};
