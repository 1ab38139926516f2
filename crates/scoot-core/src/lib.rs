#![doc = include_str!("../README.md")]

mod client;
mod codec;
mod connection;
mod demux;
mod error;
mod location;
mod message;
mod model;

pub use client::*;
pub use codec::*;
pub use connection::*;
pub use demux::*;
pub use error::*;
pub use location::*;
pub use message::*;
pub use model::*;
