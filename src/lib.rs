#![doc = include_str!("../README.md")]

pub use bytes;

pub use client::*;
pub use model::*;
pub use options::*;
pub use request::*;

pub(crate) mod channel;
pub(crate) mod codec;
pub(crate) mod conn;

pub mod ber;
pub mod client;
pub mod controls;
pub mod error;
pub mod filter;
pub mod message;
pub mod model;
pub mod notify;
pub mod oid;
pub mod ops;
pub mod options;
pub mod referral;
pub mod request;
pub mod socket;
pub mod url;

#[cfg(test)]
mod testing;
