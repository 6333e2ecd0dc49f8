//! # courier-types
//!
//! Wire format types for the Courier message relay.
//!
//! This crate provides the foundational types shared by the relay server and
//! client implementations:
//! - [`UserId`], [`DeviceId`], [`Identity`] - Identity types addressing one
//!   logical client session
//! - [`Frame`] - The wire message envelope with routing metadata
//! - [`PreKeyBundle`] - Opaque key material published per device
//! - [`WireError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod frame;
mod ids;

pub use error::WireError;
pub use frame::{Frame, PreKeyBundle};
pub use ids::{DeviceId, Identity, UserId};
