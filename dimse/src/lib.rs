//! DICOM message service element (DIMSE) support
//! on top of the upper layer protocol of [`netdicom_ul`].
//!
//! - The [`commands`] module holds the command set dictionary
//!   and the command field codes.
//! - The [`cmdset`] module implements the Implicit VR Little Endian
//!   command set codec.
//! - The [`params`] module defines the service parameters of every
//!   DIMSE service, with their command set mapping.
//! - The [`status`] module classifies and validates status codes.
//! - The [`message`] module frames messages into presentation data
//!   values and reassembles them on receive.
//! - The [`service`] module drives messages over an established
//!   association, applying the DIMSE timeout.
//! - The [`ae`] module provides the application entity:
//!   the acceptor accept loop with its service callbacks,
//!   and the requestor [`Association`](ae::Association)
//!   with the DIMSE-C operations.
//!
//! # Example
//!
//! A minimal verification (C-ECHO) provider and a matching user:
//!
//! ```no_run
//! # use std::sync::Arc;
//! use netdicom_dimse::ae::{ApplicationEntity, ServiceHandlers};
//! use netdicom_ul::PresentationContext;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! struct Verification;
//! impl ServiceHandlers for Verification {}
//!
//! let verification = PresentationContext::new(
//!     1,
//!     "1.2.840.10008.1.1",
//!     vec!["1.2.840.10008.1.2".to_string()],
//! )?;
//!
//! let scp = ApplicationEntity::new("ECHO-SCP")?
//!     .port(11112)
//!     .with_supported_context(verification.clone())
//!     .start(Arc::new(Verification))?;
//!
//! let mut association = ApplicationEntity::new("ECHO-SCU")?
//!     .with_requested_context(verification)
//!     .associate("ECHO-SCP@127.0.0.1:11112".parse::<netdicom_ul::AeAddr>()?)?;
//! let status = association.echo()?;
//! assert!(status.is_success());
//! association.release()?;
//! # Ok(())
//! # }
//! ```

pub mod ae;
pub mod cmdset;
pub mod commands;
pub mod message;
pub mod params;
pub mod service;
pub mod status;

#[cfg(test)]
mod tests;

// re-exports

pub use ae::{ApplicationEntity, Association, ServiceContext, ServiceHandlers};
pub use commands::CommandField;
pub use params::{DimseMessage, Priority};
pub use status::{Status, StatusClass};
