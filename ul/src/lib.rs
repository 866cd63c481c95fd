//! This crate contains the types and methods needed to interact
//! with DICOM nodes through the upper layer protocol.
//!
//! - The [`pdu`] module
//!   provides the data structures for the protocol data units
//!   passed around as part of DICOM network communication,
//!   with their binary decoder and encoder.
//! - The [`fsm`] module
//!   holds the protocol state machine of PS3.8 section 9.2.
//! - The [`provider`] module
//!   runs the state machine, the transport connection and the timers
//!   of one association on a dedicated thread,
//!   exchanging service primitives with the layers above.
//! - The [`association`] module
//!   comprises the association control service element (ACSE)
//!   and the presentation context negotiation algorithm.
//! - The [`address`] module
//!   provides an abstraction for compound addresses
//!   referring to application entities in a network.
//! - The [`timer`] module
//!   implements the monotonic expiration timers
//!   (ARTIM and the inactivity timeouts) used throughout.

pub mod address;
pub mod association;
pub mod fsm;
pub mod pdu;
pub mod provider;
pub mod queue;
pub mod timer;

/// The implementation class UID of this stack,
/// announced in every association negotiation.
///
/// Generated under the UUID-derived arc as per PS3.5 section B.2.
/// This UID may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.291318477864037465091160615601266904515";

/// The implementation version name of this stack,
/// announced in every association negotiation.
///
/// This name may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_VERSION_NAME: &str = "NETDICOM010";

// re-exports

pub use address::AeAddr;
pub use association::acse::{AcseProvider, AssociateOutcome, AssociateParams};
pub use association::negotiation::{NegotiatedContext, PresentationContext};
pub use association::{validate_ae_title, AssociationStatus};
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
pub use provider::{Primitive, UlProvider, UlProviderOptions};
