//! The DIMSE service: messages over an established association.
//!
//! [`DimseService`] owns the ACSE provider of one association and
//! translates between [`DimseMessage`] values and the P-DATA
//! primitive traffic underneath,
//! applying the DIMSE timeout between PDV arrivals.

use std::time::Duration;

use snafu::{ensure, Backtrace, ResultExt, Snafu};
use tracing::{debug, warn};

use netdicom_ul::association::acse::AcseProvider;
use netdicom_ul::pdu::AbortRQSource;
use netdicom_ul::provider::Primitive;

use crate::message::{fragment_message, MessageAssembler, RawMessage};
use crate::params::DimseMessage;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not serialize the message parameters
    #[snafu(display("could not serialize message"))]
    Serialize {
        #[snafu(backtrace)]
        source: crate::params::Error,
    },

    /// could not rebuild message parameters from the wire form
    #[snafu(display("malformed incoming message"))]
    Deserialize {
        #[snafu(backtrace)]
        source: crate::params::Error,
    },

    /// could not encode the command set
    #[snafu(display("could not encode command set"))]
    Encode {
        #[snafu(backtrace)]
        source: crate::cmdset::Error,
    },

    /// message framing failed
    #[snafu(display("message framing failed"))]
    Fragment {
        #[snafu(backtrace)]
        source: crate::message::Error,
    },

    /// reassembly of an incoming message failed
    #[snafu(display("message reassembly failed"))]
    Reassemble {
        #[snafu(backtrace)]
        source: crate::message::Error,
    },

    #[snafu(display("no message arrived within {:?}", timeout))]
    Timeout {
        timeout: Duration,
        backtrace: Backtrace,
    },

    /// the peer requested an orderly release
    PeerReleased { backtrace: Backtrace },

    /// the association was aborted
    #[snafu(display("the association was aborted"))]
    Aborted {
        source_of_abort: AbortRQSource,
        backtrace: Backtrace,
    },

    /// a second operation was invoked while one is in flight
    /// and no wider asynchronous operations window was negotiated
    OperationInFlight { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The DIMSE message service over one association.
#[derive(Debug)]
pub struct DimseService {
    acse: AcseProvider,
    dimse_timeout: Option<Duration>,
    /// maximum PDU length announced by the peer (0 for no limit)
    peer_max_pdu_length: u32,
    /// maximum number of operations this node may invoke
    /// without awaiting a response
    max_invoked: u16,
    /// message ID of the operation awaiting its final response
    inflight: Option<u16>,
    assembler: MessageAssembler,
    /// total PDV fragments consumed, for inactivity tracking
    fragments: u64,
}

impl DimseService {
    /// Wrap an established association.
    ///
    /// `max_invoked` comes from asynchronous operations window
    /// negotiation; without the item it is 1.
    pub fn new(
        acse: AcseProvider,
        dimse_timeout: Option<Duration>,
        peer_max_pdu_length: u32,
        max_invoked: u16,
    ) -> Self {
        DimseService {
            acse,
            dimse_timeout,
            peer_max_pdu_length,
            max_invoked,
            inflight: None,
            assembler: MessageAssembler::new(),
            fragments: 0,
        }
    }

    /// The number of PDV fragments consumed so far.
    ///
    /// Monotonically increasing;
    /// a caller polling with [`try_receive`](Self::try_receive)
    /// compares readings to detect reassembly progress
    /// when applying the DIMSE timeout.
    pub fn fragment_count(&self) -> u64 {
        self.fragments
    }

    /// Whether a message is currently half assembled.
    pub fn is_assembling(&self) -> bool {
        self.assembler.in_progress()
    }

    /// The configured DIMSE timeout.
    pub fn dimse_timeout(&self) -> Option<Duration> {
        self.dimse_timeout
    }

    /// Access the underlying ACSE provider.
    pub fn acse(&mut self) -> &mut AcseProvider {
        &mut self.acse
    }

    /// Send a message over the given presentation context.
    pub fn send(&mut self, presentation_context_id: u8, message: &DimseMessage) -> Result<()> {
        // C-CANCEL addresses the operation in flight and is exempt
        if message.is_request() && message.command_field() != crate::commands::CommandField::CCancelRq
        {
            // only this many operations may be outstanding;
            // anything beyond needs asynchronous operations negotiation
            ensure!(
                self.inflight.is_none() || self.max_invoked > 1,
                OperationInFlightSnafu
            );
            if self.inflight.is_none() {
                self.inflight = Some(message.message_id());
            }
        }

        let command_bytes = message
            .to_command_set()
            .context(SerializeSnafu)?
            .encode()
            .context(EncodeSnafu)?;
        let pdus = fragment_message(
            presentation_context_id,
            &command_bytes,
            message.dataset(),
            self.peer_max_pdu_length,
        )
        .context(FragmentSnafu)?;

        debug!(
            "sending {:?} over context {} in {} PDUs",
            message.command_field(),
            presentation_context_id,
            pdus.len()
        );
        for pdvs in pdus {
            self.acse.send_pdata(pdvs);
        }
        Ok(())
    }

    /// Receive the next complete message.
    ///
    /// The DIMSE timeout bounds the wait between successive PDV
    /// arrivals once assembly has begun;
    /// its expiration aborts the association.
    pub fn receive(&mut self) -> Result<(u8, DimseMessage)> {
        let raw = self.receive_raw()?;
        let message = DimseMessage::from_command_set(&raw.command_set, raw.dataset)
            .context(DeserializeSnafu)?;
        if !message.is_request() {
            // a final response clears the operation in flight
            if message.status().map(|s| s.is_final()).unwrap_or(true)
                && self.inflight == Some(message.message_id())
            {
                self.inflight = None;
            }
        }
        Ok((raw.presentation_context_id, message))
    }

    /// Receive a complete message only if its fragments
    /// are already queued. Never blocks.
    ///
    /// Used to poll for C-CANCEL requests while streaming responses.
    pub fn try_receive(&mut self) -> Result<Option<(u8, DimseMessage)>> {
        loop {
            match self.acse.peek() {
                Some(Primitive::PData(_)) => {
                    let pdvs = match self.acse.try_receive() {
                        Some(Primitive::PData(pdvs)) => pdvs,
                        _ => return Ok(None),
                    };
                    if let Some(raw) = self.feed_pdvs(pdvs)? {
                        let message =
                            DimseMessage::from_command_set(&raw.command_set, raw.dataset)
                                .context(DeserializeSnafu)?;
                        return Ok(Some((raw.presentation_context_id, message)));
                    }
                }
                _ => return Ok(None),
            }
        }
    }

    fn receive_raw(&mut self) -> Result<RawMessage> {
        loop {
            match self.acse.receive(self.dimse_timeout) {
                Some(Primitive::PData(pdvs)) => {
                    if let Some(raw) = self.feed_pdvs(pdvs)? {
                        return Ok(raw);
                    }
                }
                Some(Primitive::ReleaseRq) => {
                    if self.assembler.in_progress() {
                        warn!("peer requested release in the middle of a message");
                        self.assembler.clear();
                    }
                    return PeerReleasedSnafu.fail();
                }
                Some(Primitive::Abort { source }) => {
                    // partial reassembly state dies with the association
                    self.assembler.clear();
                    return AbortedSnafu {
                        source_of_abort: source,
                    }
                    .fail();
                }
                Some(other) => {
                    warn!("unexpected primitive while awaiting a message: {:?}", other);
                }
                None => {
                    let timeout = self.dimse_timeout.unwrap_or_default();
                    // the DIMSE layer gives up on the association
                    self.acse
                        .abort(AbortRQSource::ServiceProvider(
                            netdicom_ul::pdu::AbortRQServiceProviderReason::ReasonNotSpecified,
                        ));
                    self.assembler.clear();
                    return TimeoutSnafu { timeout }.fail();
                }
            }
        }
    }

    fn feed_pdvs(&mut self, pdvs: Vec<netdicom_ul::pdu::PDataValue>) -> Result<Option<RawMessage>> {
        let mut complete = None;
        for pdv in pdvs {
            self.fragments += 1;
            if let Some(raw) = self.assembler.push(pdv).context(ReassembleSnafu)? {
                complete = Some(raw);
            }
        }
        Ok(complete)
    }
}

impl DimseService {
    /// Non-blocking check for a release request from the peer,
    /// answering it when found.
    pub fn check_release(&mut self) -> bool {
        self.acse.check_release()
    }

    /// Non-blocking check for an abort from the peer.
    pub fn check_abort(&mut self) -> Option<AbortRQSource> {
        let aborted = self.acse.check_abort();
        if aborted.is_some() {
            self.assembler.clear();
        }
        aborted
    }
}
