//! Presentation context definitions and the negotiation algorithm.

use snafu::{ensure, Backtrace, Snafu};

use crate::pdu::{
    PresentationContextProposed, PresentationContextResult, PresentationContextResultReason,
};

/// The Implicit VR Little Endian transfer syntax,
/// the default every conforming implementation supports.
pub const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Invalid presentation context ID {} (must be odd and non-zero)", id))]
    InvalidContextId { id: u8, backtrace: Backtrace },

    /// a presentation context must propose at least one transfer syntax
    NoTransferSyntaxes { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A presentation context identifier:
/// an odd integer between 1 and 255.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash, Debug)]
pub struct PresentationContextId(u8);

impl PresentationContextId {
    /// Validate a raw identifier. Even values and zero are refused.
    pub fn new(id: u8) -> Result<Self> {
        ensure!(id % 2 == 1, InvalidContextIdSnafu { id });
        Ok(PresentationContextId(id))
    }

    /// The raw identifier value.
    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for PresentationContextId {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        PresentationContextId::new(id)
    }
}

/// A presentation context definition as configured by the user:
/// one abstract syntax
/// paired with the transfer syntaxes admitted for it,
/// in order of preference.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PresentationContext {
    id: PresentationContextId,
    abstract_syntax: String,
    transfer_syntaxes: Vec<String>,
}

impl PresentationContext {
    pub fn new(
        id: u8,
        abstract_syntax: impl Into<String>,
        transfer_syntaxes: Vec<String>,
    ) -> Result<Self> {
        ensure!(!transfer_syntaxes.is_empty(), NoTransferSyntaxesSnafu);
        Ok(PresentationContext {
            id: PresentationContextId::new(id)?,
            abstract_syntax: abstract_syntax.into(),
            transfer_syntaxes,
        })
    }

    pub fn id(&self) -> u8 {
        self.id.value()
    }

    pub fn abstract_syntax(&self) -> &str {
        &self.abstract_syntax
    }

    pub fn transfer_syntaxes(&self) -> &[String] {
        &self.transfer_syntaxes
    }
}

impl From<&PresentationContext> for PresentationContextProposed {
    fn from(context: &PresentationContext) -> Self {
        PresentationContextProposed {
            id: context.id(),
            abstract_syntax: context.abstract_syntax.clone(),
            transfer_syntaxes: context.transfer_syntaxes.clone(),
        }
    }
}

/// A presentation context accorded during negotiation.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct NegotiatedContext {
    /// the presentation context identifier from the proposal
    pub id: u8,
    /// the abstract syntax of the proposal
    pub abstract_syntax: String,
    /// the single accorded transfer syntax
    pub transfer_syntax: String,
}

/// Negotiate the proposed presentation contexts of an association request
/// against the acceptor's supported contexts.
///
/// Contexts are answered in proposal order.
/// For each proposal,
/// the acceptor's transfer syntax preference wins:
/// the first of the acceptor's transfer syntaxes for that abstract syntax
/// which was also proposed is the one accorded.
/// An unknown abstract syntax yields result 3,
/// no transfer syntax in common yields result 4.
/// The outcome is deterministic for the same pair of lists.
pub fn negotiate_presentation_contexts(
    proposed: &[PresentationContextProposed],
    supported: &[PresentationContext],
) -> Vec<PresentationContextResult> {
    proposed
        .iter()
        .map(|proposal| {
            // rejections carry a placeholder transfer syntax,
            // not significant on the wire
            let placeholder = || {
                proposal
                    .transfer_syntaxes
                    .first()
                    .cloned()
                    .unwrap_or_else(|| IMPLICIT_VR_LE.to_string())
            };

            let candidates: Vec<&PresentationContext> = supported
                .iter()
                .filter(|context| context.abstract_syntax == proposal.abstract_syntax)
                .collect();
            if candidates.is_empty() {
                return PresentationContextResult {
                    id: proposal.id,
                    reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                    transfer_syntax: placeholder(),
                };
            }

            // scan the acceptor's transfer syntaxes in preference order
            let accepted = candidates
                .iter()
                .flat_map(|context| context.transfer_syntaxes.iter())
                .find(|ts| proposal.transfer_syntaxes.iter().any(|p| p == *ts));

            match accepted {
                Some(transfer_syntax) => PresentationContextResult {
                    id: proposal.id,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: transfer_syntax.clone(),
                },
                None => PresentationContextResult {
                    id: proposal.id,
                    reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                    transfer_syntax: placeholder(),
                },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    fn proposal(id: u8, abstract_syntax: &str, transfer_syntaxes: &[&str]) -> PresentationContextProposed {
        PresentationContextProposed {
            id,
            abstract_syntax: abstract_syntax.to_string(),
            transfer_syntaxes: transfer_syntaxes.iter().map(|ts| ts.to_string()).collect(),
        }
    }

    fn supported(abstract_syntax: &str, transfer_syntaxes: &[&str]) -> PresentationContext {
        PresentationContext::new(
            1,
            abstract_syntax,
            transfer_syntaxes.iter().map(|ts| ts.to_string()).collect(),
        )
        .unwrap()
    }

    #[test]
    fn context_id_must_be_odd() {
        assert!(PresentationContextId::new(1).is_ok());
        assert!(PresentationContextId::new(255).is_ok());
        assert_matches!(
            PresentationContextId::new(0),
            Err(Error::InvalidContextId { id: 0, .. })
        );
        assert_matches!(
            PresentationContextId::new(2),
            Err(Error::InvalidContextId { id: 2, .. })
        );
    }

    #[test]
    fn accepts_common_transfer_syntax() {
        let results = negotiate_presentation_contexts(
            &[proposal(1, "1.2.840.10008.1.1", &["1.2.840.10008.1.2"])],
            &[supported(
                "1.2.840.10008.1.1",
                &["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"],
            )],
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 1);
        assert_eq!(results[0].reason, PresentationContextResultReason::Acceptance);
        assert_eq!(results[0].transfer_syntax, "1.2.840.10008.1.2");
    }

    #[test]
    fn acceptor_preference_order_wins() {
        // the requestor prefers implicit VR, the acceptor explicit VR
        let results = negotiate_presentation_contexts(
            &[proposal(
                1,
                "1.2.840.10008.1.1",
                &["1.2.840.10008.1.2", "1.2.840.10008.1.2.1"],
            )],
            &[supported(
                "1.2.840.10008.1.1",
                &["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"],
            )],
        );
        assert_eq!(results[0].reason, PresentationContextResultReason::Acceptance);
        assert_eq!(results[0].transfer_syntax, "1.2.840.10008.1.2.1");
    }

    #[test]
    fn unknown_abstract_syntax_yields_result_3() {
        let results = negotiate_presentation_contexts(
            &[proposal(1, "1.2.3.4.5.6", &["1.2.840.10008.1.2"])],
            &[supported("1.2.840.10008.1.1", &["1.2.840.10008.1.2"])],
        );
        assert_eq!(
            results[0].reason,
            PresentationContextResultReason::AbstractSyntaxNotSupported
        );
    }

    #[test]
    fn no_common_transfer_syntax_yields_result_4() {
        let results = negotiate_presentation_contexts(
            &[proposal(1, "1.2.840.10008.1.1", &["1.2.840.10008.1.2.2"])],
            &[supported("1.2.840.10008.1.1", &["1.2.840.10008.1.2"])],
        );
        assert_eq!(
            results[0].reason,
            PresentationContextResultReason::TransferSyntaxesNotSupported
        );
    }

    #[test]
    fn contexts_are_answered_in_proposal_order() {
        let results = negotiate_presentation_contexts(
            &[
                proposal(1, "1.2.840.10008.1.1", &["1.2.840.10008.1.2"]),
                proposal(3, "1.2.3.4.5.6", &["1.2.840.10008.1.2"]),
                proposal(5, "1.2.840.10008.5.1.4.1.1.2", &["1.2.840.10008.1.2"]),
            ],
            &[
                supported("1.2.840.10008.1.1", &["1.2.840.10008.1.2"]),
                supported("1.2.840.10008.5.1.4.1.1.2", &["1.2.840.10008.1.2"]),
            ],
        );
        assert_eq!(results.len(), 3);
        assert_eq!(
            results.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![1, 3, 5]
        );
        assert_eq!(results[0].reason, PresentationContextResultReason::Acceptance);
        assert_eq!(
            results[1].reason,
            PresentationContextResultReason::AbstractSyntaxNotSupported
        );
        assert_eq!(results[2].reason, PresentationContextResultReason::Acceptance);
    }

    #[test]
    fn negotiation_is_deterministic() {
        let proposed = [
            proposal(
                1,
                "1.2.840.10008.1.1",
                &["1.2.840.10008.1.2", "1.2.840.10008.1.2.1"],
            ),
            proposal(3, "1.2.840.10008.5.1.4.1.1.2", &["1.2.840.10008.1.2"]),
        ];
        let acceptor = [
            supported(
                "1.2.840.10008.1.1",
                &["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"],
            ),
            supported("1.2.840.10008.5.1.4.1.1.2", &["1.2.840.10008.1.2"]),
        ];
        let first = negotiate_presentation_contexts(&proposed, &acceptor);
        let second = negotiate_presentation_contexts(&proposed, &acceptor);
        assert_eq!(first, second);
    }
}
