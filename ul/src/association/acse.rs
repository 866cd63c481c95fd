//! The association control service element.
//!
//! [`AcseProvider`] wraps a [`UlProvider`] and turns the raw primitive
//! traffic into the association operations visible to an application:
//! requesting, accepting and rejecting associations,
//! orderly release (including the release collision paths)
//! and aborts.

use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use snafu::{ensure, Backtrace, ResultExt, Snafu};
use tracing::{debug, warn};

use crate::association::negotiation::{NegotiatedContext, PresentationContext};
use crate::association::{validate_ae_title, AssociationStatus, InvalidAeTitle};
use crate::association::APPLICATION_CONTEXT_NAME;
use crate::pdu::{
    AbortRQSource, AssociationAC, AssociationRJ, AssociationRQ, PDataValue,
    PresentationContextResult, PresentationContextResultReason, UserVariableItem,
};
use crate::provider::{Primitive, UlProvider, UlProviderOptions};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not validate an application entity title
    #[snafu(display("invalid application entity title"))]
    BadAeTitle {
        #[snafu(backtrace)]
        source: InvalidAeTitle,
    },

    /// at least one presentation context must be proposed
    MissingPresentationContexts { backtrace: Backtrace },

    /// could not start the service provider
    StartProvider {
        #[snafu(backtrace)]
        source: crate::provider::Error,
    },

    #[snafu(display("timed out after {:?} waiting for the peer", timeout))]
    Timeout {
        timeout: Duration,
        backtrace: Backtrace,
    },

    #[snafu(display("the association was aborted while awaiting a response"))]
    Aborted {
        source_of_abort: AbortRQSource,
        backtrace: Backtrace,
    },

    #[snafu(display("unexpected primitive while awaiting a response"))]
    UnexpectedPrimitive { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Parameters for an A-ASSOCIATE request.
#[derive(Debug, Clone)]
pub struct AssociateParams {
    /// the local AE title
    pub calling_ae_title: String,
    /// the peer AE title
    pub called_ae_title: String,
    /// the maximum PDU length accepted from the peer
    /// (0 for no limit)
    pub max_pdu_length: u32,
    /// the presentation contexts to propose
    pub presentation_contexts: Vec<PresentationContext>,
    /// extra user information sub-items
    /// (extended negotiation, user identity and the like)
    pub user_items: Vec<UserVariableItem>,
}

/// The outcome of an association negotiation.
#[derive(Debug, Clone)]
pub enum AssociateOutcome {
    /// the association is established
    Accepted(NegotiatedParameters),
    /// the peer rejected the association;
    /// result, source and diagnostic are preserved verbatim
    Rejected(AssociationRJ),
    /// the peer or the provider aborted the negotiation
    Aborted(AbortRQSource),
}

/// Everything negotiated on an established association.
#[derive(Debug, Clone, Default)]
pub struct NegotiatedParameters {
    /// the presentation contexts accorded by the acceptor
    pub accepted_contexts: Vec<NegotiatedContext>,
    /// the presentation contexts the acceptor turned down
    pub rejected_contexts: Vec<PresentationContextResult>,
    /// maximum PDU length the peer is willing to receive
    /// (0 for no limit)
    pub peer_max_pdu_length: u32,
    /// implementation class UID announced by the peer
    pub peer_implementation_class_uid: Option<String>,
    /// implementation version name announced by the peer
    pub peer_implementation_version_name: Option<String>,
    /// the asynchronous operations window accorded by the peer,
    /// as (maximum invoked, maximum performed)
    pub async_ops_window: Option<(u16, u16)>,
    /// every user information sub-item of the answer, verbatim
    pub peer_user_variables: Vec<UserVariableItem>,
}

impl NegotiatedParameters {
    fn from_ac(ac: &AssociationAC, requested: &[PresentationContext]) -> Self {
        let mut accepted_contexts = Vec::new();
        let mut rejected_contexts = Vec::new();
        for result in &ac.presentation_contexts {
            if result.reason == PresentationContextResultReason::Acceptance {
                let abstract_syntax = requested
                    .iter()
                    .find(|c| c.id() == result.id)
                    .map(|c| c.abstract_syntax().to_string())
                    .unwrap_or_default();
                accepted_contexts.push(NegotiatedContext {
                    id: result.id,
                    abstract_syntax,
                    transfer_syntax: result.transfer_syntax.clone(),
                });
            } else {
                rejected_contexts.push(result.clone());
            }
        }

        let mut parameters = NegotiatedParameters {
            accepted_contexts,
            rejected_contexts,
            peer_user_variables: ac.user_variables.clone(),
            ..Default::default()
        };
        for item in &ac.user_variables {
            match item {
                UserVariableItem::MaxLength(length) => {
                    parameters.peer_max_pdu_length = *length;
                }
                UserVariableItem::ImplementationClassUID(uid) => {
                    parameters.peer_implementation_class_uid = Some(uid.clone());
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    parameters.peer_implementation_version_name = Some(name.clone());
                }
                UserVariableItem::AsyncOperationsWindow(invoked, performed) => {
                    parameters.async_ops_window = Some((*invoked, *performed));
                }
                _ => {}
            }
        }
        parameters
    }
}

/// The ACSE service for one association.
#[derive(Debug)]
pub struct AcseProvider {
    provider: UlProvider,
    requestor: bool,
    acse_timeout: Option<Duration>,
    status: AssociationStatus,
}

impl AcseProvider {
    /// Create the ACSE service in association requestor mode.
    pub fn new_requestor(
        peer: SocketAddr,
        options: UlProviderOptions,
        acse_timeout: Option<Duration>,
    ) -> Result<Self> {
        let provider = UlProvider::connect(peer, options).context(StartProviderSnafu)?;
        Ok(AcseProvider {
            provider,
            requestor: true,
            acse_timeout,
            status: AssociationStatus::Idle,
        })
    }

    /// Create the ACSE service in association acceptor mode,
    /// over an accepted transport connection.
    pub fn new_acceptor(
        stream: TcpStream,
        options: UlProviderOptions,
        acse_timeout: Option<Duration>,
    ) -> Result<Self> {
        let provider = UlProvider::from_stream(stream, options).context(StartProviderSnafu)?;
        Ok(AcseProvider {
            provider,
            requestor: false,
            acse_timeout,
            status: AssociationStatus::Idle,
        })
    }

    /// The lifecycle status of the association.
    pub fn status(&self) -> AssociationStatus {
        self.status
    }

    /// Whether this side requested the association.
    pub fn is_requestor(&self) -> bool {
        self.requestor
    }

    /// Request an association with the given parameters
    /// and wait for the peer's answer.
    pub fn request(&mut self, params: AssociateParams) -> Result<AssociateOutcome> {
        ensure!(
            !params.presentation_contexts.is_empty(),
            MissingPresentationContextsSnafu
        );
        let calling_ae_title =
            validate_ae_title(&params.calling_ae_title).context(BadAeTitleSnafu)?;
        let called_ae_title =
            validate_ae_title(&params.called_ae_title).context(BadAeTitleSnafu)?;

        let mut user_variables = vec![
            UserVariableItem::MaxLength(params.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        user_variables.extend(params.user_items.iter().cloned());

        let request = AssociationRQ {
            protocol_version: 1,
            calling_ae_title,
            called_ae_title,
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: params
                .presentation_contexts
                .iter()
                .map(Into::into)
                .collect(),
            user_variables,
        };

        self.provider.send(Primitive::AssociateRq(request));
        self.status = AssociationStatus::Requested;

        let answer = match self.wait_for_primitive() {
            Ok(answer) => answer,
            Err(e) => {
                // no answer in time: tear the association down
                // before reporting the failure
                self.abort(AbortRQSource::ServiceProvider(
                    crate::pdu::AbortRQServiceProviderReason::ReasonNotSpecified,
                ));
                return Err(e);
            }
        };

        match answer {
            Primitive::AssociateAc(ac) => {
                let negotiated =
                    NegotiatedParameters::from_ac(&ac, &params.presentation_contexts);
                self.status = AssociationStatus::Established;
                Ok(AssociateOutcome::Accepted(negotiated))
            }
            Primitive::AssociateRj(rj) => {
                self.status = AssociationStatus::Rejected;
                Ok(AssociateOutcome::Rejected(rj))
            }
            Primitive::Abort { source } => {
                self.status = AssociationStatus::Aborted;
                Ok(AssociateOutcome::Aborted(source))
            }
            other => {
                warn!("unexpected answer to association request: {:?}", other);
                UnexpectedPrimitiveSnafu.fail()
            }
        }
    }

    /// Wait for an inbound association request (acceptor side).
    pub fn wait_for_request(&mut self) -> Result<AssociationRQ> {
        match self.wait_for_primitive()? {
            Primitive::AssociateRq(request) => {
                self.status = AssociationStatus::Requested;
                Ok(request)
            }
            Primitive::Abort { source } => {
                self.status = AssociationStatus::Aborted;
                AbortedSnafu {
                    source_of_abort: source,
                }
                .fail()
            }
            other => {
                warn!("expected an association request, got {:?}", other);
                UnexpectedPrimitiveSnafu.fail()
            }
        }
    }

    /// Answer an association request positively (acceptor side).
    ///
    /// The caller provides the fully negotiated response contents;
    /// see [`negotiate_presentation_contexts`]
    /// for completing the context results.
    ///
    /// [`negotiate_presentation_contexts`]:
    /// crate::association::negotiation::negotiate_presentation_contexts
    pub fn accept(&mut self, response: AssociationAC) {
        self.provider.send(Primitive::AssociateAc(response));
        self.status = AssociationStatus::Established;
    }

    /// Answer an association request negatively (acceptor side).
    ///
    /// A short grace period lets the provider put the rejection
    /// on the wire before the caller tears the association down.
    pub fn reject(&mut self, rejection: AssociationRJ) {
        self.provider.send(Primitive::AssociateRj(rejection));
        self.status = AssociationStatus::Rejected;
        std::thread::sleep(Duration::from_millis(50));
    }

    /// Release the association in an orderly manner
    /// and wait for the peer's release response.
    ///
    /// Releasing an association that is not established
    /// is a no-op.
    /// Release collisions are resolved per the standard:
    /// both sides still end with an orderly release.
    pub fn release(&mut self) -> Result<()> {
        if self.status != AssociationStatus::Established {
            return Ok(());
        }

        self.provider.send(Primitive::ReleaseRq);

        // on a release collision the association acceptor must wait for
        // the peer's release response before sending its own
        let mut collision = false;
        loop {
            match self.wait_for_primitive() {
                Ok(Primitive::ReleaseRp) => {
                    if collision && !self.requestor {
                        self.provider.send(Primitive::ReleaseRp);
                    }
                    self.status = AssociationStatus::Released;
                    return Ok(());
                }
                Ok(Primitive::ReleaseRq) => {
                    debug!("release collision detected");
                    collision = true;
                    if self.requestor {
                        self.provider.send(Primitive::ReleaseRp);
                    }
                }
                Ok(Primitive::PData(_)) => {
                    // data arriving after the release request is
                    // of no use to anyone at this point
                    warn!("discarding P-DATA received during release");
                }
                Ok(Primitive::Abort { source }) => {
                    self.status = AssociationStatus::Aborted;
                    return AbortedSnafu {
                        source_of_abort: source,
                    }
                    .fail();
                }
                Ok(other) => {
                    warn!("unexpected primitive during release: {:?}", other);
                    return UnexpectedPrimitiveSnafu.fail();
                }
                Err(e) => {
                    // give up on the peer
                    self.abort(AbortRQSource::ServiceUser);
                    return Err(e);
                }
            }
        }
    }

    /// Abort the association.
    ///
    /// The abort is not confirmed;
    /// a short grace period gives the provider a chance
    /// to put the PDU on the wire before the association
    /// is considered terminated.
    pub fn abort(&mut self, source: AbortRQSource) {
        self.provider.send(Primitive::Abort { source });
        self.status = AssociationStatus::Aborted;
        std::thread::sleep(Duration::from_millis(50));
    }

    /// Non-blocking check for an inbound release request.
    ///
    /// When one is found, the release response is emitted
    /// and `true` is returned.
    /// Data primitives ahead of the peek point are left untouched.
    pub fn check_release(&mut self) -> bool {
        match self.provider.peek() {
            Some(Primitive::ReleaseRq) => {
                let _ = self.provider.try_receive();
                self.respond_release();
                true
            }
            _ => false,
        }
    }

    /// Answer a release indication that was already consumed,
    /// completing the orderly release on this side.
    ///
    /// A short grace period lets the provider put the response
    /// on the wire before the caller tears the association down.
    pub fn respond_release(&mut self) {
        self.provider.send(Primitive::ReleaseRp);
        self.status = AssociationStatus::Released;
        std::thread::sleep(Duration::from_millis(50));
    }

    /// Non-blocking check for an inbound abort.
    ///
    /// When one is found, it is consumed and its source is returned.
    pub fn check_abort(&mut self) -> Option<AbortRQSource> {
        match self.provider.peek() {
            Some(Primitive::Abort { .. }) => match self.provider.try_receive() {
                Some(Primitive::Abort { source }) => {
                    self.status = AssociationStatus::Aborted;
                    Some(source)
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// Send one P-DATA request over the association.
    pub fn send_pdata(&self, data: Vec<PDataValue>) {
        self.provider.send(Primitive::PData(data));
    }

    /// Receive the next primitive,
    /// waiting up to `timeout` (indefinitely when `None`).
    pub fn receive(&self, timeout: Option<Duration>) -> Option<Primitive> {
        self.provider.receive(timeout)
    }

    /// Take the next primitive if one was already delivered.
    pub fn try_receive(&self) -> Option<Primitive> {
        self.provider.try_receive()
    }

    /// Look at the next delivered primitive without consuming it.
    pub fn peek(&self) -> Option<Primitive> {
        self.provider.peek()
    }

    /// The current state of the protocol machine.
    pub fn state(&self) -> crate::fsm::State {
        self.provider.state()
    }

    /// Hard-stop the underlying provider.
    pub fn kill(&mut self) {
        self.provider.kill();
    }

    fn wait_for_primitive(&self) -> Result<Primitive> {
        match self.provider.receive(self.acse_timeout) {
            Some(primitive) => Ok(primitive),
            None => TimeoutSnafu {
                timeout: self.acse_timeout.unwrap_or_default(),
            }
            .fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::negotiation::negotiate_presentation_contexts;
    use crate::fsm::State;
    use std::net::TcpListener;

    fn verification_context() -> PresentationContext {
        PresentationContext::new(
            1,
            "1.2.840.10008.1.1",
            vec!["1.2.840.10008.1.2".to_string()],
        )
        .unwrap()
    }

    fn serve_one_association(listener: TcpListener, supported: Vec<PresentationContext>) {
        let (stream, _) = listener.accept().unwrap();
        let mut acse = AcseProvider::new_acceptor(
            stream,
            UlProviderOptions::default(),
            Some(Duration::from_secs(5)),
        )
        .unwrap();

        let request = acse.wait_for_request().unwrap();
        let results =
            negotiate_presentation_contexts(&request.presentation_contexts, &supported);
        acse.accept(AssociationAC {
            protocol_version: 1,
            called_ae_title: request.called_ae_title.clone(),
            calling_ae_title: request.calling_ae_title.clone(),
            application_context_name: request.application_context_name.clone(),
            presentation_contexts: results,
            user_variables: vec![
                UserVariableItem::MaxLength(16_384),
                UserVariableItem::ImplementationClassUID(
                    IMPLEMENTATION_CLASS_UID.to_string(),
                ),
            ],
        });

        // wait for the release and answer it
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if acse.check_release() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("peer never released");
    }

    #[test]
    fn associate_accept_and_release() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server_addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            serve_one_association(listener, vec![verification_context()])
        });

        let mut acse = AcseProvider::new_requestor(
            server_addr,
            UlProviderOptions::default(),
            Some(Duration::from_secs(5)),
        )
        .unwrap();

        let outcome = acse
            .request(AssociateParams {
                calling_ae_title: "ECHO-SCU".to_string(),
                called_ae_title: "ECHO-SCP".to_string(),
                max_pdu_length: 16_384,
                presentation_contexts: vec![verification_context()],
                user_items: vec![],
            })
            .unwrap();

        match outcome {
            AssociateOutcome::Accepted(negotiated) => {
                assert_eq!(negotiated.accepted_contexts.len(), 1);
                assert_eq!(negotiated.accepted_contexts[0].id, 1);
                assert_eq!(
                    negotiated.accepted_contexts[0].abstract_syntax,
                    "1.2.840.10008.1.1"
                );
                assert_eq!(
                    negotiated.accepted_contexts[0].transfer_syntax,
                    "1.2.840.10008.1.2"
                );
                assert_eq!(negotiated.peer_max_pdu_length, 16_384);
            }
            other => panic!("Expected acceptance, got {:?}", other),
        }
        assert_eq!(acse.status(), AssociationStatus::Established);

        acse.release().unwrap();
        assert_eq!(acse.status(), AssociationStatus::Released);
        server.join().unwrap();

        // both sides end in the idle state
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while acse.state() != State::Sta1 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(acse.state(), State::Sta1);
    }

    #[test]
    fn unsupported_abstract_syntax_is_rejected_in_context_results() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server_addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            // the SCP only knows verification
            serve_one_association(listener, vec![verification_context()])
        });

        let unknown_context = PresentationContext::new(
            1,
            "1.2.3.4.5.6",
            vec!["1.2.840.10008.1.2".to_string()],
        )
        .unwrap();

        let mut acse = AcseProvider::new_requestor(
            server_addr,
            UlProviderOptions::default(),
            Some(Duration::from_secs(5)),
        )
        .unwrap();

        let outcome = acse
            .request(AssociateParams {
                calling_ae_title: "FIND-SCU".to_string(),
                called_ae_title: "FIND-SCP".to_string(),
                max_pdu_length: 16_384,
                presentation_contexts: vec![unknown_context],
                user_items: vec![],
            })
            .unwrap();

        match outcome {
            AssociateOutcome::Accepted(negotiated) => {
                // the association stands, but the context was refused
                assert!(negotiated.accepted_contexts.is_empty());
                assert_eq!(negotiated.rejected_contexts.len(), 1);
                assert_eq!(
                    negotiated.rejected_contexts[0].reason,
                    PresentationContextResultReason::AbstractSyntaxNotSupported
                );
            }
            other => panic!("Expected acceptance with refused context, got {:?}", other),
        }

        acse.release().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn rejection_is_surfaced_verbatim() {
        use crate::pdu::{AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource};

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server_addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut acse = AcseProvider::new_acceptor(
                stream,
                UlProviderOptions::default(),
                Some(Duration::from_secs(5)),
            )
            .unwrap();
            let _request = acse.wait_for_request().unwrap();
            acse.reject(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized,
                ),
            });
            // give the provider time to flush before the thread ends
            std::thread::sleep(Duration::from_millis(100));
        });

        let mut acse = AcseProvider::new_requestor(
            server_addr,
            UlProviderOptions::default(),
            Some(Duration::from_secs(5)),
        )
        .unwrap();

        let outcome = acse
            .request(AssociateParams {
                calling_ae_title: "ECHO-SCU".to_string(),
                called_ae_title: "NOT-A-REAL-SCP".to_string(),
                max_pdu_length: 16_384,
                presentation_contexts: vec![verification_context()],
                user_items: vec![],
            })
            .unwrap();

        match outcome {
            AssociateOutcome::Rejected(rejection) => {
                assert_eq!(rejection.result, AssociationRJResult::Permanent);
                assert_eq!(
                    rejection.source,
                    AssociationRJSource::ServiceUser(
                        AssociationRJServiceUserReason::CalledAETitleNotRecognized,
                    )
                );
            }
            other => panic!("Expected rejection, got {:?}", other),
        }
        assert_eq!(acse.status(), AssociationStatus::Rejected);
        server.join().unwrap();
    }

    #[test]
    fn empty_context_list_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server_addr = listener.local_addr().unwrap();

        let mut acse = AcseProvider::new_requestor(
            server_addr,
            UlProviderOptions::default(),
            Some(Duration::from_secs(1)),
        )
        .unwrap();
        let result = acse.request(AssociateParams {
            calling_ae_title: "ECHO-SCU".to_string(),
            called_ae_title: "ECHO-SCP".to_string(),
            max_pdu_length: 16_384,
            presentation_contexts: vec![],
            user_items: vec![],
        });
        assert!(matches!(
            result,
            Err(Error::MissingPresentationContexts { .. })
        ));
        drop(listener);
    }
}
