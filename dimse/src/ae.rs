//! The application entity.
//!
//! [`ApplicationEntity`] is the lifecycle container tying the lower
//! layers together:
//! as an acceptor it listens for inbound associations and dispatches
//! requests to the registered [`ServiceHandlers`];
//! as a requestor it establishes outbound [`Association`]s exposing
//! the DIMSE-C operations to the caller.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use tracing::{debug, info, warn};

use netdicom_ul::association::acse::{
    AcseProvider, AssociateOutcome, AssociateParams, NegotiatedParameters,
};
use netdicom_ul::association::negotiation::{
    negotiate_presentation_contexts, NegotiatedContext, PresentationContext,
};
use netdicom_ul::association::{validate_ae_title, InvalidAeTitle};
use netdicom_ul::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ,
    AssociationRJResult, AssociationRJServiceUserReason,
    AssociationRJServiceProviderPresentationReason, AssociationRJSource, UserVariableItem,
};
use netdicom_ul::provider::UlProviderOptions;
use netdicom_ul::AeAddr;
use netdicom_ul::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use crate::params::{
    CCancelRq, CEchoRq, CEchoRsp, CFindRq, CFindRsp, CGetRq, CGetRsp, CMoveRq, CMoveRsp,
    CStoreRq, CStoreRsp, DimseMessage, NCreateRsp, NDeleteRsp, NEventReportRsp, NGetRsp,
    NSetRsp, NActionRsp, Priority,
};
use crate::service::{self, DimseService};
use crate::status::Status;

/// The default maximum PDU length announced by an application entity.
pub const DEFAULT_MAX_PDU_SIZE: u32 = 16_382;

/// The largest admitted number of requested presentation contexts.
pub const MAX_REQUESTED_CONTEXTS: usize = 128;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// the application entity title is invalid
    #[snafu(display("invalid application entity title"))]
    BadAeTitle {
        #[snafu(backtrace)]
        source: InvalidAeTitle,
    },

    #[snafu(display("{} requested contexts exceed the maximum of {}", count, MAX_REQUESTED_CONTEXTS))]
    TooManyRequestedContexts { count: usize, backtrace: Backtrace },

    /// at least one association must be allowed
    ZeroMaximumAssociations { backtrace: Backtrace },

    /// no presentation contexts were supplied for the association
    NoPresentationContexts { backtrace: Backtrace },

    /// could not bind the listening socket
    Bind {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not spawn the accept loop thread
    SpawnAcceptLoop {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// association control failed
    #[snafu(display("association control failed"))]
    Acse {
        #[snafu(backtrace)]
        source: netdicom_ul::association::acse::Error,
    },

    /// the peer rejected the association
    #[snafu(display("association rejected by the peer"))]
    Rejected {
        rejection: AssociationRJ,
        backtrace: Backtrace,
    },

    /// the association was aborted
    #[snafu(display("the association was aborted"))]
    AssociationAborted {
        source_of_abort: AbortRQSource,
        backtrace: Backtrace,
    },

    /// the peer accepted none of the proposed presentation contexts
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    #[snafu(display("no accepted presentation context for {}", abstract_syntax))]
    NoSuitableContext {
        abstract_syntax: String,
        backtrace: Backtrace,
    },

    /// the DIMSE exchange failed
    #[snafu(display("DIMSE exchange failed"))]
    Dimse {
        #[snafu(backtrace)]
        source: service::Error,
    },

    /// the peer answered with an unrelated message
    UnexpectedMessage { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One storage sub-operation of a C-GET or C-MOVE.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct SubOperation {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    /// the encoded data set to store
    pub dataset: Vec<u8>,
}

/// The handle a C-FIND handler returns:
/// pulled for responses until a terminal status is produced.
pub trait QueryResponses: Send {
    /// The next response.
    /// A pending status continues the operation;
    /// anything else (or `None`, treated as success) terminates it.
    fn next_response(&mut self) -> Option<(Status, Option<Vec<u8>>)>;

    /// Called when a C-CANCEL arrives for the operation.
    fn cancel(&mut self) {}
}

impl QueryResponses for std::vec::IntoIter<(Status, Option<Vec<u8>>)> {
    fn next_response(&mut self) -> Option<(Status, Option<Vec<u8>>)> {
        self.next()
    }
}

/// The handle a C-GET or C-MOVE handler returns:
/// the announced number of sub-operations,
/// then the sub-operations themselves.
pub trait SubOperations: Send {
    /// How many sub-operations are left.
    fn remaining(&self) -> u16;

    /// The next sub-operation to perform.
    fn next_sub_operation(&mut self) -> Option<SubOperation>;

    /// Called when a C-CANCEL arrives for the operation.
    fn cancel(&mut self) {}
}

/// A [`SubOperations`] implementation over a prepared list.
#[derive(Debug, Default)]
pub struct SubOperationQueue {
    items: std::collections::VecDeque<SubOperation>,
}

impl SubOperationQueue {
    pub fn new(items: Vec<SubOperation>) -> Self {
        SubOperationQueue {
            items: items.into(),
        }
    }
}

impl From<Vec<SubOperation>> for SubOperationQueue {
    fn from(items: Vec<SubOperation>) -> Self {
        SubOperationQueue::new(items)
    }
}

impl SubOperations for SubOperationQueue {
    fn remaining(&self) -> u16 {
        self.items.len() as u16
    }

    fn next_sub_operation(&mut self) -> Option<SubOperation> {
        self.items.pop_front()
    }
}

/// Identification and message details handed to every SCP callback.
#[derive(Clone, Debug)]
pub struct ServiceContext {
    /// the AE title of the requestor
    pub calling_ae_title: String,
    /// the AE title the requestor addressed
    pub called_ae_title: String,
    /// the network address of the requestor
    pub peer_address: SocketAddr,
    /// the presentation context of the message
    pub presentation_context: NegotiatedContext,
    /// the message ID of the request
    pub message_id: u16,
    /// the priority of the request, for composite operations
    pub priority: Option<Priority>,
    /// for C-STORE: the C-MOVE originator, when the store
    /// is a sub-operation
    pub move_originator_ae_title: Option<String>,
    pub move_originator_message_id: Option<u16>,
}

/// The service callbacks of an acceptor application entity.
///
/// Every DIMSE service has a default implementation
/// answering "SOP class not supported",
/// so a provider only implements what it serves.
#[allow(unused_variables)]
pub trait ServiceHandlers: Send + Sync {
    /// C-ECHO: answer a verification request.
    fn on_c_echo(&self, ctx: &ServiceContext) -> Status {
        Status::SUCCESS
    }

    /// C-STORE: store the data set and answer a status.
    fn on_c_store(&self, dataset: Vec<u8>, ctx: &ServiceContext) -> Status {
        Status::SOP_CLASS_NOT_SUPPORTED
    }

    /// C-FIND: produce the matches for the query identifier.
    fn on_c_find(&self, identifier: Vec<u8>, ctx: &ServiceContext) -> Box<dyn QueryResponses> {
        let unsupported: Vec<(Status, Option<Vec<u8>>)> =
            vec![(Status::SOP_CLASS_NOT_SUPPORTED, None)];
        Box::new(unsupported.into_iter())
    }

    /// C-GET: produce the storage sub-operations for the identifier,
    /// to be sent back over the same association.
    fn on_c_get(&self, identifier: Vec<u8>, ctx: &ServiceContext) -> Box<dyn SubOperations> {
        Box::new(SubOperationQueue::default())
    }

    /// C-MOVE: name the destination for the identifier
    /// and produce the storage sub-operations to send there.
    /// A `None` destination means the destination is unknown.
    fn on_c_move(
        &self,
        identifier: Vec<u8>,
        ctx: &ServiceContext,
    ) -> (Option<(String, u16)>, Box<dyn SubOperations>) {
        (None, Box::new(SubOperationQueue::default()))
    }

    /// N-EVENT-REPORT: handle an event report.
    fn on_n_event_report(
        &self,
        message: &crate::params::NEventReportRq,
        ctx: &ServiceContext,
    ) -> (Status, Option<Vec<u8>>) {
        (Status::SOP_CLASS_NOT_SUPPORTED, None)
    }

    /// N-GET: retrieve attribute values.
    fn on_n_get(
        &self,
        message: &crate::params::NGetRq,
        ctx: &ServiceContext,
    ) -> (Status, Option<Vec<u8>>) {
        (Status::SOP_CLASS_NOT_SUPPORTED, None)
    }

    /// N-SET: modify attribute values.
    fn on_n_set(
        &self,
        message: &crate::params::NSetRq,
        ctx: &ServiceContext,
    ) -> (Status, Option<Vec<u8>>) {
        (Status::SOP_CLASS_NOT_SUPPORTED, None)
    }

    /// N-ACTION: perform an action.
    fn on_n_action(
        &self,
        message: &crate::params::NActionRq,
        ctx: &ServiceContext,
    ) -> (Status, Option<Vec<u8>>) {
        (Status::SOP_CLASS_NOT_SUPPORTED, None)
    }

    /// N-CREATE: create a managed SOP instance.
    fn on_n_create(
        &self,
        message: &crate::params::NCreateRq,
        ctx: &ServiceContext,
    ) -> (Status, Option<Vec<u8>>) {
        (Status::SOP_CLASS_NOT_SUPPORTED, None)
    }

    /// N-DELETE: delete a managed SOP instance.
    fn on_n_delete(
        &self,
        message: &crate::params::NDeleteRq,
        ctx: &ServiceContext,
    ) -> Status {
        Status::SOP_CLASS_NOT_SUPPORTED
    }
}

/// An application entity:
/// the configured identity and capabilities of this DICOM node.
#[derive(Clone, Debug)]
pub struct ApplicationEntity {
    ae_title: String,
    port: u16,
    maximum_associations: usize,
    maximum_pdu_size: u32,
    acse_timeout: Option<Duration>,
    dimse_timeout: Option<Duration>,
    network_timeout: Option<Duration>,
    require_calling_aet: String,
    require_called_aet: String,
    requested_contexts: Vec<PresentationContext>,
    supported_contexts: Vec<PresentationContext>,
}

impl ApplicationEntity {
    /// Create an application entity with the given title
    /// and the default configuration.
    pub fn new(ae_title: impl AsRef<str>) -> Result<Self> {
        Ok(ApplicationEntity {
            ae_title: validate_ae_title(ae_title.as_ref()).context(BadAeTitleSnafu)?,
            port: 0,
            maximum_associations: 2,
            maximum_pdu_size: DEFAULT_MAX_PDU_SIZE,
            acse_timeout: Some(Duration::from_secs(30)),
            dimse_timeout: None,
            network_timeout: None,
            require_calling_aet: String::new(),
            require_called_aet: String::new(),
            requested_contexts: Vec::new(),
            supported_contexts: Vec::new(),
        })
    }

    /// The validated AE title of this node.
    pub fn ae_title(&self) -> &str {
        &self.ae_title
    }

    /// The TCP port to listen on. Zero lets the system choose.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// The number of simultaneous associations accepted.
    pub fn maximum_associations(mut self, value: usize) -> Self {
        self.maximum_associations = value;
        self
    }

    /// The maximum PDU length announced to peers.
    /// Zero announces no limit.
    pub fn maximum_pdu_size(mut self, value: u32) -> Self {
        self.maximum_pdu_size = value;
        self
    }

    /// The time limit for association negotiation answers.
    /// `None` disables the limit.
    pub fn acse_timeout(mut self, value: Option<Duration>) -> Self {
        self.acse_timeout = value;
        self
    }

    /// The time limit between DIMSE message fragments.
    /// `None` disables the limit.
    pub fn dimse_timeout(mut self, value: Option<Duration>) -> Self {
        self.dimse_timeout = value;
        self
    }

    /// The limit of overall network inactivity on an association.
    /// `None` disables the limit.
    pub fn network_timeout(mut self, value: Option<Duration>) -> Self {
        self.network_timeout = value;
        self
    }

    /// Only accept association requests from this calling AE title.
    /// An empty string disables the check.
    pub fn require_calling_aet(mut self, value: impl Into<String>) -> Self {
        self.require_calling_aet = value.into();
        self
    }

    /// Only accept association requests addressed to this AE title.
    /// An empty string disables the check.
    pub fn require_called_aet(mut self, value: impl Into<String>) -> Self {
        self.require_called_aet = value.into();
        self
    }

    /// Add a presentation context proposed on outbound associations.
    pub fn with_requested_context(mut self, context: PresentationContext) -> Self {
        self.requested_contexts.push(context);
        self
    }

    /// Add a presentation context accepted on inbound associations.
    pub fn with_supported_context(mut self, context: PresentationContext) -> Self {
        self.supported_contexts.push(context);
        self
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.maximum_associations >= 1, ZeroMaximumAssociationsSnafu);
        ensure!(
            self.requested_contexts.len() <= MAX_REQUESTED_CONTEXTS,
            TooManyRequestedContextsSnafu {
                count: self.requested_contexts.len()
            }
        );
        Ok(())
    }

    fn provider_options(&self) -> UlProviderOptions {
        UlProviderOptions {
            network_timeout: self.network_timeout,
            max_pdu_receive: self.maximum_pdu_size,
            strict: false,
            ..UlProviderOptions::default()
        }
    }

    /// Open an association to the addressed peer
    /// using the configured requested contexts.
    pub fn associate(&self, address: impl Into<AeAddr>) -> Result<Association> {
        let contexts = self.requested_contexts.clone();
        self.associate_with(address, contexts)
    }

    /// Open an association to the addressed peer,
    /// proposing the given presentation contexts.
    pub fn associate_with(
        &self,
        address: impl Into<AeAddr>,
        contexts: Vec<PresentationContext>,
    ) -> Result<Association> {
        self.validate()?;
        ensure!(!contexts.is_empty(), NoPresentationContextsSnafu);
        ensure!(
            contexts.len() <= MAX_REQUESTED_CONTEXTS,
            TooManyRequestedContextsSnafu {
                count: contexts.len()
            }
        );
        let address = address.into();

        let mut acse = AcseProvider::new_requestor(
            address.socket_addr(),
            self.provider_options(),
            self.acse_timeout,
        )
        .context(AcseSnafu)?;

        let outcome = acse
            .request(AssociateParams {
                calling_ae_title: self.ae_title.clone(),
                called_ae_title: address.ae_title_or("ANY-SCP").to_string(),
                max_pdu_length: self.maximum_pdu_size,
                presentation_contexts: contexts,
                user_items: vec![],
            })
            .context(AcseSnafu)?;

        let negotiated = match outcome {
            AssociateOutcome::Accepted(negotiated) => negotiated,
            AssociateOutcome::Rejected(rejection) => {
                return RejectedSnafu { rejection }.fail();
            }
            AssociateOutcome::Aborted(source) => {
                return AssociationAbortedSnafu {
                    source_of_abort: source,
                }
                .fail();
            }
        };
        ensure!(
            !negotiated.accepted_contexts.is_empty(),
            NoAcceptedPresentationContextsSnafu
        );

        info!(
            "association established with {} ({} contexts accepted)",
            address,
            negotiated.accepted_contexts.len()
        );
        Ok(Association::new(
            acse,
            self.ae_title.clone(),
            address,
            negotiated,
            self.dimse_timeout,
        ))
    }

    /// Start serving inbound associations.
    ///
    /// Binds the listening socket and spawns the accept loop;
    /// every accepted connection is served on its own thread.
    /// Connections beyond `maximum_associations` are rejected
    /// with a transient local-limit-exceeded diagnostic.
    pub fn start(&self, handlers: Arc<dyn ServiceHandlers>) -> Result<AeServer> {
        self.validate()?;
        let listener =
            TcpListener::bind(("0.0.0.0", self.port)).context(BindSnafu)?;
        let local_addr = listener.local_addr().context(BindSnafu)?;
        listener.set_nonblocking(true).context(BindSnafu)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicUsize::new(0));

        let config = self.clone();
        let loop_shutdown = Arc::clone(&shutdown);
        let loop_active = Arc::clone(&active);
        let handle = std::thread::Builder::new()
            .name(format!("ae-{}", self.ae_title.to_lowercase()))
            .spawn(move || {
                accept_loop(listener, config, handlers, loop_shutdown, loop_active)
            })
            .context(SpawnAcceptLoopSnafu)?;

        info!("{} listening on {}", self.ae_title, local_addr);
        Ok(AeServer {
            local_addr,
            shutdown,
            active,
            handle: Some(handle),
        })
    }
}

/// A running acceptor application entity.
#[derive(Debug)]
pub struct AeServer {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl AeServer {
    /// The address the listening socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The number of associations currently being served.
    pub fn active_associations(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Stop accepting associations and shut the accept loop down.
    ///
    /// Associations already being served wind down on their own;
    /// their provider threads abort when the handler loop ends.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AeServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    config: ApplicationEntity,
    handlers: Arc<dyn ServiceHandlers>,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
) {
    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let config = config.clone();
                let handlers = Arc::clone(&handlers);
                let active = Arc::clone(&active);
                let shutdown = Arc::clone(&shutdown);
                let at_capacity =
                    active.load(Ordering::Acquire) >= config.maximum_associations;
                let _ = std::thread::Builder::new()
                    .name("ae-association".to_string())
                    .spawn(move || {
                        if at_capacity {
                            reject_over_capacity(stream, &config);
                            return;
                        }
                        active.fetch_add(1, Ordering::AcqRel);
                        if let Err(e) =
                            serve_association(stream, peer, &config, &*handlers, &shutdown)
                        {
                            debug!("association with {} ended: {}", peer, e);
                        }
                        active.fetch_sub(1, Ordering::AcqRel);
                    });
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => {
                warn!("could not accept connection: {}", e);
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

/// Deny an association request beyond the association limit.
fn reject_over_capacity(stream: std::net::TcpStream, config: &ApplicationEntity) {
    let mut acse = match AcseProvider::new_acceptor(
        stream,
        config.provider_options(),
        config.acse_timeout,
    ) {
        Ok(acse) => acse,
        Err(_) => return,
    };
    if acse.wait_for_request().is_ok() {
        acse.reject(AssociationRJ {
            result: AssociationRJResult::Transient,
            source: AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            ),
        });
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// What the acceptor's polling loop saw next.
enum LoopEvent {
    Message(u8, DimseMessage),
    Released,
    Aborted,
    Shutdown,
}

/// Poll for the next inbound message or association control event.
///
/// Applies the DIMSE timeout between successive fragment arrivals
/// once reassembly has begun,
/// aborting the association on expiry.
fn next_event(service: &mut DimseService, shutdown: &AtomicBool) -> Result<LoopEvent> {
    let mut last_progress = std::time::Instant::now();
    let mut fragments_seen = service.fragment_count();

    loop {
        if shutdown.load(Ordering::Acquire) {
            service.acse().abort(AbortRQSource::ServiceUser);
            return Ok(LoopEvent::Shutdown);
        }
        if service.check_abort().is_some() {
            return Ok(LoopEvent::Aborted);
        }
        if service.check_release() {
            return Ok(LoopEvent::Released);
        }

        match service.try_receive() {
            Ok(Some((context_id, message))) => {
                return Ok(LoopEvent::Message(context_id, message));
            }
            Ok(None) => {}
            Err(e) => {
                service.acse().abort(AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::ReasonNotSpecified,
                ));
                return Err(e).context(DimseSnafu);
            }
        }

        let fragments = service.fragment_count();
        if fragments != fragments_seen {
            fragments_seen = fragments;
            last_progress = std::time::Instant::now();
        } else if service.is_assembling() {
            if let Some(timeout) = service.dimse_timeout() {
                if last_progress.elapsed() > timeout {
                    warn!("no message fragment within the DIMSE timeout, aborting");
                    service.acse().abort(AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::ReasonNotSpecified,
                    ));
                    return Ok(LoopEvent::Aborted);
                }
            }
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Serve one inbound association to completion.
fn serve_association(
    stream: std::net::TcpStream,
    peer: SocketAddr,
    config: &ApplicationEntity,
    handlers: &dyn ServiceHandlers,
    shutdown: &AtomicBool,
) -> Result<()> {
    let mut acse = AcseProvider::new_acceptor(
        stream,
        config.provider_options(),
        config.acse_timeout,
    )
    .context(AcseSnafu)?;

    let request = acse.wait_for_request().context(AcseSnafu)?;

    // enforce the configured AE title checks;
    // titles compare without their space padding
    if !config.require_called_aet.is_empty()
        && request.called_ae_title != config.require_called_aet.trim_matches(' ')
    {
        acse.reject(AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            ),
        });
        return Ok(());
    }
    if !config.require_calling_aet.is_empty()
        && request.calling_ae_title != config.require_calling_aet.trim_matches(' ')
    {
        acse.reject(AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized,
            ),
        });
        return Ok(());
    }

    let results = negotiate_presentation_contexts(
        &request.presentation_contexts,
        &config.supported_contexts,
    );
    let accepted_contexts: Vec<NegotiatedContext> = results
        .iter()
        .filter(|r| {
            r.reason == netdicom_ul::pdu::PresentationContextResultReason::Acceptance
        })
        .map(|r| NegotiatedContext {
            id: r.id,
            abstract_syntax: request
                .presentation_contexts
                .iter()
                .find(|p| p.id == r.id)
                .map(|p| p.abstract_syntax.clone())
                .unwrap_or_default(),
            transfer_syntax: r.transfer_syntax.clone(),
        })
        .collect();

    let mut user_variables = vec![
        UserVariableItem::MaxLength(config.maximum_pdu_size),
        UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
        UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
    ];
    let mut peer_max_pdu_length = 0;
    for item in &request.user_variables {
        match item {
            UserVariableItem::MaxLength(length) => peer_max_pdu_length = *length,
            // only one operation at a time is performed here
            UserVariableItem::AsyncOperationsWindow(_, _) => {
                user_variables.push(UserVariableItem::AsyncOperationsWindow(1, 1));
            }
            // unknown sub-items are echoed back, not dropped
            UserVariableItem::Unknown(item_type, data) => {
                user_variables.push(UserVariableItem::Unknown(*item_type, data.clone()));
            }
            _ => {}
        }
    }

    acse.accept(AssociationAC {
        protocol_version: 1,
        called_ae_title: request.called_ae_title.clone(),
        calling_ae_title: request.calling_ae_title.clone(),
        application_context_name: request.application_context_name.clone(),
        presentation_contexts: results,
        user_variables,
    });
    info!(
        "association with {} established ({} contexts accepted)",
        peer,
        accepted_contexts.len()
    );

    let mut service = DimseService::new(acse, config.dimse_timeout, peer_max_pdu_length, 1);

    loop {
        let (context_id, message) = match next_event(&mut service, shutdown)? {
            LoopEvent::Message(context_id, message) => (context_id, message),
            LoopEvent::Released => {
                debug!("association with {} released", peer);
                return Ok(());
            }
            LoopEvent::Aborted => {
                debug!("association with {} aborted", peer);
                return Ok(());
            }
            LoopEvent::Shutdown => {
                debug!("association with {} closed on shutdown", peer);
                return Ok(());
            }
        };

        let context = match accepted_contexts.iter().find(|c| c.id == context_id) {
            Some(context) => context.clone(),
            None => {
                warn!(
                    "message on unaccepted presentation context {}, aborting",
                    context_id
                );
                service.acse().abort(AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::UnexpectedPduParameter,
                ));
                return Ok(());
            }
        };

        let ctx = ServiceContext {
            calling_ae_title: request.calling_ae_title.clone(),
            called_ae_title: request.called_ae_title.clone(),
            peer_address: peer,
            presentation_context: context,
            message_id: message.message_id(),
            priority: None,
            move_originator_ae_title: None,
            move_originator_message_id: None,
        };

        match message {
            DimseMessage::CEchoRq(rq) => {
                let status = handlers.on_c_echo(&ctx);
                service
                    .send(
                        context_id,
                        &DimseMessage::CEchoRsp(CEchoRsp {
                            message_id_responded: rq.message_id,
                            affected_sop_class_uid: Some(rq.affected_sop_class_uid),
                            status,
                        }),
                    )
                    .context(DimseSnafu)?;
            }
            DimseMessage::CStoreRq(rq) => {
                let ctx = ServiceContext {
                    priority: Some(rq.priority),
                    move_originator_ae_title: rq.move_originator_ae_title.clone(),
                    move_originator_message_id: rq.move_originator_message_id,
                    ..ctx
                };
                let status = handlers.on_c_store(rq.dataset, &ctx);
                service
                    .send(
                        context_id,
                        &DimseMessage::CStoreRsp(CStoreRsp {
                            message_id_responded: rq.message_id,
                            affected_sop_class_uid: Some(rq.affected_sop_class_uid),
                            affected_sop_instance_uid: Some(rq.affected_sop_instance_uid),
                            status,
                        }),
                    )
                    .context(DimseSnafu)?;
            }
            DimseMessage::CFindRq(rq) => {
                let ctx = ServiceContext {
                    priority: Some(rq.priority),
                    ..ctx
                };
                serve_c_find(&mut service, context_id, &rq, handlers, &ctx)?;
            }
            DimseMessage::CGetRq(rq) => {
                let ctx = ServiceContext {
                    priority: Some(rq.priority),
                    ..ctx
                };
                serve_c_get(&mut service, context_id, &rq, handlers, &ctx, &accepted_contexts)?;
            }
            DimseMessage::CMoveRq(rq) => {
                let ctx = ServiceContext {
                    priority: Some(rq.priority),
                    ..ctx
                };
                serve_c_move(&mut service, context_id, &rq, handlers, &ctx, config)?;
            }
            DimseMessage::CCancelRq(_) => {
                // no operation is streaming responses right now
                debug!("stray C-CANCEL from {} ignored", peer);
            }
            DimseMessage::NEventReportRq(rq) => {
                let (status, event_reply) = handlers.on_n_event_report(&rq, &ctx);
                service
                    .send(
                        context_id,
                        &DimseMessage::NEventReportRsp(NEventReportRsp {
                            message_id_responded: rq.message_id,
                            affected_sop_class_uid: Some(rq.affected_sop_class_uid),
                            affected_sop_instance_uid: Some(rq.affected_sop_instance_uid),
                            event_type_id: Some(rq.event_type_id),
                            status,
                            event_reply,
                        }),
                    )
                    .context(DimseSnafu)?;
            }
            DimseMessage::NGetRq(rq) => {
                let (status, attribute_list) = handlers.on_n_get(&rq, &ctx);
                service
                    .send(
                        context_id,
                        &DimseMessage::NGetRsp(NGetRsp {
                            message_id_responded: rq.message_id,
                            affected_sop_class_uid: Some(rq.requested_sop_class_uid),
                            affected_sop_instance_uid: Some(rq.requested_sop_instance_uid),
                            status,
                            attribute_list,
                        }),
                    )
                    .context(DimseSnafu)?;
            }
            DimseMessage::NSetRq(rq) => {
                let (status, attribute_list) = handlers.on_n_set(&rq, &ctx);
                service
                    .send(
                        context_id,
                        &DimseMessage::NSetRsp(NSetRsp {
                            message_id_responded: rq.message_id,
                            affected_sop_class_uid: Some(rq.requested_sop_class_uid),
                            affected_sop_instance_uid: Some(rq.requested_sop_instance_uid),
                            status,
                            attribute_list,
                        }),
                    )
                    .context(DimseSnafu)?;
            }
            DimseMessage::NActionRq(rq) => {
                let (status, action_reply) = handlers.on_n_action(&rq, &ctx);
                service
                    .send(
                        context_id,
                        &DimseMessage::NActionRsp(NActionRsp {
                            message_id_responded: rq.message_id,
                            affected_sop_class_uid: Some(rq.requested_sop_class_uid),
                            affected_sop_instance_uid: Some(rq.requested_sop_instance_uid),
                            action_type_id: Some(rq.action_type_id),
                            status,
                            action_reply,
                        }),
                    )
                    .context(DimseSnafu)?;
            }
            DimseMessage::NCreateRq(rq) => {
                let (status, attribute_list) = handlers.on_n_create(&rq, &ctx);
                service
                    .send(
                        context_id,
                        &DimseMessage::NCreateRsp(NCreateRsp {
                            message_id_responded: rq.message_id,
                            affected_sop_class_uid: Some(rq.affected_sop_class_uid),
                            affected_sop_instance_uid: rq.affected_sop_instance_uid,
                            status,
                            attribute_list,
                        }),
                    )
                    .context(DimseSnafu)?;
            }
            DimseMessage::NDeleteRq(rq) => {
                let status = handlers.on_n_delete(&rq, &ctx);
                service
                    .send(
                        context_id,
                        &DimseMessage::NDeleteRsp(NDeleteRsp {
                            message_id_responded: rq.message_id,
                            affected_sop_class_uid: Some(rq.requested_sop_class_uid),
                            affected_sop_instance_uid: Some(rq.requested_sop_instance_uid),
                            status,
                        }),
                    )
                    .context(DimseSnafu)?;
            }
            other => {
                warn!("unexpected message from {}: {:?}", peer, other.command_field());
                service.acse().abort(AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::UnexpectedPdu,
                ));
                return Ok(());
            }
        }
    }
}

/// Poll for a C-CANCEL addressed to `message_id` without blocking.
fn cancel_requested(service: &mut DimseService, message_id: u16) -> bool {
    match service.try_receive() {
        Ok(Some((_, DimseMessage::CCancelRq(cancel)))) => {
            cancel.message_id_responded == message_id
        }
        Ok(Some((_, other))) => {
            warn!(
                "unexpected message while streaming responses: {:?}",
                other.command_field()
            );
            false
        }
        _ => false,
    }
}

fn serve_c_find(
    service: &mut DimseService,
    context_id: u8,
    rq: &CFindRq,
    handlers: &dyn ServiceHandlers,
    ctx: &ServiceContext,
) -> Result<()> {
    let mut responses = handlers.on_c_find(rq.identifier.clone(), ctx);

    loop {
        if cancel_requested(service, rq.message_id) {
            responses.cancel();
            service
                .send(
                    context_id,
                    &DimseMessage::CFindRsp(CFindRsp {
                        message_id_responded: rq.message_id,
                        affected_sop_class_uid: Some(rq.affected_sop_class_uid.clone()),
                        status: Status::CANCEL,
                        identifier: None,
                    }),
                )
                .context(DimseSnafu)?;
            return Ok(());
        }

        let (status, identifier) = match responses.next_response() {
            Some(response) => response,
            // an exhausted handle completes the operation
            None => (Status::SUCCESS, None),
        };
        service
            .send(
                context_id,
                &DimseMessage::CFindRsp(CFindRsp {
                    message_id_responded: rq.message_id,
                    affected_sop_class_uid: Some(rq.affected_sop_class_uid.clone()),
                    status,
                    identifier,
                }),
            )
            .context(DimseSnafu)?;
        if status.is_final() {
            return Ok(());
        }
    }
}

/// Send one storage sub-operation over an association
/// and wait for its C-STORE response status.
fn perform_sub_operation(
    service: &mut DimseService,
    context_id: u8,
    message_id: u16,
    sub_operation: SubOperation,
    move_originator: Option<(&str, u16)>,
) -> Result<Status> {
    service
        .send(
            context_id,
            &DimseMessage::CStoreRq(CStoreRq {
                message_id,
                affected_sop_class_uid: sub_operation.sop_class_uid,
                affected_sop_instance_uid: sub_operation.sop_instance_uid,
                priority: Priority::Medium,
                move_originator_ae_title: move_originator.map(|(aet, _)| aet.to_string()),
                move_originator_message_id: move_originator.map(|(_, id)| id),
                dataset: sub_operation.dataset,
            }),
        )
        .context(DimseSnafu)?;

    loop {
        let (_, message) = service.receive().context(DimseSnafu)?;
        match message {
            DimseMessage::CStoreRsp(rsp) if rsp.message_id_responded == message_id => {
                return Ok(rsp.status);
            }
            other => {
                warn!(
                    "unexpected message while awaiting a store response: {:?}",
                    other.command_field()
                );
            }
        }
    }
}

fn serve_c_get(
    service: &mut DimseService,
    context_id: u8,
    rq: &CGetRq,
    handlers: &dyn ServiceHandlers,
    ctx: &ServiceContext,
    accepted_contexts: &[NegotiatedContext],
) -> Result<()> {
    let mut sub_operations = handlers.on_c_get(rq.identifier.clone(), ctx);
    let mut remaining = sub_operations.remaining();
    let mut completed = 0u16;
    let mut failed = 0u16;
    let warning = 0u16;
    let mut cancelled = false;
    let mut sub_message_id = rq.message_id;

    while let Some(sub_operation) = {
        if cancel_requested(service, rq.message_id) {
            sub_operations.cancel();
            cancelled = true;
            None
        } else {
            sub_operations.next_sub_operation()
        }
    } {
        remaining = remaining.saturating_sub(1);
        sub_message_id = sub_message_id.wrapping_add(1);

        // the storage sub-operations go out over this same
        // association, on a context matching the instance's SOP class
        let sub_context = accepted_contexts
            .iter()
            .find(|c| c.abstract_syntax == sub_operation.sop_class_uid);
        let status = match sub_context {
            Some(sub_context) => perform_sub_operation(
                service,
                sub_context.id,
                sub_message_id,
                sub_operation,
                None,
            )?,
            None => {
                warn!(
                    "no accepted context for sub-operation of class {}",
                    sub_operation.sop_class_uid
                );
                Status::SOP_CLASS_NOT_SUPPORTED
            }
        };
        if status.is_success() {
            completed += 1;
        } else {
            failed += 1;
        }

        service
            .send(
                context_id,
                &DimseMessage::CGetRsp(CGetRsp {
                    message_id_responded: rq.message_id,
                    affected_sop_class_uid: Some(rq.affected_sop_class_uid.clone()),
                    status: Status::PENDING,
                    remaining: Some(remaining),
                    completed: Some(completed),
                    failed: Some(failed),
                    warning: Some(warning),
                    identifier: None,
                }),
            )
            .context(DimseSnafu)?;
    }

    let status = if cancelled {
        Status::CANCEL
    } else if failed > 0 {
        Status::WARNING_SUB_OPERATIONS_FAILED
    } else {
        Status::SUCCESS
    };
    service
        .send(
            context_id,
            &DimseMessage::CGetRsp(CGetRsp {
                message_id_responded: rq.message_id,
                affected_sop_class_uid: Some(rq.affected_sop_class_uid.clone()),
                status,
                remaining: Some(remaining),
                completed: Some(completed),
                failed: Some(failed),
                warning: Some(warning),
                identifier: None,
            }),
        )
        .context(DimseSnafu)?;
    Ok(())
}

fn serve_c_move(
    service: &mut DimseService,
    context_id: u8,
    rq: &CMoveRq,
    handlers: &dyn ServiceHandlers,
    ctx: &ServiceContext,
    config: &ApplicationEntity,
) -> Result<()> {
    let (destination, mut sub_operations) = handlers.on_c_move(rq.identifier.clone(), ctx);

    let (address, port) = match destination {
        Some(destination) => destination,
        None => {
            // the move destination is not known to this node
            service
                .send(
                    context_id,
                    &DimseMessage::CMoveRsp(CMoveRsp {
                        message_id_responded: rq.message_id,
                        affected_sop_class_uid: Some(rq.affected_sop_class_uid.clone()),
                        status: Status::MOVE_DESTINATION_UNKNOWN,
                        remaining: None,
                        completed: None,
                        failed: None,
                        warning: None,
                        identifier: None,
                    }),
                )
                .context(DimseSnafu)?;
            return Ok(());
        }
    };

    // the sub-operations travel over a new association
    // from this node to the destination
    let resolved = std::net::ToSocketAddrs::to_socket_addrs(&(address.as_str(), port))
        .ok()
        .and_then(|mut addrs| addrs.next());
    let destination_addr: SocketAddr = match resolved {
        Some(addr) => addr,
        None => {
            service
                .send(
                    context_id,
                    &DimseMessage::CMoveRsp(CMoveRsp {
                        message_id_responded: rq.message_id,
                        affected_sop_class_uid: Some(rq.affected_sop_class_uid.clone()),
                        status: Status::MOVE_DESTINATION_UNKNOWN,
                        remaining: None,
                        completed: None,
                        failed: None,
                        warning: None,
                        identifier: None,
                    }),
                )
                .context(DimseSnafu)?;
            return Ok(());
        }
    };

    let store_ae = ApplicationEntity {
        requested_contexts: config.supported_contexts.clone(),
        ..config.clone()
    };
    let mut store_assoc = match store_ae.associate_with(
        AeAddr::new(rq.move_destination.clone(), destination_addr),
        renumbered_contexts(&config.supported_contexts),
    ) {
        Ok(assoc) => assoc,
        Err(e) => {
            warn!("could not reach move destination {}: {}", destination_addr, e);
            service
                .send(
                    context_id,
                    &DimseMessage::CMoveRsp(CMoveRsp {
                        message_id_responded: rq.message_id,
                        affected_sop_class_uid: Some(rq.affected_sop_class_uid.clone()),
                        status: Status::OUT_OF_RESOURCES,
                        remaining: None,
                        completed: None,
                        failed: None,
                        warning: None,
                        identifier: None,
                    }),
                )
                .context(DimseSnafu)?;
            return Ok(());
        }
    };

    let mut remaining = sub_operations.remaining();
    let mut completed = 0u16;
    let mut failed = 0u16;
    let warning = 0u16;
    let mut cancelled = false;

    while let Some(sub_operation) = {
        if cancel_requested(service, rq.message_id) {
            sub_operations.cancel();
            cancelled = true;
            None
        } else {
            sub_operations.next_sub_operation()
        }
    } {
        remaining = remaining.saturating_sub(1);
        let status = match store_assoc.store_sub_operation(
            sub_operation,
            (ctx.called_ae_title.as_str(), rq.message_id),
        ) {
            Ok(status) => status,
            Err(e) => {
                warn!("storage sub-operation failed: {}", e);
                Status::PROCESSING_FAILURE
            }
        };
        if status.is_success() {
            completed += 1;
        } else {
            failed += 1;
        }

        service
            .send(
                context_id,
                &DimseMessage::CMoveRsp(CMoveRsp {
                    message_id_responded: rq.message_id,
                    affected_sop_class_uid: Some(rq.affected_sop_class_uid.clone()),
                    status: Status::PENDING,
                    remaining: Some(remaining),
                    completed: Some(completed),
                    failed: Some(failed),
                    warning: Some(warning),
                    identifier: None,
                }),
            )
            .context(DimseSnafu)?;
    }

    if let Err(e) = store_assoc.release() {
        debug!("release of the store association failed: {}", e);
    }

    let status = if cancelled {
        Status::CANCEL
    } else if failed > 0 {
        Status::WARNING_SUB_OPERATIONS_FAILED
    } else {
        Status::SUCCESS
    };
    service
        .send(
            context_id,
            &DimseMessage::CMoveRsp(CMoveRsp {
                message_id_responded: rq.message_id,
                affected_sop_class_uid: Some(rq.affected_sop_class_uid.clone()),
                status,
                remaining: Some(remaining),
                completed: Some(completed),
                failed: Some(failed),
                warning: Some(warning),
                identifier: None,
            }),
        )
        .context(DimseSnafu)?;
    Ok(())
}

/// Reassign ascending odd identifiers to a context list
/// so it can be proposed on a fresh association.
fn renumbered_contexts(contexts: &[PresentationContext]) -> Vec<PresentationContext> {
    contexts
        .iter()
        .take(MAX_REQUESTED_CONTEXTS)
        .enumerate()
        .filter_map(|(index, context)| {
            PresentationContext::new(
                (index as u8) * 2 + 1,
                context.abstract_syntax().to_string(),
                context.transfer_syntaxes().to_vec(),
            )
            .ok()
        })
        .collect()
}

/// The outcome of a C-GET or C-MOVE operation as seen by the SCU.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct RetrieveOutcome {
    pub status: Status,
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
}

/// An established association, from the requestor's perspective.
///
/// The DIMSE-C operations are exposed as blocking methods;
/// each allocates a message ID, performs the exchange
/// and returns the peer's answer.
#[derive(Debug)]
pub struct Association {
    service: DimseService,
    local_ae_title: String,
    peer: AeAddr,
    accepted_contexts: Vec<NegotiatedContext>,
    next_message_id: u16,
}

impl Association {
    fn new(
        acse: AcseProvider,
        local_ae_title: String,
        peer: AeAddr,
        negotiated: NegotiatedParameters,
        dimse_timeout: Option<Duration>,
    ) -> Self {
        let max_invoked = negotiated
            .async_ops_window
            .map(|(invoked, _)| invoked)
            .unwrap_or(1);
        Association {
            service: DimseService::new(
                acse,
                dimse_timeout,
                negotiated.peer_max_pdu_length,
                max_invoked,
            ),
            local_ae_title,
            peer,
            accepted_contexts: negotiated.accepted_contexts,
            next_message_id: 0,
        }
    }

    /// The presentation contexts accorded on this association.
    pub fn accepted_contexts(&self) -> &[NegotiatedContext] {
        &self.accepted_contexts
    }

    /// The address of the peer.
    pub fn peer(&self) -> &AeAddr {
        &self.peer
    }

    fn allocate_message_id(&mut self) -> u16 {
        self.next_message_id = self.next_message_id.wrapping_add(1);
        self.next_message_id
    }

    fn context_for(&self, abstract_syntax: &str) -> Result<NegotiatedContext> {
        self.accepted_contexts
            .iter()
            .find(|c| c.abstract_syntax == abstract_syntax)
            .cloned()
            .context(NoSuitableContextSnafu { abstract_syntax })
    }

    /// Send a raw message over the association. Low level access.
    pub fn send_message(&mut self, context_id: u8, message: &DimseMessage) -> Result<()> {
        self.service.send(context_id, message).context(DimseSnafu)
    }

    /// Receive the next message from the association. Low level access.
    pub fn receive_message(&mut self) -> Result<(u8, DimseMessage)> {
        self.service.receive().context(DimseSnafu)
    }

    /// Perform a C-ECHO (verification) exchange.
    pub fn echo(&mut self) -> Result<Status> {
        let context = self.context_for("1.2.840.10008.1.1")?;
        let message_id = self.allocate_message_id();
        self.service
            .send(
                context.id,
                &DimseMessage::CEchoRq(CEchoRq {
                    message_id,
                    affected_sop_class_uid: context.abstract_syntax.clone(),
                }),
            )
            .context(DimseSnafu)?;

        loop {
            let (_, message) = self.service.receive().context(DimseSnafu)?;
            match message {
                DimseMessage::CEchoRsp(rsp) if rsp.message_id_responded == message_id => {
                    return Ok(rsp.status);
                }
                other => {
                    warn!("unexpected answer to C-ECHO: {:?}", other.command_field());
                }
            }
        }
    }

    /// Perform a C-STORE exchange for one SOP instance.
    pub fn store(
        &mut self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        dataset: Vec<u8>,
    ) -> Result<Status> {
        let context = self.context_for(sop_class_uid)?;
        let message_id = self.allocate_message_id();
        self.service
            .send(
                context.id,
                &DimseMessage::CStoreRq(CStoreRq {
                    message_id,
                    affected_sop_class_uid: sop_class_uid.to_string(),
                    affected_sop_instance_uid: sop_instance_uid.to_string(),
                    priority: Priority::Medium,
                    move_originator_ae_title: None,
                    move_originator_message_id: None,
                    dataset,
                }),
            )
            .context(DimseSnafu)?;

        loop {
            let (_, message) = self.service.receive().context(DimseSnafu)?;
            match message {
                DimseMessage::CStoreRsp(rsp) if rsp.message_id_responded == message_id => {
                    return Ok(rsp.status);
                }
                other => {
                    warn!("unexpected answer to C-STORE: {:?}", other.command_field());
                }
            }
        }
    }

    fn store_sub_operation(
        &mut self,
        sub_operation: SubOperation,
        move_originator: (&str, u16),
    ) -> Result<Status> {
        let context = self.context_for(&sub_operation.sop_class_uid)?;
        let message_id = self.allocate_message_id();
        perform_sub_operation(
            &mut self.service,
            context.id,
            message_id,
            sub_operation,
            Some(move_originator),
        )
    }

    /// Perform a C-FIND exchange,
    /// collecting every pending match until the final response.
    pub fn find(
        &mut self,
        sop_class_uid: &str,
        identifier: Vec<u8>,
    ) -> Result<(Status, Vec<Vec<u8>>)> {
        let context = self.context_for(sop_class_uid)?;
        let message_id = self.allocate_message_id();
        self.service
            .send(
                context.id,
                &DimseMessage::CFindRq(CFindRq {
                    message_id,
                    affected_sop_class_uid: sop_class_uid.to_string(),
                    priority: Priority::Medium,
                    identifier,
                }),
            )
            .context(DimseSnafu)?;

        let mut matches = Vec::new();
        loop {
            let (_, message) = self.service.receive().context(DimseSnafu)?;
            match message {
                DimseMessage::CFindRsp(rsp) if rsp.message_id_responded == message_id => {
                    if rsp.status.is_pending() {
                        if let Some(identifier) = rsp.identifier {
                            matches.push(identifier);
                        }
                    } else {
                        return Ok((rsp.status, matches));
                    }
                }
                other => {
                    warn!("unexpected answer to C-FIND: {:?}", other.command_field());
                }
            }
        }
    }

    /// Perform a C-GET exchange.
    ///
    /// Storage sub-operations arrive over this same association;
    /// each is handed to `on_store`, whose status is reported back.
    pub fn get(
        &mut self,
        sop_class_uid: &str,
        identifier: Vec<u8>,
        mut on_store: impl FnMut(CStoreRq) -> Status,
    ) -> Result<RetrieveOutcome> {
        let context = self.context_for(sop_class_uid)?;
        let message_id = self.allocate_message_id();
        self.service
            .send(
                context.id,
                &DimseMessage::CGetRq(CGetRq {
                    message_id,
                    affected_sop_class_uid: sop_class_uid.to_string(),
                    priority: Priority::Medium,
                    identifier,
                }),
            )
            .context(DimseSnafu)?;

        loop {
            let (store_context_id, message) = self.service.receive().context(DimseSnafu)?;
            match message {
                DimseMessage::CGetRsp(rsp) if rsp.message_id_responded == message_id => {
                    if rsp.status.is_final() {
                        return Ok(RetrieveOutcome {
                            status: rsp.status,
                            completed: rsp.completed.unwrap_or(0),
                            failed: rsp.failed.unwrap_or(0),
                            warning: rsp.warning.unwrap_or(0),
                        });
                    }
                }
                DimseMessage::CStoreRq(rq) => {
                    let response = CStoreRsp {
                        message_id_responded: rq.message_id,
                        affected_sop_class_uid: Some(rq.affected_sop_class_uid.clone()),
                        affected_sop_instance_uid: Some(rq.affected_sop_instance_uid.clone()),
                        status: on_store(rq),
                    };
                    self.service
                        .send(store_context_id, &DimseMessage::CStoreRsp(response))
                        .context(DimseSnafu)?;
                }
                other => {
                    warn!("unexpected answer to C-GET: {:?}", other.command_field());
                }
            }
        }
    }

    /// Perform a C-MOVE exchange,
    /// asking the peer to send the matching instances
    /// to `destination_aet`.
    pub fn move_instances(
        &mut self,
        sop_class_uid: &str,
        destination_aet: &str,
        identifier: Vec<u8>,
    ) -> Result<RetrieveOutcome> {
        let context = self.context_for(sop_class_uid)?;
        let message_id = self.allocate_message_id();
        self.service
            .send(
                context.id,
                &DimseMessage::CMoveRq(CMoveRq {
                    message_id,
                    affected_sop_class_uid: sop_class_uid.to_string(),
                    priority: Priority::Medium,
                    move_destination: destination_aet.to_string(),
                    identifier,
                }),
            )
            .context(DimseSnafu)?;

        loop {
            let (_, message) = self.service.receive().context(DimseSnafu)?;
            match message {
                DimseMessage::CMoveRsp(rsp) if rsp.message_id_responded == message_id => {
                    if rsp.status.is_final() {
                        return Ok(RetrieveOutcome {
                            status: rsp.status,
                            completed: rsp.completed.unwrap_or(0),
                            failed: rsp.failed.unwrap_or(0),
                            warning: rsp.warning.unwrap_or(0),
                        });
                    }
                }
                other => {
                    warn!("unexpected answer to C-MOVE: {:?}", other.command_field());
                }
            }
        }
    }

    /// Ask the peer to cancel the operation with the given message ID.
    pub fn cancel(&mut self, context_id: u8, message_id: u16) -> Result<()> {
        self.service
            .send(
                context_id,
                &DimseMessage::CCancelRq(CCancelRq {
                    message_id_responded: message_id,
                }),
            )
            .context(DimseSnafu)
    }

    /// Release the association in an orderly manner.
    pub fn release(&mut self) -> Result<()> {
        self.service.acse().release().context(AcseSnafu)
    }

    /// Abort the association immediately.
    pub fn abort(&mut self) {
        self.service.acse().abort(AbortRQSource::ServiceUser);
    }

    /// The AE title of this side of the association.
    pub fn local_ae_title(&self) -> &str {
        &self.local_ae_title
    }
}
