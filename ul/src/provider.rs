//! The upper layer service provider.
//!
//! The provider owns one TCP transport connection,
//! the protocol state machine and the ARTIM and inactivity timers,
//! and runs them on a dedicated thread.
//! The layers above interact with it exclusively through
//! service primitives:
//! requests and responses go in through [`UlProvider::send`],
//! indications and confirmations come out through
//! [`UlProvider::receive`].

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use snafu::{ResultExt, Snafu};
use tracing::{debug, trace, warn};

use crate::fsm::{self, Action, Event, State};
use crate::pdu::{
    read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationAC,
    AssociationRJ, AssociationRQ, PDataValue, Pdu, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE,
    PDU_HEADER_SIZE,
};
use crate::queue::SyncQueue;
use crate::timer::Timer;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// failed to spawn the provider thread
    SpawnThread { source: std::io::Error },

    /// the provider is not in the idle state
    NotIdle,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A service primitive exchanged between the provider and its user.
///
/// The same vocabulary serves both directions:
/// sent by the user it is a request or a response,
/// delivered to the user it is an indication or a confirmation.
#[derive(Clone, Debug)]
pub enum Primitive {
    /// A-ASSOCIATE request or indication
    AssociateRq(AssociationRQ),
    /// A-ASSOCIATE (accept) response or confirmation
    AssociateAc(AssociationAC),
    /// A-ASSOCIATE (reject) response or confirmation
    AssociateRj(AssociationRJ),
    /// P-DATA request or indication
    PData(Vec<PDataValue>),
    /// A-RELEASE request or indication
    ReleaseRq,
    /// A-RELEASE response or confirmation
    ReleaseRp,
    /// A-ABORT request or indication
    /// (an A-P-ABORT when the source is the service provider)
    Abort { source: AbortRQSource },
}

/// Configuration for a [`UlProvider`].
#[derive(Debug, Clone)]
pub struct UlProviderOptions {
    /// the ARTIM timeout
    pub artim_timeout: Duration,
    /// the inactivity timeout: the provider shuts down
    /// when nothing arrives on the network for this long
    pub network_timeout: Option<Duration>,
    /// the maximum PDU length admitted on receive
    /// (0 for no administrative limit)
    pub max_pdu_receive: u32,
    /// whether PDUs over the maximum length are a hard error
    pub strict: bool,
}

impl Default for UlProviderOptions {
    fn default() -> Self {
        UlProviderOptions {
            // the timeout recommended by PS3.8 section 9.1.5
            artim_timeout: Duration::from_secs(30),
            network_timeout: None,
            max_pdu_receive: crate::pdu::DEFAULT_MAX_PDU,
            strict: true,
        }
    }
}

/// The upper layer service provider for one association.
///
/// Dropping the provider hard-stops its thread
/// without any further wire activity.
#[derive(Debug)]
pub struct UlProvider {
    from_user: Arc<SyncQueue<Primitive>>,
    to_user: Arc<SyncQueue<Primitive>>,
    kill: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    handle: Option<JoinHandle<()>>,
}

impl UlProvider {
    /// Create a provider in requestor mode.
    ///
    /// The transport connection to `peer` is opened
    /// once the A-ASSOCIATE request primitive is consumed.
    pub fn connect(peer: SocketAddr, options: UlProviderOptions) -> Result<Self> {
        Self::spawn(Transport::Unconnected(peer), true, options)
    }

    /// Create a provider in acceptor mode
    /// over an already accepted transport connection.
    pub fn from_stream(stream: TcpStream, options: UlProviderOptions) -> Result<Self> {
        Self::spawn(Transport::Accepted(stream), false, options)
    }

    fn spawn(transport: Transport, requestor: bool, options: UlProviderOptions) -> Result<Self> {
        let from_user = Arc::new(SyncQueue::new());
        let to_user = Arc::new(SyncQueue::new());
        let kill = Arc::new(AtomicBool::new(false));
        let state = Arc::new(AtomicU8::new(State::Sta1.code()));

        let mut service_loop = ServiceLoop {
            requestor,
            transport,
            read_buffer: BytesMut::with_capacity(8192),
            state: State::Sta1,
            shared_state: Arc::clone(&state),
            events: std::collections::VecDeque::new(),
            artim: Timer::with_timeout(Some(options.artim_timeout)),
            idle_timer: Timer::with_timeout(options.network_timeout),
            pending_request: None,
            from_user: Arc::clone(&from_user),
            to_user: Arc::clone(&to_user),
            kill: Arc::clone(&kill),
            max_pdu_receive: options.max_pdu_receive.clamp(MINIMUM_PDU_SIZE, MAXIMUM_PDU_SIZE),
            strict: options.strict,
        };

        let handle = std::thread::Builder::new()
            .name("netdicom-ul-provider".to_string())
            .spawn(move || service_loop.run())
            .context(SpawnThreadSnafu)?;

        Ok(UlProvider {
            from_user,
            to_user,
            kill,
            state,
            handle: Some(handle),
        })
    }

    /// The current state of the protocol machine.
    pub fn state(&self) -> State {
        State::from_code(self.state.load(Ordering::Acquire)).unwrap_or(State::Sta1)
    }

    /// Enqueue a service primitive for the provider to consume.
    pub fn send(&self, primitive: Primitive) {
        self.from_user.push(primitive);
    }

    /// Take the next primitive delivered to the user,
    /// waiting up to `timeout` for one to arrive
    /// (indefinitely when `None`).
    pub fn receive(&self, timeout: Option<Duration>) -> Option<Primitive> {
        self.to_user.pop_timeout(timeout)
    }

    /// Take the next primitive if one was already delivered.
    pub fn try_receive(&self) -> Option<Primitive> {
        self.to_user.try_pop()
    }

    /// Look at the next delivered primitive without consuming it.
    pub fn peek(&self) -> Option<Primitive> {
        self.to_user.peek()
    }

    /// Whether the provider thread is still running.
    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Hard-stop the provider:
    /// the loop terminates on its next iteration,
    /// closing the transport without sending any PDU.
    pub fn kill(&mut self) {
        self.kill.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Stop the provider.
    /// Succeeds only when the association is idle.
    pub fn stop(&mut self) -> Result<()> {
        if self.state() != State::Sta1 {
            return NotIdleSnafu.fail();
        }
        self.kill();
        Ok(())
    }
}

impl Drop for UlProvider {
    fn drop(&mut self) {
        self.kill();
    }
}

#[derive(Debug)]
enum Transport {
    /// requestor mode: connect once the association request arrives
    Unconnected(SocketAddr),
    /// acceptor mode: the connection is already established
    Accepted(TcpStream),
    /// the transport is live
    Open(TcpStream),
    /// no transport connection
    Closed,
}

/// The single-threaded service loop behind a [`UlProvider`].
///
/// Every iteration polls the transport, the user queue
/// and the ARTIM timer for new events,
/// and then drains the event queue through the state machine.
struct ServiceLoop {
    requestor: bool,
    transport: Transport,
    read_buffer: BytesMut,
    state: State,
    shared_state: Arc<AtomicU8>,
    events: std::collections::VecDeque<Event>,
    artim: Timer,
    idle_timer: Timer,
    /// the association request awaiting the transport connection,
    /// sent by `Ae2` once the connection is up
    pending_request: Option<AssociationRQ>,
    from_user: Arc<SyncQueue<Primitive>>,
    to_user: Arc<SyncQueue<Primitive>>,
    kill: Arc<AtomicBool>,
    max_pdu_receive: u32,
    strict: bool,
}

impl ServiceLoop {
    fn run(&mut self) {
        // an accepted connection is a transport indication (Evt5)
        match std::mem::replace(&mut self.transport, Transport::Closed) {
            Transport::Accepted(stream) => {
                prepare_stream(&stream);
                self.transport = Transport::Open(stream);
                self.events.push_back(Event::TransportIndication);
            }
            other => {
                self.transport = other;
            }
        }

        self.idle_timer.start();

        loop {
            if self.kill.load(Ordering::Acquire) {
                break;
            }

            if self.check_network() {
                self.idle_timer.restart();
            } else {
                self.check_incoming_primitive();
            }

            self.check_timers();

            while let Some(event) = self.events.pop_front() {
                self.apply(event);
            }

            if self.idle_timer.expired() {
                debug!("association inactive for too long, shutting down");
                break;
            }

            // when there is no open transport the loop has nothing to
            // block on, so pace it explicitly
            if !matches!(self.transport, Transport::Open(_)) {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        self.close_transport();
        self.set_state(State::Sta1);
    }

    fn set_state(&mut self, state: State) {
        if state != self.state {
            trace!("transition {} -> {}", self.state, state);
        }
        self.state = state;
        self.shared_state.store(state.code(), Ordering::Release);
    }

    /// Poll the transport for readable bytes,
    /// decoding and queueing the PDUs found in the stream.
    /// Returns whether any network activity happened.
    fn check_network(&mut self) -> bool {
        let stream = match &mut self.transport {
            Transport::Open(stream) => stream,
            _ => return false,
        };

        let mut chunk = [0u8; 8192];
        match stream.read(&mut chunk) {
            Ok(0) => {
                // peer closed the connection
                self.close_transport();
                self.events.push_back(Event::TransportClosed);
                true
            }
            Ok(n) => {
                self.read_buffer.extend_from_slice(&chunk[..n]);
                self.decode_buffered_pdus();
                true
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                false
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => false,
            Err(e) => {
                debug!("transport read error: {}", e);
                self.close_transport();
                self.events.push_back(Event::TransportClosed);
                true
            }
        }
    }

    /// Slice whole PDUs out of the read buffer
    /// and map each to its state machine event.
    fn decode_buffered_pdus(&mut self) {
        while self.read_buffer.len() >= PDU_HEADER_SIZE as usize {
            let pdu_length = u32::from_be_bytes([
                self.read_buffer[2],
                self.read_buffer[3],
                self.read_buffer[4],
                self.read_buffer[5],
            ]);
            let total = PDU_HEADER_SIZE as usize + pdu_length as usize;
            if self.read_buffer.len() < total {
                break;
            }

            let pdu_bytes = self.read_buffer.copy_to_bytes(total);
            let mut cursor = std::io::Cursor::new(&pdu_bytes[..]);
            match read_pdu(&mut cursor, self.max_pdu_receive, self.strict) {
                Ok(pdu) => {
                    debug!("received {}", pdu.short_description());
                    self.events.push_back(pdu_to_event(pdu));
                }
                Err(e) => {
                    warn!("could not decode incoming PDU: {}", e);
                    self.events.push_back(Event::InvalidPdu(pdu_bytes[0]));
                }
            }
        }
    }

    /// Poll the user queue for a pending request or response primitive.
    fn check_incoming_primitive(&mut self) {
        if let Some(primitive) = self.from_user.try_pop() {
            self.events.push_back(primitive_to_event(primitive));
        }
    }

    fn check_timers(&mut self) {
        if self.artim.expired() {
            self.artim.stop();
            self.events.push_back(Event::ArtimExpired);
        }
    }

    /// Run one event through the state machine,
    /// performing the transition's action.
    fn apply(&mut self, event: Event) {
        let code = event.code();
        let action = match fsm::transition(self.state, code) {
            Some(action) => action,
            None => {
                // protocol error: no transition defined
                warn!("event {} has no transition in state {}", code, self.state);
                Action::Aa8
            }
        };
        trace!("{} in {}: {:?}", code, self.state, action);
        let next = self.perform(action, event);
        self.set_state(next);
    }

    /// Perform the side effects of one action,
    /// returning the state to move to.
    fn perform(&mut self, action: Action, event: Event) -> State {
        match action {
            Action::Ae1 => {
                // issue transport connect request
                if let Event::AssociateRequest(request) = event {
                    self.pending_request = Some(request);
                }
                let peer = match &self.transport {
                    Transport::Unconnected(peer) => Some(*peer),
                    _ => None,
                };
                match peer.map(TcpStream::connect) {
                    Some(Ok(stream)) => {
                        prepare_stream(&stream);
                        self.transport = Transport::Open(stream);
                        self.events.push_back(Event::TransportConnect);
                    }
                    Some(Err(e)) => {
                        debug!("could not connect to peer: {}", e);
                        self.events.push_back(Event::TransportClosed);
                    }
                    None => {
                        self.events.push_back(Event::TransportClosed);
                    }
                }
            }
            Action::Ae2 => {
                // send the stored A-ASSOCIATE-RQ PDU
                if let Some(request) = self.pending_request.take() {
                    self.send_pdu(&Pdu::AssociationRQ(request));
                }
            }
            Action::Ae3 => {
                if let Event::ReceivedAssociateAc(ac) = event {
                    self.to_user.push(Primitive::AssociateAc(ac));
                }
            }
            Action::Ae4 => {
                if let Event::ReceivedAssociateRj(rj) = event {
                    self.to_user.push(Primitive::AssociateRj(rj));
                }
                self.close_transport();
            }
            Action::Ae5 => {
                // transport connection accepted; await the A-ASSOCIATE-RQ
                self.artim.start();
            }
            Action::Ae6 => {
                self.artim.stop();
                if let Event::ReceivedAssociateRq(rq) = event {
                    self.to_user.push(Primitive::AssociateRq(rq));
                }
            }
            Action::Ae7 => {
                if let Event::AssociateResponseAccept(ac) = event {
                    self.send_pdu(&Pdu::AssociationAC(ac));
                }
            }
            Action::Ae8 => {
                if let Event::AssociateResponseReject(rj) = event {
                    self.send_pdu(&Pdu::AssociationRJ(rj));
                }
                self.artim.start();
            }
            Action::Dt1 | Action::Ar7 => {
                if let Event::PDataRequest(data) = event {
                    self.send_pdu(&Pdu::PData { data });
                }
            }
            Action::Dt2 | Action::Ar6 => {
                if let Event::ReceivedPData(data) = event {
                    self.to_user.push(Primitive::PData(data));
                }
            }
            Action::Ar1 => {
                self.send_pdu(&Pdu::ReleaseRQ);
            }
            Action::Ar2 | Action::Ar8 => {
                self.to_user.push(Primitive::ReleaseRq);
            }
            Action::Ar3 => {
                self.to_user.push(Primitive::ReleaseRp);
                self.close_transport();
            }
            Action::Ar4 => {
                self.send_pdu(&Pdu::ReleaseRP);
                self.artim.start();
            }
            Action::Ar5 => {
                self.artim.stop();
            }
            Action::Ar9 => {
                self.send_pdu(&Pdu::ReleaseRP);
            }
            Action::Ar10 => {
                self.to_user.push(Primitive::ReleaseRp);
            }
            Action::Aa1 => {
                // a user-requested abort carries its own source;
                // anything else at this point is a provider abort
                let source = match (&event, self.state) {
                    (Event::AbortRequest(source), _) => *source,
                    (_, State::Sta2) => AbortRQSource::ServiceProvider(provider_reason(&event)),
                    _ => AbortRQSource::ServiceUser,
                };
                self.send_pdu(&Pdu::AbortRQ { source });
                self.artim.start();
            }
            Action::Aa2 => {
                self.artim.stop();
                self.close_transport();
            }
            Action::Aa3 => {
                if let Event::ReceivedAbort(source) = event {
                    self.to_user.push(Primitive::Abort { source });
                }
                self.close_transport();
            }
            Action::Aa4 => {
                self.to_user.push(Primitive::Abort {
                    source: AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::ReasonNotSpecified,
                    ),
                });
            }
            Action::Aa5 => {
                self.artim.stop();
            }
            Action::Aa6 => {
                // ignore the PDU
            }
            Action::Aa7 => {
                self.send_pdu(&Pdu::AbortRQ {
                    source: AbortRQSource::ServiceProvider(provider_reason(&event)),
                });
            }
            Action::Aa8 => {
                let source = AbortRQSource::ServiceProvider(provider_reason(&event));
                self.send_pdu(&Pdu::AbortRQ { source });
                self.to_user.push(Primitive::Abort { source });
                self.artim.start();
            }
        }

        action.next_state(self.requestor)
    }

    fn send_pdu(&mut self, pdu: &Pdu) {
        let stream = match &mut self.transport {
            Transport::Open(stream) => stream,
            _ => {
                debug!("no transport to send {}", pdu.short_description());
                return;
            }
        };

        let mut bytes = Vec::new();
        if let Err(e) = write_pdu(&mut bytes, pdu) {
            warn!("could not encode {}: {}", pdu.short_description(), e);
            return;
        }
        debug!("sending {}", pdu.short_description());
        if let Err(e) = stream.write_all(&bytes) {
            debug!("transport write error: {}", e);
            self.close_transport();
            self.events.push_back(Event::TransportClosed);
        }
    }

    fn close_transport(&mut self) {
        if let Transport::Open(stream) = &self.transport {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.transport = Transport::Closed;
        self.read_buffer.clear();
        // no timer survives a terminal transition
        self.artim.stop();
    }
}

/// Put the stream in the mode the service loop expects:
/// reads block for at most a millisecond, writes are unbuffered.
fn prepare_stream(stream: &TcpStream) {
    let _ = stream.set_read_timeout(Some(Duration::from_millis(1)));
    let _ = stream.set_nodelay(true);
}

/// The provider abort reason for a protocol error triggered by `event`.
fn provider_reason(event: &Event) -> AbortRQServiceProviderReason {
    match event {
        Event::InvalidPdu(_) => AbortRQServiceProviderReason::UnrecognizedPdu,
        _ => AbortRQServiceProviderReason::UnexpectedPdu,
    }
}

/// Map a received PDU to its state machine event.
fn pdu_to_event(pdu: Pdu) -> Event {
    match pdu {
        Pdu::AssociationRQ(rq) => Event::ReceivedAssociateRq(rq),
        Pdu::AssociationAC(ac) => Event::ReceivedAssociateAc(ac),
        Pdu::AssociationRJ(rj) => Event::ReceivedAssociateRj(rj),
        Pdu::PData { data } => Event::ReceivedPData(data),
        Pdu::ReleaseRQ => Event::ReceivedReleaseRq,
        Pdu::ReleaseRP => Event::ReceivedReleaseRp,
        Pdu::AbortRQ { source } => Event::ReceivedAbort(source),
        Pdu::Unknown { pdu_type, .. } => Event::InvalidPdu(pdu_type),
    }
}

/// Map a user primitive to its state machine event.
fn primitive_to_event(primitive: Primitive) -> Event {
    match primitive {
        Primitive::AssociateRq(rq) => Event::AssociateRequest(rq),
        Primitive::AssociateAc(ac) => Event::AssociateResponseAccept(ac),
        Primitive::AssociateRj(rj) => Event::AssociateResponseReject(rj),
        Primitive::PData(data) => Event::PDataRequest(data),
        Primitive::ReleaseRq => Event::ReleaseRequest,
        Primitive::ReleaseRp => Event::ReleaseResponse,
        Primitive::Abort { source } => Event::AbortRequest(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{PresentationContextProposed, UserVariableItem};
    use std::net::TcpListener;

    fn test_request() -> AssociationRQ {
        AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "TEST-SCU".to_string(),
            called_ae_title: "TEST-SCP".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            }],
            user_variables: vec![
                UserVariableItem::MaxLength(16_384),
                UserVariableItem::ImplementationClassUID("1.2.3.4".to_string()),
            ],
        }
    }

    #[test]
    fn requestor_delivers_association_indication_to_acceptor() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server_addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let provider =
                UlProvider::from_stream(stream, UlProviderOptions::default()).unwrap();
            let primitive = provider.receive(Some(Duration::from_secs(5)));
            match primitive {
                Some(Primitive::AssociateRq(rq)) => {
                    assert_eq!(rq.calling_ae_title, "TEST-SCU");
                    assert_eq!(rq.presentation_contexts.len(), 1);
                }
                other => panic!("Expected A-ASSOCIATE indication, got {:?}", other),
            }
            // the indication is delivered just before the transition applies
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while provider.state() != State::Sta3 && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            assert_eq!(provider.state(), State::Sta3);
        });

        let scu = UlProvider::connect(server_addr, UlProviderOptions::default()).unwrap();
        scu.send(Primitive::AssociateRq(test_request()));

        server.join().unwrap();
        // the requestor is now waiting for the response
        assert_eq!(scu.state(), State::Sta5);
    }

    #[test]
    fn stop_fails_outside_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server_addr = listener.local_addr().unwrap();
        let guard = std::thread::spawn(move || listener.accept().unwrap());

        let mut scu = UlProvider::connect(server_addr, UlProviderOptions::default()).unwrap();
        scu.send(Primitive::AssociateRq(test_request()));

        // wait for the request to leave
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while scu.state() != State::Sta5 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(scu.state(), State::Sta5);
        assert!(matches!(scu.stop(), Err(Error::NotIdle)));

        scu.kill();
        guard.join().unwrap();
    }

    #[test]
    fn peer_abort_is_indicated() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server_addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            // swallow the association request, then abort
            let mut buffer = [0u8; 4096];
            let _ = stream.read(&mut buffer);
            let mut bytes = Vec::new();
            write_pdu(
                &mut bytes,
                &Pdu::AbortRQ {
                    source: AbortRQSource::ServiceUser,
                },
            )
            .unwrap();
            stream.write_all(&bytes).unwrap();
        });

        let scu = UlProvider::connect(server_addr, UlProviderOptions::default()).unwrap();
        scu.send(Primitive::AssociateRq(test_request()));

        match scu.receive(Some(Duration::from_secs(5))) {
            Some(Primitive::Abort {
                source: AbortRQSource::ServiceUser,
            }) => {}
            other => panic!("Expected abort indication, got {:?}", other),
        }
        server.join().unwrap();
        assert_eq!(scu.state(), State::Sta1);
    }
}
