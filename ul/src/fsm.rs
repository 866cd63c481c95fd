//! The upper layer protocol state machine.
//!
//! This module holds the pure part of the machine:
//! the thirteen protocol states,
//! the event and action vocabularies,
//! and the transition table of PS3.8 section 9.2.
//! Side effects (sending PDUs, delivering primitives, driving timers)
//! are the service provider's job —
//! it looks up the transition for each consumed event
//! and performs the named action,
//! moving to the action's outcome state.

use crate::pdu::{
    AbortRQSource, AssociationAC, AssociationRJ, AssociationRQ, PDataValue,
};

/// The states of the protocol machine.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum State {
    /// Sta1 - idle
    Sta1,
    /// Sta2 - transport connection open,
    /// awaiting an A-ASSOCIATE-RQ PDU
    Sta2,
    /// Sta3 - awaiting the local A-ASSOCIATE response primitive
    Sta3,
    /// Sta4 - awaiting transport connection opening to complete
    /// (association requestor)
    Sta4,
    /// Sta5 - awaiting an A-ASSOCIATE-AC or A-ASSOCIATE-RJ PDU
    Sta5,
    /// Sta6 - association established and ready for data transfer
    Sta6,
    /// Sta7 - awaiting an A-RELEASE-RP PDU
    Sta7,
    /// Sta8 - awaiting the local A-RELEASE response primitive
    Sta8,
    /// Sta9 - release collision requestor side:
    /// awaiting the A-RELEASE response primitive
    Sta9,
    /// Sta10 - release collision acceptor side:
    /// awaiting an A-RELEASE-RP PDU
    Sta10,
    /// Sta11 - release collision requestor side:
    /// awaiting an A-RELEASE-RP PDU
    Sta11,
    /// Sta12 - release collision acceptor side:
    /// awaiting the A-RELEASE response primitive
    Sta12,
    /// Sta13 - awaiting the transport connection to close
    Sta13,
}

impl State {
    /// The state number, 1 to 13.
    pub fn code(self) -> u8 {
        match self {
            State::Sta1 => 1,
            State::Sta2 => 2,
            State::Sta3 => 3,
            State::Sta4 => 4,
            State::Sta5 => 5,
            State::Sta6 => 6,
            State::Sta7 => 7,
            State::Sta8 => 8,
            State::Sta9 => 9,
            State::Sta10 => 10,
            State::Sta11 => 11,
            State::Sta12 => 12,
            State::Sta13 => 13,
        }
    }

    /// The state for a number between 1 and 13.
    pub fn from_code(code: u8) -> Option<State> {
        match code {
            1 => Some(State::Sta1),
            2 => Some(State::Sta2),
            3 => Some(State::Sta3),
            4 => Some(State::Sta4),
            5 => Some(State::Sta5),
            6 => Some(State::Sta6),
            7 => Some(State::Sta7),
            8 => Some(State::Sta8),
            9 => Some(State::Sta9),
            10 => Some(State::Sta10),
            11 => Some(State::Sta11),
            12 => Some(State::Sta12),
            13 => Some(State::Sta13),
            _ => None,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// An event consumed by the protocol machine,
/// together with its payload where one applies.
#[derive(Clone, Debug)]
pub enum Event {
    /// Evt1 - A-ASSOCIATE request primitive (local user)
    AssociateRequest(AssociationRQ),
    /// Evt2 - transport connection confirmation (local transport service)
    TransportConnect,
    /// Evt3 - A-ASSOCIATE-AC PDU received
    ReceivedAssociateAc(AssociationAC),
    /// Evt4 - A-ASSOCIATE-RJ PDU received
    ReceivedAssociateRj(AssociationRJ),
    /// Evt5 - transport connection indication (remote node)
    TransportIndication,
    /// Evt6 - A-ASSOCIATE-RQ PDU received
    ReceivedAssociateRq(AssociationRQ),
    /// Evt7 - A-ASSOCIATE (accept) response primitive (local user)
    AssociateResponseAccept(AssociationAC),
    /// Evt8 - A-ASSOCIATE (reject) response primitive (local user)
    AssociateResponseReject(AssociationRJ),
    /// Evt9 - P-DATA request primitive (local user)
    PDataRequest(Vec<PDataValue>),
    /// Evt10 - P-DATA-TF PDU received
    ReceivedPData(Vec<PDataValue>),
    /// Evt11 - A-RELEASE request primitive (local user)
    ReleaseRequest,
    /// Evt12 - A-RELEASE-RQ PDU received
    ReceivedReleaseRq,
    /// Evt13 - A-RELEASE-RP PDU received
    ReceivedReleaseRp,
    /// Evt14 - A-RELEASE response primitive (local user)
    ReleaseResponse,
    /// Evt15 - A-ABORT request primitive (local user)
    AbortRequest(AbortRQSource),
    /// Evt16 - A-ABORT PDU received
    ReceivedAbort(AbortRQSource),
    /// Evt17 - transport connection closed indication
    TransportClosed,
    /// Evt18 - ARTIM timer expired
    ArtimExpired,
    /// Evt19 - unrecognized or invalid PDU received
    InvalidPdu(u8),
}

impl Event {
    /// The event code, stripped of payload.
    pub fn code(&self) -> EventCode {
        match self {
            Event::AssociateRequest(_) => EventCode::Evt1,
            Event::TransportConnect => EventCode::Evt2,
            Event::ReceivedAssociateAc(_) => EventCode::Evt3,
            Event::ReceivedAssociateRj(_) => EventCode::Evt4,
            Event::TransportIndication => EventCode::Evt5,
            Event::ReceivedAssociateRq(_) => EventCode::Evt6,
            Event::AssociateResponseAccept(_) => EventCode::Evt7,
            Event::AssociateResponseReject(_) => EventCode::Evt8,
            Event::PDataRequest(_) => EventCode::Evt9,
            Event::ReceivedPData(_) => EventCode::Evt10,
            Event::ReleaseRequest => EventCode::Evt11,
            Event::ReceivedReleaseRq => EventCode::Evt12,
            Event::ReceivedReleaseRp => EventCode::Evt13,
            Event::ReleaseResponse => EventCode::Evt14,
            Event::AbortRequest(_) => EventCode::Evt15,
            Event::ReceivedAbort(_) => EventCode::Evt16,
            Event::TransportClosed => EventCode::Evt17,
            Event::ArtimExpired => EventCode::Evt18,
            Event::InvalidPdu(_) => EventCode::Evt19,
        }
    }
}

/// The bare event codes of PS3.8 table 9-10.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum EventCode {
    Evt1,
    Evt2,
    Evt3,
    Evt4,
    Evt5,
    Evt6,
    Evt7,
    Evt8,
    Evt9,
    Evt10,
    Evt11,
    Evt12,
    Evt13,
    Evt14,
    Evt15,
    Evt16,
    Evt17,
    Evt18,
    Evt19,
}

impl std::fmt::Display for EventCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// The actions of PS3.8 table 9-10.
///
/// Each action names the side effects the provider must perform
/// before entering the action's outcome state:
///
/// - `Ae1`: issue a transport connect request to the peer
/// - `Ae2`: send the A-ASSOCIATE-RQ PDU
/// - `Ae3`: deliver the A-ASSOCIATE (accept) confirmation primitive
/// - `Ae4`: deliver the A-ASSOCIATE (reject) confirmation primitive
///   and close the transport connection
/// - `Ae5`: accept the inbound transport connection and start ARTIM
/// - `Ae6`: stop ARTIM and deliver the A-ASSOCIATE indication primitive
/// - `Ae7`: send the A-ASSOCIATE-AC PDU
/// - `Ae8`: send the A-ASSOCIATE-RJ PDU and start ARTIM
/// - `Dt1`: send the P-DATA-TF PDU
/// - `Dt2`: deliver the P-DATA indication primitive
/// - `Ar1`: send the A-RELEASE-RQ PDU
/// - `Ar2`: deliver the A-RELEASE indication primitive
/// - `Ar3`: deliver the A-RELEASE confirmation primitive
///   and close the transport connection
/// - `Ar4`: send the A-RELEASE-RP PDU and start ARTIM
/// - `Ar5`: stop ARTIM
/// - `Ar6`: deliver the P-DATA indication primitive
/// - `Ar7`: send the P-DATA-TF PDU
/// - `Ar8`: deliver the A-RELEASE indication primitive
///   (release collision)
/// - `Ar9`: send the A-RELEASE-RP PDU
/// - `Ar10`: deliver the A-RELEASE confirmation primitive
/// - `Aa1`: send the A-ABORT PDU (service-user source,
///   or service-provider when still awaiting the association request)
///   and start or restart ARTIM
/// - `Aa2`: stop ARTIM and close the transport connection
/// - `Aa3`: deliver the A-ABORT or A-P-ABORT indication primitive
///   and close the transport connection
/// - `Aa4`: deliver the A-P-ABORT indication primitive
/// - `Aa5`: stop ARTIM
/// - `Aa6`: ignore the PDU
/// - `Aa7`: send the A-ABORT PDU (service-provider source)
/// - `Aa8`: send the A-ABORT PDU (service-provider source),
///   deliver the A-P-ABORT indication primitive and start ARTIM
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Action {
    Ae1,
    Ae2,
    Ae3,
    Ae4,
    Ae5,
    Ae6,
    Ae7,
    Ae8,
    Dt1,
    Dt2,
    Ar1,
    Ar2,
    Ar3,
    Ar4,
    Ar5,
    Ar6,
    Ar7,
    Ar8,
    Ar9,
    Ar10,
    Aa1,
    Aa2,
    Aa3,
    Aa4,
    Aa5,
    Aa6,
    Aa7,
    Aa8,
}

impl Action {
    /// The state entered after performing this action.
    ///
    /// `requestor` tells whether the local node
    /// requested the association;
    /// it decides the outcome of the release collision action `Ar8`.
    pub fn next_state(self, requestor: bool) -> State {
        match self {
            Action::Ae1 => State::Sta4,
            Action::Ae2 => State::Sta5,
            Action::Ae3 => State::Sta6,
            Action::Ae4 => State::Sta1,
            Action::Ae5 => State::Sta2,
            Action::Ae6 => State::Sta3,
            Action::Ae7 => State::Sta6,
            Action::Ae8 => State::Sta13,
            Action::Dt1 => State::Sta6,
            Action::Dt2 => State::Sta6,
            Action::Ar1 => State::Sta7,
            Action::Ar2 => State::Sta8,
            Action::Ar3 => State::Sta1,
            Action::Ar4 => State::Sta13,
            Action::Ar5 => State::Sta1,
            Action::Ar6 => State::Sta7,
            Action::Ar7 => State::Sta8,
            Action::Ar8 => {
                if requestor {
                    State::Sta9
                } else {
                    State::Sta10
                }
            }
            Action::Ar9 => State::Sta11,
            Action::Ar10 => State::Sta12,
            Action::Aa1 => State::Sta13,
            Action::Aa2 => State::Sta1,
            Action::Aa3 => State::Sta1,
            Action::Aa4 => State::Sta1,
            Action::Aa5 => State::Sta1,
            Action::Aa6 => State::Sta13,
            Action::Aa7 => State::Sta13,
            Action::Aa8 => State::Sta13,
        }
    }
}

/// Look up the action for an event consumed in the given state,
/// per PS3.8 table 9-10.
///
/// `None` means the table defines no transition for the combination.
/// For events originating from the network,
/// the provider treats that case as a protocol error
/// and proceeds via [`Action::Aa8`].
pub fn transition(state: State, event: EventCode) -> Option<Action> {
    use Action::*;
    use EventCode::*;
    use State::*;

    match (event, state) {
        // A-ASSOCIATE request primitive
        (Evt1, Sta1) => Some(Ae1),

        // transport connection confirmation
        (Evt2, Sta4) => Some(Ae2),

        // A-ASSOCIATE-AC PDU received
        (Evt3, Sta2) => Some(Aa1),
        (Evt3, Sta3) => Some(Aa8),
        (Evt3, Sta5) => Some(Ae3),
        (Evt3, Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => Some(Aa8),
        (Evt3, Sta13) => Some(Aa6),

        // A-ASSOCIATE-RJ PDU received
        (Evt4, Sta2) => Some(Aa1),
        (Evt4, Sta3) => Some(Aa8),
        (Evt4, Sta5) => Some(Ae4),
        (Evt4, Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => Some(Aa8),
        (Evt4, Sta13) => Some(Aa6),

        // transport connection indication
        (Evt5, Sta1) => Some(Ae5),

        // A-ASSOCIATE-RQ PDU received
        (Evt6, Sta2) => Some(Ae6),
        (Evt6, Sta3 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => Some(Aa8),
        (Evt6, Sta13) => Some(Aa7),

        // A-ASSOCIATE response primitive (accept)
        (Evt7, Sta3) => Some(Ae7),

        // A-ASSOCIATE response primitive (reject)
        (Evt8, Sta3) => Some(Ae8),

        // P-DATA request primitive
        (Evt9, Sta6) => Some(Dt1),
        (Evt9, Sta8) => Some(Ar7),

        // P-DATA-TF PDU received
        (Evt10, Sta2) => Some(Aa1),
        (Evt10, Sta3 | Sta5) => Some(Aa8),
        (Evt10, Sta6) => Some(Dt2),
        (Evt10, Sta7) => Some(Ar6),
        (Evt10, Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => Some(Aa8),
        (Evt10, Sta13) => Some(Aa6),

        // A-RELEASE request primitive
        (Evt11, Sta6) => Some(Ar1),

        // A-RELEASE-RQ PDU received
        (Evt12, Sta2) => Some(Aa1),
        (Evt12, Sta3 | Sta5) => Some(Aa8),
        (Evt12, Sta6) => Some(Ar2),
        (Evt12, Sta7) => Some(Ar8),
        (Evt12, Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => Some(Aa8),
        (Evt12, Sta13) => Some(Aa6),

        // A-RELEASE-RP PDU received
        (Evt13, Sta2) => Some(Aa1),
        (Evt13, Sta3 | Sta5 | Sta6) => Some(Aa8),
        (Evt13, Sta7) => Some(Ar3),
        (Evt13, Sta8 | Sta9) => Some(Aa8),
        (Evt13, Sta10) => Some(Ar10),
        (Evt13, Sta11) => Some(Ar3),
        (Evt13, Sta12) => Some(Aa8),
        (Evt13, Sta13) => Some(Aa6),

        // A-RELEASE response primitive
        (Evt14, Sta8) => Some(Ar4),
        (Evt14, Sta9) => Some(Ar9),
        (Evt14, Sta12) => Some(Ar4),

        // A-ABORT request primitive
        (Evt15, Sta3) => Some(Aa1),
        (Evt15, Sta4) => Some(Aa2),
        (Evt15, Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => Some(Aa1),

        // A-ABORT PDU received
        (Evt16, Sta2) => Some(Aa2),
        (Evt16, Sta3 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => Some(Aa3),
        (Evt16, Sta13) => Some(Aa2),

        // transport connection closed indication
        (Evt17, Sta2) => Some(Aa5),
        (Evt17, Sta3 | Sta4 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => {
            Some(Aa4)
        }
        (Evt17, Sta13) => Some(Ar5),

        // ARTIM timer expired
        (Evt18, Sta2) => Some(Aa2),
        (Evt18, Sta13) => Some(Aa2),

        // unrecognized or invalid PDU received
        (Evt19, Sta2) => Some(Aa1),
        (Evt19, Sta3 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => Some(Aa8),
        (Evt19, Sta13) => Some(Aa7),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Walk a sequence of events through the table,
    /// always taking the action's outcome state.
    fn walk(start: State, requestor: bool, events: &[EventCode]) -> State {
        let mut state = start;
        for &event in events {
            let action = transition(state, event)
                .unwrap_or_else(|| panic!("no transition for {} in {}", event, state));
            state = action.next_state(requestor);
        }
        state
    }

    #[test]
    fn associate_request_happy_path() {
        use EventCode::*;
        // requestor: connect, send RQ, receive AC
        let state = walk(State::Sta1, true, &[Evt1, Evt2, Evt3]);
        assert_eq!(state, State::Sta6);
    }

    #[test]
    fn associate_accept_happy_path() {
        use EventCode::*;
        // acceptor: transport indication, receive RQ, local accept
        let state = walk(State::Sta1, false, &[Evt5, Evt6, Evt7]);
        assert_eq!(state, State::Sta6);
    }

    #[test]
    fn associate_reject_returns_to_idle() {
        use EventCode::*;
        // requestor receives an A-ASSOCIATE-RJ
        let state = walk(State::Sta1, true, &[Evt1, Evt2, Evt4]);
        assert_eq!(state, State::Sta1);
    }

    #[test]
    fn normal_release_requestor() {
        use EventCode::*;
        let state = walk(State::Sta1, true, &[Evt1, Evt2, Evt3, Evt11, Evt13]);
        assert_eq!(state, State::Sta1);
    }

    #[test]
    fn normal_release_acceptor() {
        use EventCode::*;
        // receive release request, answer it, then the transport closes
        let state = walk(State::Sta1, false, &[Evt5, Evt6, Evt7, Evt12, Evt14, Evt17]);
        assert_eq!(state, State::Sta1);
    }

    #[test]
    fn release_collision_requestor() {
        use EventCode::*;
        // both sides requested release; the requestor side goes
        // Sta7 -> Sta9 -> Sta11 and then receives the release response
        let state = walk(
            State::Sta1,
            true,
            &[Evt1, Evt2, Evt3, Evt11, Evt12, Evt14, Evt13],
        );
        assert_eq!(state, State::Sta1);
    }

    #[test]
    fn release_collision_acceptor() {
        use EventCode::*;
        // the acceptor side goes Sta7 -> Sta10 -> Sta12
        // and answers the release after its own confirmation
        let state = walk(
            State::Sta1,
            false,
            &[Evt5, Evt6, Evt7, Evt11, Evt12, Evt13, Evt14, Evt17],
        );
        assert_eq!(state, State::Sta1);
    }

    #[test]
    fn abort_during_data_transfer() {
        use EventCode::*;
        // peer abort goes straight back to idle
        let state = walk(State::Sta1, false, &[Evt5, Evt6, Evt7, Evt16]);
        assert_eq!(state, State::Sta1);

        // local abort waits for the transport to close
        let state = walk(State::Sta1, false, &[Evt5, Evt6, Evt7, Evt15]);
        assert_eq!(state, State::Sta13);
        let state = walk(state, false, &[Evt17]);
        assert_eq!(state, State::Sta1);
    }

    #[test]
    fn artim_expiry_closes_down() {
        use EventCode::*;
        // ARTIM fires while awaiting the association request
        let state = walk(State::Sta1, false, &[Evt5, Evt18]);
        assert_eq!(state, State::Sta1);
    }

    #[test]
    fn invalid_pdu_is_aborted() {
        use EventCode::*;
        let state = walk(State::Sta1, false, &[Evt5, Evt6, Evt7, Evt19]);
        assert_eq!(state, State::Sta13);
        // transport close indication completes the teardown
        let state = walk(state, false, &[Evt17]);
        assert_eq!(state, State::Sta1);
    }

    #[test]
    fn transport_close_from_every_state_reaches_idle() {
        // from any state with a live transport connection,
        // Evt17 must return the machine to Sta1
        for state in [
            State::Sta2,
            State::Sta3,
            State::Sta4,
            State::Sta5,
            State::Sta6,
            State::Sta7,
            State::Sta8,
            State::Sta9,
            State::Sta10,
            State::Sta11,
            State::Sta12,
            State::Sta13,
        ] {
            let action = transition(state, EventCode::Evt18)
                .or_else(|| transition(state, EventCode::Evt17));
            let next = action.expect("teardown must be defined").next_state(true);
            assert_eq!(next, State::Sta1, "from {}", state);
        }
    }

    #[test]
    fn undefined_combinations_have_no_transition() {
        // P-DATA request while idle
        assert_eq!(transition(State::Sta1, EventCode::Evt9), None);
        // release request before establishment
        assert_eq!(transition(State::Sta5, EventCode::Evt11), None);
        // associate request while a connection exists
        assert_eq!(transition(State::Sta6, EventCode::Evt1), None);
    }
}
