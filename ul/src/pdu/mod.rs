//! Protocol data unit module
//!
//! This module comprises the data structures for the seven protocol data
//! units (PDUs) of the DICOM Upper Layer protocol, as well as the items and
//! sub-items nested within them. The [`reader`] and [`writer`] submodules
//! hold the binary decoder and encoder, respectively.

pub mod reader;
pub mod writer;

pub use reader::read_pdu;
pub use writer::write_pdu;

#[cfg(test)]
mod test;

/// The default maximum PDU size
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size,
/// as specified by the standard
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The maximum PDU size,
/// as specified by the standard
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The length of the PDU header in bytes,
/// comprising the PDU type (1 byte),
/// reserved byte (1 byte),
/// and PDU length (4 bytes).
pub const PDU_HEADER_SIZE: u32 = 6;

/// The overhead of encapsulating a single presentation data value
/// in a P-Data PDU:
/// the PDV item length (4 bytes),
/// the presentation context ID (1 byte)
/// and the message control header (1 byte).
pub const PDATA_VALUE_OVERHEAD: u32 = 6;

/// An in-memory representation of a full Protocol Data Unit.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum Pdu {
    /// A-ASSOCIATE-RQ (0x01)
    AssociationRQ(AssociationRQ),
    /// A-ASSOCIATE-AC (0x02)
    AssociationAC(AssociationAC),
    /// A-ASSOCIATE-RJ (0x03)
    AssociationRJ(AssociationRJ),
    /// P-DATA-TF (0x04)
    PData {
        /// the presentation data values
        data: Vec<PDataValue>,
    },
    /// A-RELEASE-RQ (0x05)
    ReleaseRQ,
    /// A-RELEASE-RP (0x06)
    ReleaseRP,
    /// A-ABORT (0x07)
    AbortRQ {
        /// the source of the abort
        source: AbortRQSource,
    },
    /// Any PDU with an unrecognized type code.
    ///
    /// Receiving one of these over the wire
    /// translates to the "invalid PDU" event of the state machine.
    Unknown {
        /// the PDU type code found
        pdu_type: u8,
        /// the raw contents after the PDU header
        data: Vec<u8>,
    },
}

impl Pdu {
    /// A short name for the PDU variant, for logging.
    pub fn short_description(&self) -> &'static str {
        match self {
            Pdu::AssociationRQ { .. } => "A-ASSOCIATE-RQ",
            Pdu::AssociationAC { .. } => "A-ASSOCIATE-AC",
            Pdu::AssociationRJ { .. } => "A-ASSOCIATE-RJ",
            Pdu::PData { .. } => "P-DATA-TF",
            Pdu::ReleaseRQ => "A-RELEASE-RQ",
            Pdu::ReleaseRP => "A-RELEASE-RP",
            Pdu::AbortRQ { .. } => "A-ABORT",
            Pdu::Unknown { .. } => "Unknown",
        }
    }
}

/// The contents of an association request (A-ASSOCIATE-RQ).
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct AssociationRQ {
    /// the protocol version (bit 0 set for version 1)
    pub protocol_version: u16,
    /// the source application entity title
    pub calling_ae_title: String,
    /// the destination application entity title
    pub called_ae_title: String,
    /// the requested application context name
    pub application_context_name: String,
    /// the proposed presentation contexts
    pub presentation_contexts: Vec<PresentationContextProposed>,
    /// the user information sub-items
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationRQ> for Pdu {
    fn from(value: AssociationRQ) -> Self {
        Pdu::AssociationRQ(value)
    }
}

/// The contents of an association acknowledgement (A-ASSOCIATE-AC).
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct AssociationAC {
    /// the protocol version (bit 0 set for version 1)
    pub protocol_version: u16,
    /// the destination AE title, echoed from the request
    pub called_ae_title: String,
    /// the source AE title, echoed from the request
    pub calling_ae_title: String,
    /// the accorded application context name
    pub application_context_name: String,
    /// the results of presentation context negotiation
    pub presentation_contexts: Vec<PresentationContextResult>,
    /// the user information sub-items
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationAC> for Pdu {
    fn from(value: AssociationAC) -> Self {
        Pdu::AssociationAC(value)
    }
}

/// The contents of an association rejection (A-ASSOCIATE-RJ).
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct AssociationRJ {
    /// whether the rejection is permanent or transient
    pub result: AssociationRJResult,
    /// the source of the rejection, including the reason/diagnostic code
    pub source: AssociationRJSource,
}

impl From<AssociationRJ> for Pdu {
    fn from(value: AssociationRJ) -> Self {
        Pdu::AssociationRJ(value)
    }
}

/// A proposed presentation context,
/// as carried in an A-ASSOCIATE-RQ PDU.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextProposed {
    /// the presentation context identifier,
    /// an odd integer between 1 and 255
    pub id: u8,
    /// the abstract syntax UID
    pub abstract_syntax: String,
    /// the proposed transfer syntax UIDs, in order of preference
    pub transfer_syntaxes: Vec<String>,
}

/// The outcome of negotiating a single presentation context,
/// as carried in an A-ASSOCIATE-AC PDU.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextResult {
    /// the presentation context identifier from the proposal
    pub id: u8,
    /// the result of the negotiation
    pub reason: PresentationContextResultReason,
    /// the accorded transfer syntax
    /// (only significant when the reason is `Acceptance`)
    pub transfer_syntax: String,
}

/// The result code of a presentation context negotiation.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PresentationContextResultReason {
    /// 0 - acceptance
    Acceptance = 0,
    /// 1 - user rejection
    UserRejection = 1,
    /// 2 - no reason (provider rejection)
    NoReason = 2,
    /// 3 - abstract syntax not supported (provider rejection)
    AbstractSyntaxNotSupported = 3,
    /// 4 - transfer syntaxes not supported (provider rejection)
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    pub fn from(reason: u8) -> Option<Self> {
        match reason {
            0 => Some(PresentationContextResultReason::Acceptance),
            1 => Some(PresentationContextResultReason::UserRejection),
            2 => Some(PresentationContextResultReason::NoReason),
            3 => Some(PresentationContextResultReason::AbstractSyntaxNotSupported),
            4 => Some(PresentationContextResultReason::TransferSyntaxesNotSupported),
            _ => None,
        }
    }
}

/// Whether an association rejection is permanent or transient.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJResult {
    /// 1 - rejected-permanent
    Permanent,
    /// 2 - rejected-transient
    Transient,
}

impl AssociationRJResult {
    pub fn from(value: u8) -> Option<Self> {
        match value {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            AssociationRJResult::Permanent => 1,
            AssociationRJResult::Transient => 2,
        }
    }
}

/// The source of an association rejection,
/// with the respective reason/diagnostic code.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJSource {
    /// 1 - DICOM UL service-user
    ServiceUser(AssociationRJServiceUserReason),
    /// 2 - DICOM UL service-provider (ACSE related function)
    ServiceProviderAcse(AssociationRJServiceProviderAcseReason),
    /// 3 - DICOM UL service-provider (presentation related function)
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    pub fn from(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (1, 1) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::NoReasonGiven,
            )),
            (1, 2) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            )),
            (1, 3) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized,
            )),
            (1, 7) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            )),
            (1, x @ 4..=6) | (1, x @ 8..=10) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::Reserved(x),
            )),
            (2, 1) => Some(AssociationRJSource::ServiceProviderAcse(
                AssociationRJServiceProviderAcseReason::NoReasonGiven,
            )),
            (2, 2) => Some(AssociationRJSource::ServiceProviderAcse(
                AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported,
            )),
            (3, 1) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
            )),
            (3, 2) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            )),
            (3, x) if x == 0 || (3..=7).contains(&x) => {
                Some(AssociationRJSource::ServiceProviderPresentation(
                    AssociationRJServiceProviderPresentationReason::Reserved(x),
                ))
            }
            _ => None,
        }
    }

    /// The (source, reason) byte pair on the wire.
    pub fn codes(self) -> (u8, u8) {
        match self {
            AssociationRJSource::ServiceUser(r) => (
                1,
                match r {
                    AssociationRJServiceUserReason::NoReasonGiven => 1,
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported => 2,
                    AssociationRJServiceUserReason::CallingAETitleNotRecognized => 3,
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized => 7,
                    AssociationRJServiceUserReason::Reserved(x) => x,
                },
            ),
            AssociationRJSource::ServiceProviderAcse(r) => (
                2,
                match r {
                    AssociationRJServiceProviderAcseReason::NoReasonGiven => 1,
                    AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported => 2,
                },
            ),
            AssociationRJSource::ServiceProviderPresentation(r) => (
                3,
                match r {
                    AssociationRJServiceProviderPresentationReason::TemporaryCongestion => 1,
                    AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 2,
                    AssociationRJServiceProviderPresentationReason::Reserved(x) => x,
                },
            ),
        }
    }
}

/// Rejection diagnostics when the source is the service user.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceUserReason {
    /// 1 - no-reason-given
    NoReasonGiven,
    /// 2 - application-context-name-not-supported
    ApplicationContextNameNotSupported,
    /// 3 - calling-AE-title-not-recognized
    CallingAETitleNotRecognized,
    /// 7 - called-AE-title-not-recognized
    CalledAETitleNotRecognized,
    /// 4-6, 8-10 - reserved
    Reserved(u8),
}

/// Rejection diagnostics when the source is
/// the service provider (ACSE related function).
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderAcseReason {
    /// 1 - no-reason-given
    NoReasonGiven,
    /// 2 - protocol-version-not-supported
    ProtocolVersionNotSupported,
}

/// Rejection diagnostics when the source is
/// the service provider (presentation related function).
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderPresentationReason {
    /// 1 - temporary-congestion
    TemporaryCongestion,
    /// 2 - local-limit-exceeded
    LocalLimitExceeded,
    /// 0, 3-7 - reserved
    Reserved(u8),
}

/// A single presentation data value,
/// one fragment of a DIMSE message.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PDataValue {
    /// the identifier of the presentation context of the message
    pub presentation_context_id: u8,
    /// whether the fragment is part of a command set or a data set
    pub value_type: PDataValueType,
    /// whether this is the last fragment
    /// of the respective command or data set
    pub is_last: bool,
    /// the fragment payload
    pub data: Vec<u8>,
}

/// The kind of content in a presentation data value fragment.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PDataValueType {
    /// message control header bit 0 set: a command set fragment
    Command,
    /// message control header bit 0 clear: a data set fragment
    Data,
}

/// The source of an A-ABORT,
/// with the provider reason where applicable.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQSource {
    /// 0 - DICOM UL service-user
    ServiceUser,
    /// 2 - DICOM UL service-provider (A-P-ABORT)
    ServiceProvider(AbortRQServiceProviderReason),
    /// 1 - reserved
    Reserved,
}

impl AbortRQSource {
    pub fn from(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (0, _) => Some(AbortRQSource::ServiceUser),
            (1, _) => Some(AbortRQSource::Reserved),
            (2, 0) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecified,
            )),
            (2, 1) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPdu,
            )),
            (2, 2) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPdu,
            )),
            (2, 3) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::Reserved,
            )),
            (2, 4) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPduParameter,
            )),
            (2, 5) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPduParameter,
            )),
            (2, 6) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::InvalidPduParameter,
            )),
            _ => None,
        }
    }

    /// The (source, reason) byte pair on the wire.
    pub fn codes(self) -> (u8, u8) {
        match self {
            AbortRQSource::ServiceUser => (0, 0),
            AbortRQSource::Reserved => (1, 0),
            AbortRQSource::ServiceProvider(r) => (
                2,
                match r {
                    AbortRQServiceProviderReason::ReasonNotSpecified => 0,
                    AbortRQServiceProviderReason::UnrecognizedPdu => 1,
                    AbortRQServiceProviderReason::UnexpectedPdu => 2,
                    AbortRQServiceProviderReason::Reserved => 3,
                    AbortRQServiceProviderReason::UnrecognizedPduParameter => 4,
                    AbortRQServiceProviderReason::UnexpectedPduParameter => 5,
                    AbortRQServiceProviderReason::InvalidPduParameter => 6,
                },
            ),
        }
    }
}

/// The reason of an A-P-ABORT initiated by the service provider.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQServiceProviderReason {
    /// 0 - reason-not-specified
    ReasonNotSpecified,
    /// 1 - unrecognized-PDU
    UnrecognizedPdu,
    /// 2 - unexpected-PDU
    UnexpectedPdu,
    /// 3 - reserved
    Reserved,
    /// 4 - unrecognized-PDU parameter
    UnrecognizedPduParameter,
    /// 5 - unexpected-PDU parameter
    UnexpectedPduParameter,
    /// 6 - invalid-PDU-parameter value
    InvalidPduParameter,
}

/// A variable item directly nested in an association PDU.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum PduVariableItem {
    /// any item with an unrecognized type code
    Unknown(u8),
    /// application context item (0x10)
    ApplicationContext(String),
    /// presentation context item of an A-ASSOCIATE-RQ (0x20)
    PresentationContextProposed(PresentationContextProposed),
    /// presentation context item of an A-ASSOCIATE-AC (0x21)
    PresentationContextResult(PresentationContextResult),
    /// user information item (0x50)
    UserVariables(Vec<UserVariableItem>),
}

/// A sub-item of the user information item.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum UserVariableItem {
    /// any sub-item with an unrecognized type code,
    /// kept verbatim so that acceptors can echo it back
    Unknown(u8, Vec<u8>),
    /// maximum length sub-item (0x51)
    MaxLength(u32),
    /// implementation class UID sub-item (0x52)
    ImplementationClassUID(String),
    /// asynchronous operations window sub-item (0x53):
    /// maximum number of operations invoked, maximum number performed
    AsyncOperationsWindow(u16, u16),
    /// SCP/SCU role selection sub-item (0x54)
    RoleSelection(RoleSelection),
    /// implementation version name sub-item (0x55)
    ImplementationVersionName(String),
    /// SOP class extended negotiation sub-item (0x56):
    /// SOP class UID, service class application information
    SopClassExtendedNegotiation(String, Vec<u8>),
    /// SOP class common extended negotiation sub-item (0x57)
    SopClassCommonExtendedNegotiation(CommonExtendedNegotiation),
    /// user identity negotiation sub-item of an A-ASSOCIATE-RQ (0x58)
    UserIdentity(UserIdentity),
    /// user identity negotiation sub-item of an A-ASSOCIATE-AC (0x59):
    /// the server response field
    UserIdentityResponse(Vec<u8>),
}

/// The SCP/SCU role selection for one SOP class,
/// as negotiated through sub-item 0x54.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct RoleSelection {
    /// the SOP class UID the roles apply to
    pub sop_class_uid: String,
    /// whether the association requestor takes the SCU role
    pub scu_role: bool,
    /// whether the association requestor takes the SCP role
    pub scp_role: bool,
}

/// The SOP class common extended negotiation fields of sub-item 0x57.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct CommonExtendedNegotiation {
    /// the SOP class UID
    pub sop_class_uid: String,
    /// the service class UID
    pub service_class_uid: String,
    /// the related general SOP class UIDs
    pub related_general_sop_class_uids: Vec<String>,
}

/// The kind of credential carried in a user identity negotiation item.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum UserIdentityType {
    /// 1 - username
    Username,
    /// 2 - username and passcode
    UsernameAndPasscode,
    /// 3 - Kerberos service ticket
    KerberosServiceTicket,
    /// 4 - SAML assertion
    SamlAssertion,
}

impl UserIdentityType {
    pub fn from(value: u8) -> Option<Self> {
        match value {
            1 => Some(UserIdentityType::Username),
            2 => Some(UserIdentityType::UsernameAndPasscode),
            3 => Some(UserIdentityType::KerberosServiceTicket),
            4 => Some(UserIdentityType::SamlAssertion),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            UserIdentityType::Username => 1,
            UserIdentityType::UsernameAndPasscode => 2,
            UserIdentityType::KerberosServiceTicket => 3,
            UserIdentityType::SamlAssertion => 4,
        }
    }
}

/// The user identity negotiation request fields of sub-item 0x58.
///
/// The secondary field is only significant
/// when the identity type is username and passcode.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct UserIdentity {
    positive_response_requested: bool,
    identity_type: UserIdentityType,
    primary_field: Vec<u8>,
    secondary_field: Vec<u8>,
}

impl UserIdentity {
    pub fn new(
        positive_response_requested: bool,
        identity_type: UserIdentityType,
        primary_field: Vec<u8>,
        secondary_field: Vec<u8>,
    ) -> Self {
        UserIdentity {
            positive_response_requested,
            identity_type,
            primary_field,
            secondary_field,
        }
    }

    /// Whether the requestor asked for a positive server response.
    pub fn positive_response_requested(&self) -> bool {
        self.positive_response_requested
    }

    /// The kind of credential in the primary field.
    pub fn identity_type(&self) -> UserIdentityType {
        self.identity_type
    }

    /// The primary credential field.
    pub fn primary_field(&self) -> &[u8] {
        &self.primary_field
    }

    /// The secondary credential field (the passcode).
    pub fn secondary_field(&self) -> &[u8] {
        &self.secondary_field
    }
}

pub(crate) mod text {
    //! ISO 646 (basic G0 set) text handling for PDU fields.
    //!
    //! AE titles and UIDs in PDUs are restricted to this repertoire;
    //! anything outside of it is a malformed field.

    /// Decode an ISO 646 byte slice,
    /// trimming insignificant padding (spaces and trailing NULs).
    pub(crate) fn decode_text(bytes: &[u8]) -> Option<String> {
        if !bytes.is_ascii() {
            return None;
        }
        let text = std::str::from_utf8(bytes).ok()?;
        Some(text.trim_matches(|c| c == ' ' || c == '\0').to_string())
    }

    /// Encode text as ISO 646 bytes.
    pub(crate) fn encode_text(text: &str) -> Option<Vec<u8>> {
        if !text.is_ascii() {
            return None;
        }
        Some(text.as_bytes().to_vec())
    }

    /// Encode a UID, padding with a trailing NUL to an even length.
    pub(crate) fn encode_uid(uid: &str) -> Option<Vec<u8>> {
        let mut bytes = encode_text(uid)?;
        if bytes.len() % 2 != 0 {
            bytes.push(0);
        }
        Some(bytes)
    }
}
