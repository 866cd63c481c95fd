//! DIMSE service parameters.
//!
//! One variant per service and direction,
//! mirroring the parameter lists of PS3.7 sections 9 and 10.
//! Every variant knows how to serialize itself into a command set
//! and back;
//! the mapping tables live here,
//! keyed by the command field (0000,0100) of the message.

use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

use crate::cmdset::{CommandSet, CommandValue};
use crate::commands::{tags, CommandField, Tag, DATA_SET_PRESENT, NO_DATA_SET};
use crate::status::Status;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// the command set has no command field element
    MissingCommandField { backtrace: Backtrace },

    #[snafu(display("unknown command field code {:#06X}", code))]
    UnknownCommandField { code: u16, backtrace: Backtrace },

    #[snafu(display("invalid priority code {}", code))]
    InvalidPriority { code: u16, backtrace: Backtrace },

    #[snafu(display("message requires a data set but none arrived"))]
    MissingDataSet { backtrace: Backtrace },

    /// a required command element is absent
    #[snafu(display("malformed command set"))]
    MalformedCommandSet {
        #[snafu(backtrace)]
        source: crate::cmdset::Error,
    },

    /// the status is out of range for the service
    #[snafu(display("invalid status for this message"))]
    BadStatus {
        #[snafu(backtrace)]
        source: crate::status::Error,
    },

    /// could not encode the command set
    #[snafu(display("could not encode command set"))]
    EncodeCommandSet {
        #[snafu(backtrace)]
        source: crate::cmdset::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The priority of a composite request.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub enum Priority {
    #[default]
    /// 0x0000
    Medium,
    /// 0x0001
    High,
    /// 0x0002
    Low,
}

impl Priority {
    pub fn code(self) -> u16 {
        match self {
            Priority::Medium => 0x0000,
            Priority::High => 0x0001,
            Priority::Low => 0x0002,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0000 => Some(Priority::Medium),
            0x0001 => Some(Priority::High),
            0x0002 => Some(Priority::Low),
            _ => None,
        }
    }
}

/// C-ECHO request parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CEchoRq {
    pub message_id: u16,
    pub affected_sop_class_uid: String,
}

/// C-ECHO response parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CEchoRsp {
    pub message_id_responded: u16,
    pub affected_sop_class_uid: Option<String>,
    pub status: Status,
}

/// C-STORE request parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CStoreRq {
    pub message_id: u16,
    pub affected_sop_class_uid: String,
    pub affected_sop_instance_uid: String,
    pub priority: Priority,
    /// set on storage sub-operations triggered by a C-MOVE
    pub move_originator_ae_title: Option<String>,
    pub move_originator_message_id: Option<u16>,
    /// the encoded data set to store
    pub dataset: Vec<u8>,
}

/// C-STORE response parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CStoreRsp {
    pub message_id_responded: u16,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub status: Status,
}

/// C-FIND request parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CFindRq {
    pub message_id: u16,
    pub affected_sop_class_uid: String,
    pub priority: Priority,
    /// the encoded query identifier data set
    pub identifier: Vec<u8>,
}

/// C-FIND response parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CFindRsp {
    pub message_id_responded: u16,
    pub affected_sop_class_uid: Option<String>,
    pub status: Status,
    /// present on pending responses: one match
    pub identifier: Option<Vec<u8>>,
}

/// C-GET request parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CGetRq {
    pub message_id: u16,
    pub affected_sop_class_uid: String,
    pub priority: Priority,
    pub identifier: Vec<u8>,
}

/// C-GET response parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CGetRsp {
    pub message_id_responded: u16,
    pub affected_sop_class_uid: Option<String>,
    pub status: Status,
    pub remaining: Option<u16>,
    pub completed: Option<u16>,
    pub failed: Option<u16>,
    pub warning: Option<u16>,
    pub identifier: Option<Vec<u8>>,
}

/// C-MOVE request parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CMoveRq {
    pub message_id: u16,
    pub affected_sop_class_uid: String,
    pub priority: Priority,
    /// the AE title of the move destination
    pub move_destination: String,
    pub identifier: Vec<u8>,
}

/// C-MOVE response parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CMoveRsp {
    pub message_id_responded: u16,
    pub affected_sop_class_uid: Option<String>,
    pub status: Status,
    pub remaining: Option<u16>,
    pub completed: Option<u16>,
    pub failed: Option<u16>,
    pub warning: Option<u16>,
    pub identifier: Option<Vec<u8>>,
}

/// C-CANCEL request parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CCancelRq {
    pub message_id_responded: u16,
}

/// N-EVENT-REPORT request parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct NEventReportRq {
    pub message_id: u16,
    pub affected_sop_class_uid: String,
    pub affected_sop_instance_uid: String,
    pub event_type_id: u16,
    pub event_information: Option<Vec<u8>>,
}

/// N-EVENT-REPORT response parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct NEventReportRsp {
    pub message_id_responded: u16,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub event_type_id: Option<u16>,
    pub status: Status,
    pub event_reply: Option<Vec<u8>>,
}

/// N-GET request parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct NGetRq {
    pub message_id: u16,
    pub requested_sop_class_uid: String,
    pub requested_sop_instance_uid: String,
    /// the attributes to retrieve; empty means all
    pub attribute_identifier_list: Vec<Tag>,
}

/// N-GET response parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct NGetRsp {
    pub message_id_responded: u16,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub status: Status,
    pub attribute_list: Option<Vec<u8>>,
}

/// N-SET request parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct NSetRq {
    pub message_id: u16,
    pub requested_sop_class_uid: String,
    pub requested_sop_instance_uid: String,
    pub modification_list: Vec<u8>,
}

/// N-SET response parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct NSetRsp {
    pub message_id_responded: u16,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub status: Status,
    pub attribute_list: Option<Vec<u8>>,
}

/// N-ACTION request parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct NActionRq {
    pub message_id: u16,
    pub requested_sop_class_uid: String,
    pub requested_sop_instance_uid: String,
    pub action_type_id: u16,
    pub action_information: Option<Vec<u8>>,
}

/// N-ACTION response parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct NActionRsp {
    pub message_id_responded: u16,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub action_type_id: Option<u16>,
    pub status: Status,
    pub action_reply: Option<Vec<u8>>,
}

/// N-CREATE request parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct NCreateRq {
    pub message_id: u16,
    pub affected_sop_class_uid: String,
    pub affected_sop_instance_uid: Option<String>,
    pub attribute_list: Option<Vec<u8>>,
}

/// N-CREATE response parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct NCreateRsp {
    pub message_id_responded: u16,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub status: Status,
    pub attribute_list: Option<Vec<u8>>,
}

/// N-DELETE request parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct NDeleteRq {
    pub message_id: u16,
    pub requested_sop_class_uid: String,
    pub requested_sop_instance_uid: String,
}

/// N-DELETE response parameters.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct NDeleteRsp {
    pub message_id_responded: u16,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub status: Status,
}

/// A DIMSE message: one service parameter variant,
/// request or response.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum DimseMessage {
    CEchoRq(CEchoRq),
    CEchoRsp(CEchoRsp),
    CStoreRq(CStoreRq),
    CStoreRsp(CStoreRsp),
    CFindRq(CFindRq),
    CFindRsp(CFindRsp),
    CGetRq(CGetRq),
    CGetRsp(CGetRsp),
    CMoveRq(CMoveRq),
    CMoveRsp(CMoveRsp),
    CCancelRq(CCancelRq),
    NEventReportRq(NEventReportRq),
    NEventReportRsp(NEventReportRsp),
    NGetRq(NGetRq),
    NGetRsp(NGetRsp),
    NSetRq(NSetRq),
    NSetRsp(NSetRsp),
    NActionRq(NActionRq),
    NActionRsp(NActionRsp),
    NCreateRq(NCreateRq),
    NCreateRsp(NCreateRsp),
    NDeleteRq(NDeleteRq),
    NDeleteRsp(NDeleteRsp),
}

impl DimseMessage {
    /// The command field code of this message.
    pub fn command_field(&self) -> CommandField {
        match self {
            DimseMessage::CEchoRq(_) => CommandField::CEchoRq,
            DimseMessage::CEchoRsp(_) => CommandField::CEchoRsp,
            DimseMessage::CStoreRq(_) => CommandField::CStoreRq,
            DimseMessage::CStoreRsp(_) => CommandField::CStoreRsp,
            DimseMessage::CFindRq(_) => CommandField::CFindRq,
            DimseMessage::CFindRsp(_) => CommandField::CFindRsp,
            DimseMessage::CGetRq(_) => CommandField::CGetRq,
            DimseMessage::CGetRsp(_) => CommandField::CGetRsp,
            DimseMessage::CMoveRq(_) => CommandField::CMoveRq,
            DimseMessage::CMoveRsp(_) => CommandField::CMoveRsp,
            DimseMessage::CCancelRq(_) => CommandField::CCancelRq,
            DimseMessage::NEventReportRq(_) => CommandField::NEventReportRq,
            DimseMessage::NEventReportRsp(_) => CommandField::NEventReportRsp,
            DimseMessage::NGetRq(_) => CommandField::NGetRq,
            DimseMessage::NGetRsp(_) => CommandField::NGetRsp,
            DimseMessage::NSetRq(_) => CommandField::NSetRq,
            DimseMessage::NSetRsp(_) => CommandField::NSetRsp,
            DimseMessage::NActionRq(_) => CommandField::NActionRq,
            DimseMessage::NActionRsp(_) => CommandField::NActionRsp,
            DimseMessage::NCreateRq(_) => CommandField::NCreateRq,
            DimseMessage::NCreateRsp(_) => CommandField::NCreateRsp,
            DimseMessage::NDeleteRq(_) => CommandField::NDeleteRq,
            DimseMessage::NDeleteRsp(_) => CommandField::NDeleteRsp,
        }
    }

    /// Whether this message is a request (or cancel).
    pub fn is_request(&self) -> bool {
        self.command_field().is_request()
    }

    /// The message ID of a request,
    /// or the message ID being responded to of a response.
    pub fn message_id(&self) -> u16 {
        match self {
            DimseMessage::CEchoRq(p) => p.message_id,
            DimseMessage::CEchoRsp(p) => p.message_id_responded,
            DimseMessage::CStoreRq(p) => p.message_id,
            DimseMessage::CStoreRsp(p) => p.message_id_responded,
            DimseMessage::CFindRq(p) => p.message_id,
            DimseMessage::CFindRsp(p) => p.message_id_responded,
            DimseMessage::CGetRq(p) => p.message_id,
            DimseMessage::CGetRsp(p) => p.message_id_responded,
            DimseMessage::CMoveRq(p) => p.message_id,
            DimseMessage::CMoveRsp(p) => p.message_id_responded,
            DimseMessage::CCancelRq(p) => p.message_id_responded,
            DimseMessage::NEventReportRq(p) => p.message_id,
            DimseMessage::NEventReportRsp(p) => p.message_id_responded,
            DimseMessage::NGetRq(p) => p.message_id,
            DimseMessage::NGetRsp(p) => p.message_id_responded,
            DimseMessage::NSetRq(p) => p.message_id,
            DimseMessage::NSetRsp(p) => p.message_id_responded,
            DimseMessage::NActionRq(p) => p.message_id,
            DimseMessage::NActionRsp(p) => p.message_id_responded,
            DimseMessage::NCreateRq(p) => p.message_id,
            DimseMessage::NCreateRsp(p) => p.message_id_responded,
            DimseMessage::NDeleteRq(p) => p.message_id,
            DimseMessage::NDeleteRsp(p) => p.message_id_responded,
        }
    }

    /// The status of a response message.
    pub fn status(&self) -> Option<Status> {
        match self {
            DimseMessage::CEchoRsp(p) => Some(p.status),
            DimseMessage::CStoreRsp(p) => Some(p.status),
            DimseMessage::CFindRsp(p) => Some(p.status),
            DimseMessage::CGetRsp(p) => Some(p.status),
            DimseMessage::CMoveRsp(p) => Some(p.status),
            DimseMessage::NEventReportRsp(p) => Some(p.status),
            DimseMessage::NGetRsp(p) => Some(p.status),
            DimseMessage::NSetRsp(p) => Some(p.status),
            DimseMessage::NActionRsp(p) => Some(p.status),
            DimseMessage::NCreateRsp(p) => Some(p.status),
            DimseMessage::NDeleteRsp(p) => Some(p.status),
            _ => None,
        }
    }

    /// The data set carried along with the command set, if any.
    pub fn dataset(&self) -> Option<&[u8]> {
        match self {
            DimseMessage::CStoreRq(p) => Some(&p.dataset),
            DimseMessage::CFindRq(p) => Some(&p.identifier),
            DimseMessage::CFindRsp(p) => p.identifier.as_deref(),
            DimseMessage::CGetRq(p) => Some(&p.identifier),
            DimseMessage::CGetRsp(p) => p.identifier.as_deref(),
            DimseMessage::CMoveRq(p) => Some(&p.identifier),
            DimseMessage::CMoveRsp(p) => p.identifier.as_deref(),
            DimseMessage::NEventReportRq(p) => p.event_information.as_deref(),
            DimseMessage::NEventReportRsp(p) => p.event_reply.as_deref(),
            DimseMessage::NGetRsp(p) => p.attribute_list.as_deref(),
            DimseMessage::NSetRq(p) => Some(&p.modification_list),
            DimseMessage::NSetRsp(p) => p.attribute_list.as_deref(),
            DimseMessage::NActionRq(p) => p.action_information.as_deref(),
            DimseMessage::NActionRsp(p) => p.action_reply.as_deref(),
            DimseMessage::NCreateRq(p) => p.attribute_list.as_deref(),
            DimseMessage::NCreateRsp(p) => p.attribute_list.as_deref(),
            _ => None,
        }
    }

    /// Serialize the parameters into a command set.
    ///
    /// The command field, data set type and group length elements
    /// are filled in;
    /// the data set itself travels separately (see [`dataset`]).
    ///
    /// [`dataset`]: DimseMessage::dataset
    pub fn to_command_set(&self) -> Result<CommandSet> {
        let mut command = CommandSet::new();
        command.put_u16(tags::COMMAND_FIELD, self.command_field().code());
        command.put_u16(
            tags::COMMAND_DATA_SET_TYPE,
            if self.dataset().is_some() {
                DATA_SET_PRESENT
            } else {
                NO_DATA_SET
            },
        );
        if let Some(status) = self.status() {
            status
                .validate_for(self.command_field())
                .context(BadStatusSnafu)?;
            command.put_u16(tags::STATUS, status.code());
        }

        match self {
            DimseMessage::CEchoRq(p) => {
                command.put_u16(tags::MESSAGE_ID, p.message_id);
                command.put_uid(tags::AFFECTED_SOP_CLASS_UID, &p.affected_sop_class_uid);
            }
            DimseMessage::CEchoRsp(p) => {
                command.put_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, p.message_id_responded);
                put_opt_uid(&mut command, tags::AFFECTED_SOP_CLASS_UID, &p.affected_sop_class_uid);
            }
            DimseMessage::CStoreRq(p) => {
                command.put_u16(tags::MESSAGE_ID, p.message_id);
                command.put_uid(tags::AFFECTED_SOP_CLASS_UID, &p.affected_sop_class_uid);
                command.put_uid(tags::AFFECTED_SOP_INSTANCE_UID, &p.affected_sop_instance_uid);
                command.put_u16(tags::PRIORITY, p.priority.code());
                if let Some(aet) = &p.move_originator_ae_title {
                    command.put_text(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE, aet);
                }
                if let Some(id) = p.move_originator_message_id {
                    command.put_u16(tags::MOVE_ORIGINATOR_MESSAGE_ID, id);
                }
            }
            DimseMessage::CStoreRsp(p) => {
                command.put_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, p.message_id_responded);
                put_opt_uid(&mut command, tags::AFFECTED_SOP_CLASS_UID, &p.affected_sop_class_uid);
                put_opt_uid(
                    &mut command,
                    tags::AFFECTED_SOP_INSTANCE_UID,
                    &p.affected_sop_instance_uid,
                );
            }
            DimseMessage::CFindRq(p) => {
                command.put_u16(tags::MESSAGE_ID, p.message_id);
                command.put_uid(tags::AFFECTED_SOP_CLASS_UID, &p.affected_sop_class_uid);
                command.put_u16(tags::PRIORITY, p.priority.code());
            }
            DimseMessage::CFindRsp(p) => {
                command.put_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, p.message_id_responded);
                put_opt_uid(&mut command, tags::AFFECTED_SOP_CLASS_UID, &p.affected_sop_class_uid);
            }
            DimseMessage::CGetRq(p) => {
                command.put_u16(tags::MESSAGE_ID, p.message_id);
                command.put_uid(tags::AFFECTED_SOP_CLASS_UID, &p.affected_sop_class_uid);
                command.put_u16(tags::PRIORITY, p.priority.code());
            }
            DimseMessage::CGetRsp(p) => {
                command.put_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, p.message_id_responded);
                put_opt_uid(&mut command, tags::AFFECTED_SOP_CLASS_UID, &p.affected_sop_class_uid);
                put_counters(&mut command, p.remaining, p.completed, p.failed, p.warning);
            }
            DimseMessage::CMoveRq(p) => {
                command.put_u16(tags::MESSAGE_ID, p.message_id);
                command.put_uid(tags::AFFECTED_SOP_CLASS_UID, &p.affected_sop_class_uid);
                command.put_u16(tags::PRIORITY, p.priority.code());
                command.put_text(tags::MOVE_DESTINATION, &p.move_destination);
            }
            DimseMessage::CMoveRsp(p) => {
                command.put_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, p.message_id_responded);
                put_opt_uid(&mut command, tags::AFFECTED_SOP_CLASS_UID, &p.affected_sop_class_uid);
                put_counters(&mut command, p.remaining, p.completed, p.failed, p.warning);
            }
            DimseMessage::CCancelRq(p) => {
                command.put_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, p.message_id_responded);
            }
            DimseMessage::NEventReportRq(p) => {
                command.put_u16(tags::MESSAGE_ID, p.message_id);
                command.put_uid(tags::AFFECTED_SOP_CLASS_UID, &p.affected_sop_class_uid);
                command.put_uid(tags::AFFECTED_SOP_INSTANCE_UID, &p.affected_sop_instance_uid);
                command.put_u16(tags::EVENT_TYPE_ID, p.event_type_id);
            }
            DimseMessage::NEventReportRsp(p) => {
                command.put_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, p.message_id_responded);
                put_opt_uid(&mut command, tags::AFFECTED_SOP_CLASS_UID, &p.affected_sop_class_uid);
                put_opt_uid(
                    &mut command,
                    tags::AFFECTED_SOP_INSTANCE_UID,
                    &p.affected_sop_instance_uid,
                );
                if let Some(event_type_id) = p.event_type_id {
                    command.put_u16(tags::EVENT_TYPE_ID, event_type_id);
                }
            }
            DimseMessage::NGetRq(p) => {
                command.put_u16(tags::MESSAGE_ID, p.message_id);
                command.put_uid(tags::REQUESTED_SOP_CLASS_UID, &p.requested_sop_class_uid);
                command.put_uid(tags::REQUESTED_SOP_INSTANCE_UID, &p.requested_sop_instance_uid);
                if !p.attribute_identifier_list.is_empty() {
                    command.put(
                        tags::ATTRIBUTE_IDENTIFIER_LIST,
                        CommandValue::TagList(p.attribute_identifier_list.clone()),
                    );
                }
            }
            DimseMessage::NGetRsp(p) => {
                command.put_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, p.message_id_responded);
                put_opt_uid(&mut command, tags::AFFECTED_SOP_CLASS_UID, &p.affected_sop_class_uid);
                put_opt_uid(
                    &mut command,
                    tags::AFFECTED_SOP_INSTANCE_UID,
                    &p.affected_sop_instance_uid,
                );
            }
            DimseMessage::NSetRq(p) => {
                command.put_u16(tags::MESSAGE_ID, p.message_id);
                command.put_uid(tags::REQUESTED_SOP_CLASS_UID, &p.requested_sop_class_uid);
                command.put_uid(tags::REQUESTED_SOP_INSTANCE_UID, &p.requested_sop_instance_uid);
            }
            DimseMessage::NSetRsp(p) => {
                command.put_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, p.message_id_responded);
                put_opt_uid(&mut command, tags::AFFECTED_SOP_CLASS_UID, &p.affected_sop_class_uid);
                put_opt_uid(
                    &mut command,
                    tags::AFFECTED_SOP_INSTANCE_UID,
                    &p.affected_sop_instance_uid,
                );
            }
            DimseMessage::NActionRq(p) => {
                command.put_u16(tags::MESSAGE_ID, p.message_id);
                command.put_uid(tags::REQUESTED_SOP_CLASS_UID, &p.requested_sop_class_uid);
                command.put_uid(tags::REQUESTED_SOP_INSTANCE_UID, &p.requested_sop_instance_uid);
                command.put_u16(tags::ACTION_TYPE_ID, p.action_type_id);
            }
            DimseMessage::NActionRsp(p) => {
                command.put_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, p.message_id_responded);
                put_opt_uid(&mut command, tags::AFFECTED_SOP_CLASS_UID, &p.affected_sop_class_uid);
                put_opt_uid(
                    &mut command,
                    tags::AFFECTED_SOP_INSTANCE_UID,
                    &p.affected_sop_instance_uid,
                );
                if let Some(action_type_id) = p.action_type_id {
                    command.put_u16(tags::ACTION_TYPE_ID, action_type_id);
                }
            }
            DimseMessage::NCreateRq(p) => {
                command.put_u16(tags::MESSAGE_ID, p.message_id);
                command.put_uid(tags::AFFECTED_SOP_CLASS_UID, &p.affected_sop_class_uid);
                put_opt_uid(
                    &mut command,
                    tags::AFFECTED_SOP_INSTANCE_UID,
                    &p.affected_sop_instance_uid,
                );
            }
            DimseMessage::NCreateRsp(p) => {
                command.put_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, p.message_id_responded);
                put_opt_uid(&mut command, tags::AFFECTED_SOP_CLASS_UID, &p.affected_sop_class_uid);
                put_opt_uid(
                    &mut command,
                    tags::AFFECTED_SOP_INSTANCE_UID,
                    &p.affected_sop_instance_uid,
                );
            }
            DimseMessage::NDeleteRq(p) => {
                command.put_u16(tags::MESSAGE_ID, p.message_id);
                command.put_uid(tags::REQUESTED_SOP_CLASS_UID, &p.requested_sop_class_uid);
                command.put_uid(tags::REQUESTED_SOP_INSTANCE_UID, &p.requested_sop_instance_uid);
            }
            DimseMessage::NDeleteRsp(p) => {
                command.put_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, p.message_id_responded);
                put_opt_uid(&mut command, tags::AFFECTED_SOP_CLASS_UID, &p.affected_sop_class_uid);
                put_opt_uid(
                    &mut command,
                    tags::AFFECTED_SOP_INSTANCE_UID,
                    &p.affected_sop_instance_uid,
                );
            }
        }

        Ok(command)
    }

    /// Rebuild the parameters from a decoded command set
    /// and the reassembled data set, if one followed.
    pub fn from_command_set(command: &CommandSet, dataset: Option<Vec<u8>>) -> Result<Self> {
        let code = command
            .u16_value(tags::COMMAND_FIELD)
            .context(MissingCommandFieldSnafu)?;
        let field = CommandField::from_code(code).context(UnknownCommandFieldSnafu { code })?;

        let message_id = || {
            command
                .require_u16(tags::MESSAGE_ID, "MessageID")
                .context(MalformedCommandSetSnafu)
        };
        let message_id_responded = || {
            command
                .require_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, "MessageIDBeingRespondedTo")
                .context(MalformedCommandSetSnafu)
        };
        let status = || -> Result<Status> {
            Ok(Status::new(
                command
                    .require_u16(tags::STATUS, "Status")
                    .context(MalformedCommandSetSnafu)?,
            ))
        };
        let priority = || -> Result<Priority> {
            let code = command.u16_value(tags::PRIORITY).unwrap_or_default();
            Priority::from_code(code).context(InvalidPrioritySnafu { code })
        };
        let required_dataset = || -> Result<Vec<u8>> {
            dataset.clone().context(MissingDataSetSnafu)
        };
        let opt_uid = |tag: Tag| command.str_value(tag).map(|s| s.to_string());

        let message = match field {
            CommandField::CEchoRq => DimseMessage::CEchoRq(CEchoRq {
                message_id: message_id()?,
                affected_sop_class_uid: command
                    .require_str(tags::AFFECTED_SOP_CLASS_UID, "AffectedSOPClassUID")
                    .context(MalformedCommandSetSnafu)?,
            }),
            CommandField::CEchoRsp => DimseMessage::CEchoRsp(CEchoRsp {
                message_id_responded: message_id_responded()?,
                affected_sop_class_uid: opt_uid(tags::AFFECTED_SOP_CLASS_UID),
                status: status()?,
            }),
            CommandField::CStoreRq => DimseMessage::CStoreRq(CStoreRq {
                message_id: message_id()?,
                affected_sop_class_uid: command
                    .require_str(tags::AFFECTED_SOP_CLASS_UID, "AffectedSOPClassUID")
                    .context(MalformedCommandSetSnafu)?,
                affected_sop_instance_uid: command
                    .require_str(tags::AFFECTED_SOP_INSTANCE_UID, "AffectedSOPInstanceUID")
                    .context(MalformedCommandSetSnafu)?,
                priority: priority()?,
                move_originator_ae_title: command
                    .str_value(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE)
                    .map(|s| s.to_string()),
                move_originator_message_id: command
                    .u16_value(tags::MOVE_ORIGINATOR_MESSAGE_ID),
                dataset: required_dataset()?,
            }),
            CommandField::CStoreRsp => DimseMessage::CStoreRsp(CStoreRsp {
                message_id_responded: message_id_responded()?,
                affected_sop_class_uid: opt_uid(tags::AFFECTED_SOP_CLASS_UID),
                affected_sop_instance_uid: opt_uid(tags::AFFECTED_SOP_INSTANCE_UID),
                status: status()?,
            }),
            CommandField::CFindRq => DimseMessage::CFindRq(CFindRq {
                message_id: message_id()?,
                affected_sop_class_uid: command
                    .require_str(tags::AFFECTED_SOP_CLASS_UID, "AffectedSOPClassUID")
                    .context(MalformedCommandSetSnafu)?,
                priority: priority()?,
                identifier: required_dataset()?,
            }),
            CommandField::CFindRsp => DimseMessage::CFindRsp(CFindRsp {
                message_id_responded: message_id_responded()?,
                affected_sop_class_uid: opt_uid(tags::AFFECTED_SOP_CLASS_UID),
                status: status()?,
                identifier: dataset.clone(),
            }),
            CommandField::CGetRq => DimseMessage::CGetRq(CGetRq {
                message_id: message_id()?,
                affected_sop_class_uid: command
                    .require_str(tags::AFFECTED_SOP_CLASS_UID, "AffectedSOPClassUID")
                    .context(MalformedCommandSetSnafu)?,
                priority: priority()?,
                identifier: required_dataset()?,
            }),
            CommandField::CGetRsp => DimseMessage::CGetRsp(CGetRsp {
                message_id_responded: message_id_responded()?,
                affected_sop_class_uid: opt_uid(tags::AFFECTED_SOP_CLASS_UID),
                status: status()?,
                remaining: command.u16_value(tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
                completed: command.u16_value(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
                failed: command.u16_value(tags::NUMBER_OF_FAILED_SUBOPERATIONS),
                warning: command.u16_value(tags::NUMBER_OF_WARNING_SUBOPERATIONS),
                identifier: dataset.clone(),
            }),
            CommandField::CMoveRq => DimseMessage::CMoveRq(CMoveRq {
                message_id: message_id()?,
                affected_sop_class_uid: command
                    .require_str(tags::AFFECTED_SOP_CLASS_UID, "AffectedSOPClassUID")
                    .context(MalformedCommandSetSnafu)?,
                priority: priority()?,
                move_destination: command
                    .require_str(tags::MOVE_DESTINATION, "MoveDestination")
                    .context(MalformedCommandSetSnafu)?,
                identifier: required_dataset()?,
            }),
            CommandField::CMoveRsp => DimseMessage::CMoveRsp(CMoveRsp {
                message_id_responded: message_id_responded()?,
                affected_sop_class_uid: opt_uid(tags::AFFECTED_SOP_CLASS_UID),
                status: status()?,
                remaining: command.u16_value(tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
                completed: command.u16_value(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
                failed: command.u16_value(tags::NUMBER_OF_FAILED_SUBOPERATIONS),
                warning: command.u16_value(tags::NUMBER_OF_WARNING_SUBOPERATIONS),
                identifier: dataset.clone(),
            }),
            CommandField::CCancelRq => DimseMessage::CCancelRq(CCancelRq {
                message_id_responded: message_id_responded()?,
            }),
            CommandField::NEventReportRq => DimseMessage::NEventReportRq(NEventReportRq {
                message_id: message_id()?,
                affected_sop_class_uid: command
                    .require_str(tags::AFFECTED_SOP_CLASS_UID, "AffectedSOPClassUID")
                    .context(MalformedCommandSetSnafu)?,
                affected_sop_instance_uid: command
                    .require_str(tags::AFFECTED_SOP_INSTANCE_UID, "AffectedSOPInstanceUID")
                    .context(MalformedCommandSetSnafu)?,
                event_type_id: command
                    .require_u16(tags::EVENT_TYPE_ID, "EventTypeID")
                    .context(MalformedCommandSetSnafu)?,
                event_information: dataset.clone(),
            }),
            CommandField::NEventReportRsp => DimseMessage::NEventReportRsp(NEventReportRsp {
                message_id_responded: message_id_responded()?,
                affected_sop_class_uid: opt_uid(tags::AFFECTED_SOP_CLASS_UID),
                affected_sop_instance_uid: opt_uid(tags::AFFECTED_SOP_INSTANCE_UID),
                event_type_id: command.u16_value(tags::EVENT_TYPE_ID),
                status: status()?,
                event_reply: dataset.clone(),
            }),
            CommandField::NGetRq => DimseMessage::NGetRq(NGetRq {
                message_id: message_id()?,
                requested_sop_class_uid: command
                    .require_str(tags::REQUESTED_SOP_CLASS_UID, "RequestedSOPClassUID")
                    .context(MalformedCommandSetSnafu)?,
                requested_sop_instance_uid: command
                    .require_str(tags::REQUESTED_SOP_INSTANCE_UID, "RequestedSOPInstanceUID")
                    .context(MalformedCommandSetSnafu)?,
                attribute_identifier_list: command
                    .tag_list_value(tags::ATTRIBUTE_IDENTIFIER_LIST)
                    .map(|tags| tags.to_vec())
                    .unwrap_or_default(),
            }),
            CommandField::NGetRsp => DimseMessage::NGetRsp(NGetRsp {
                message_id_responded: message_id_responded()?,
                affected_sop_class_uid: opt_uid(tags::AFFECTED_SOP_CLASS_UID),
                affected_sop_instance_uid: opt_uid(tags::AFFECTED_SOP_INSTANCE_UID),
                status: status()?,
                attribute_list: dataset.clone(),
            }),
            CommandField::NSetRq => DimseMessage::NSetRq(NSetRq {
                message_id: message_id()?,
                requested_sop_class_uid: command
                    .require_str(tags::REQUESTED_SOP_CLASS_UID, "RequestedSOPClassUID")
                    .context(MalformedCommandSetSnafu)?,
                requested_sop_instance_uid: command
                    .require_str(tags::REQUESTED_SOP_INSTANCE_UID, "RequestedSOPInstanceUID")
                    .context(MalformedCommandSetSnafu)?,
                modification_list: required_dataset()?,
            }),
            CommandField::NSetRsp => DimseMessage::NSetRsp(NSetRsp {
                message_id_responded: message_id_responded()?,
                affected_sop_class_uid: opt_uid(tags::AFFECTED_SOP_CLASS_UID),
                affected_sop_instance_uid: opt_uid(tags::AFFECTED_SOP_INSTANCE_UID),
                status: status()?,
                attribute_list: dataset.clone(),
            }),
            CommandField::NActionRq => DimseMessage::NActionRq(NActionRq {
                message_id: message_id()?,
                requested_sop_class_uid: command
                    .require_str(tags::REQUESTED_SOP_CLASS_UID, "RequestedSOPClassUID")
                    .context(MalformedCommandSetSnafu)?,
                requested_sop_instance_uid: command
                    .require_str(tags::REQUESTED_SOP_INSTANCE_UID, "RequestedSOPInstanceUID")
                    .context(MalformedCommandSetSnafu)?,
                action_type_id: command
                    .require_u16(tags::ACTION_TYPE_ID, "ActionTypeID")
                    .context(MalformedCommandSetSnafu)?,
                action_information: dataset.clone(),
            }),
            CommandField::NActionRsp => DimseMessage::NActionRsp(NActionRsp {
                message_id_responded: message_id_responded()?,
                affected_sop_class_uid: opt_uid(tags::AFFECTED_SOP_CLASS_UID),
                affected_sop_instance_uid: opt_uid(tags::AFFECTED_SOP_INSTANCE_UID),
                action_type_id: command.u16_value(tags::ACTION_TYPE_ID),
                status: status()?,
                action_reply: dataset.clone(),
            }),
            CommandField::NCreateRq => DimseMessage::NCreateRq(NCreateRq {
                message_id: message_id()?,
                affected_sop_class_uid: command
                    .require_str(tags::AFFECTED_SOP_CLASS_UID, "AffectedSOPClassUID")
                    .context(MalformedCommandSetSnafu)?,
                affected_sop_instance_uid: opt_uid(tags::AFFECTED_SOP_INSTANCE_UID),
                attribute_list: dataset.clone(),
            }),
            CommandField::NCreateRsp => DimseMessage::NCreateRsp(NCreateRsp {
                message_id_responded: message_id_responded()?,
                affected_sop_class_uid: opt_uid(tags::AFFECTED_SOP_CLASS_UID),
                affected_sop_instance_uid: opt_uid(tags::AFFECTED_SOP_INSTANCE_UID),
                status: status()?,
                attribute_list: dataset.clone(),
            }),
            CommandField::NDeleteRq => DimseMessage::NDeleteRq(NDeleteRq {
                message_id: message_id()?,
                requested_sop_class_uid: command
                    .require_str(tags::REQUESTED_SOP_CLASS_UID, "RequestedSOPClassUID")
                    .context(MalformedCommandSetSnafu)?,
                requested_sop_instance_uid: command
                    .require_str(tags::REQUESTED_SOP_INSTANCE_UID, "RequestedSOPInstanceUID")
                    .context(MalformedCommandSetSnafu)?,
            }),
            CommandField::NDeleteRsp => DimseMessage::NDeleteRsp(NDeleteRsp {
                message_id_responded: message_id_responded()?,
                affected_sop_class_uid: opt_uid(tags::AFFECTED_SOP_CLASS_UID),
                affected_sop_instance_uid: opt_uid(tags::AFFECTED_SOP_INSTANCE_UID),
                status: status()?,
            }),
        };

        Ok(message)
    }
}

fn put_opt_uid(command: &mut CommandSet, tag: Tag, value: &Option<String>) {
    if let Some(value) = value {
        command.put_uid(tag, value);
    }
}

fn put_counters(
    command: &mut CommandSet,
    remaining: Option<u16>,
    completed: Option<u16>,
    failed: Option<u16>,
    warning: Option<u16>,
) {
    if let Some(remaining) = remaining {
        command.put_u16(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, remaining);
    }
    if let Some(completed) = completed {
        command.put_u16(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, completed);
    }
    if let Some(failed) = failed {
        command.put_u16(tags::NUMBER_OF_FAILED_SUBOPERATIONS, failed);
    }
    if let Some(warning) = warning {
        command.put_u16(tags::NUMBER_OF_WARNING_SUBOPERATIONS, warning);
    }
}
