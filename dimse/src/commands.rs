//! The command set dictionary.
//!
//! Command sets are made of group 0000 elements only.
//! This module enumerates the tags of the command dictionary,
//! their value representation classes,
//! and the command field codes that discriminate DIMSE messages.

/// A DICOM attribute tag: a (group, element) pair.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Tag(pub u16, pub u16);

impl Tag {
    pub fn group(self) -> u16 {
        self.0
    }

    pub fn element(self) -> u16 {
        self.1
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:04X},{:04X})", self.0, self.1)
    }
}

/// The tags of the command dictionary (PS3.7 annex E).
pub mod tags {
    use super::Tag;

    pub const COMMAND_GROUP_LENGTH: Tag = Tag(0x0000, 0x0000);
    pub const AFFECTED_SOP_CLASS_UID: Tag = Tag(0x0000, 0x0002);
    pub const REQUESTED_SOP_CLASS_UID: Tag = Tag(0x0000, 0x0003);
    pub const COMMAND_FIELD: Tag = Tag(0x0000, 0x0100);
    pub const MESSAGE_ID: Tag = Tag(0x0000, 0x0110);
    pub const MESSAGE_ID_BEING_RESPONDED_TO: Tag = Tag(0x0000, 0x0120);
    pub const MOVE_DESTINATION: Tag = Tag(0x0000, 0x0600);
    pub const PRIORITY: Tag = Tag(0x0000, 0x0700);
    pub const COMMAND_DATA_SET_TYPE: Tag = Tag(0x0000, 0x0800);
    pub const STATUS: Tag = Tag(0x0000, 0x0900);
    pub const OFFENDING_ELEMENT: Tag = Tag(0x0000, 0x0901);
    pub const ERROR_COMMENT: Tag = Tag(0x0000, 0x0902);
    pub const ERROR_ID: Tag = Tag(0x0000, 0x0903);
    pub const AFFECTED_SOP_INSTANCE_UID: Tag = Tag(0x0000, 0x1000);
    pub const REQUESTED_SOP_INSTANCE_UID: Tag = Tag(0x0000, 0x1001);
    pub const EVENT_TYPE_ID: Tag = Tag(0x0000, 0x1002);
    pub const ATTRIBUTE_IDENTIFIER_LIST: Tag = Tag(0x0000, 0x1005);
    pub const ACTION_TYPE_ID: Tag = Tag(0x0000, 0x1008);
    pub const NUMBER_OF_REMAINING_SUBOPERATIONS: Tag = Tag(0x0000, 0x1020);
    pub const NUMBER_OF_COMPLETED_SUBOPERATIONS: Tag = Tag(0x0000, 0x1021);
    pub const NUMBER_OF_FAILED_SUBOPERATIONS: Tag = Tag(0x0000, 0x1022);
    pub const NUMBER_OF_WARNING_SUBOPERATIONS: Tag = Tag(0x0000, 0x1023);
    pub const MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE: Tag = Tag(0x0000, 0x1030);
    pub const MOVE_ORIGINATOR_MESSAGE_ID: Tag = Tag(0x0000, 0x1031);
}

/// The value representation class of a command element,
/// deciding how its bytes are interpreted.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ValueClass {
    /// UL: a single unsigned 32-bit integer
    Uint32,
    /// US: one or more unsigned 16-bit integers
    Uint16,
    /// UI: a UID string, NUL padded to even length
    Uid,
    /// AE, LO: a text string, space padded to even length
    Text,
    /// AT: a list of attribute tags
    TagList,
}

/// The command dictionary:
/// tag, keyword and value class of every known command element.
pub const COMMAND_DICTIONARY: &[(Tag, &str, ValueClass)] = &[
    (tags::COMMAND_GROUP_LENGTH, "CommandGroupLength", ValueClass::Uint32),
    (tags::AFFECTED_SOP_CLASS_UID, "AffectedSOPClassUID", ValueClass::Uid),
    (tags::REQUESTED_SOP_CLASS_UID, "RequestedSOPClassUID", ValueClass::Uid),
    (tags::COMMAND_FIELD, "CommandField", ValueClass::Uint16),
    (tags::MESSAGE_ID, "MessageID", ValueClass::Uint16),
    (tags::MESSAGE_ID_BEING_RESPONDED_TO, "MessageIDBeingRespondedTo", ValueClass::Uint16),
    (tags::MOVE_DESTINATION, "MoveDestination", ValueClass::Text),
    (tags::PRIORITY, "Priority", ValueClass::Uint16),
    (tags::COMMAND_DATA_SET_TYPE, "CommandDataSetType", ValueClass::Uint16),
    (tags::STATUS, "Status", ValueClass::Uint16),
    (tags::OFFENDING_ELEMENT, "OffendingElement", ValueClass::TagList),
    (tags::ERROR_COMMENT, "ErrorComment", ValueClass::Text),
    (tags::ERROR_ID, "ErrorID", ValueClass::Uint16),
    (tags::AFFECTED_SOP_INSTANCE_UID, "AffectedSOPInstanceUID", ValueClass::Uid),
    (tags::REQUESTED_SOP_INSTANCE_UID, "RequestedSOPInstanceUID", ValueClass::Uid),
    (tags::EVENT_TYPE_ID, "EventTypeID", ValueClass::Uint16),
    (tags::ATTRIBUTE_IDENTIFIER_LIST, "AttributeIdentifierList", ValueClass::TagList),
    (tags::ACTION_TYPE_ID, "ActionTypeID", ValueClass::Uint16),
    (tags::NUMBER_OF_REMAINING_SUBOPERATIONS, "NumberOfRemainingSuboperations", ValueClass::Uint16),
    (tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, "NumberOfCompletedSuboperations", ValueClass::Uint16),
    (tags::NUMBER_OF_FAILED_SUBOPERATIONS, "NumberOfFailedSuboperations", ValueClass::Uint16),
    (tags::NUMBER_OF_WARNING_SUBOPERATIONS, "NumberOfWarningSuboperations", ValueClass::Uint16),
    (tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE, "MoveOriginatorApplicationEntityTitle", ValueClass::Text),
    (tags::MOVE_ORIGINATOR_MESSAGE_ID, "MoveOriginatorMessageID", ValueClass::Uint16),
];

/// Look up a command element in the dictionary.
pub fn dictionary_entry(tag: Tag) -> Option<&'static (Tag, &'static str, ValueClass)> {
    COMMAND_DICTIONARY.iter().find(|(t, _, _)| *t == tag)
}

/// The value of the command data set type element (0000,0800)
/// stating that no data set is present in the message.
pub const NO_DATA_SET: u16 = 0x0101;

/// The value written to the command data set type element
/// when a data set follows the command set.
/// On receive, any value other than [`NO_DATA_SET`] means
/// a data set follows.
pub const DATA_SET_PRESENT: u16 = 0x0000;

/// The command field codes (0000,0100) of the DIMSE services.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum CommandField {
    CStoreRq,
    CStoreRsp,
    CGetRq,
    CGetRsp,
    CFindRq,
    CFindRsp,
    CMoveRq,
    CMoveRsp,
    CEchoRq,
    CEchoRsp,
    NEventReportRq,
    NEventReportRsp,
    NGetRq,
    NGetRsp,
    NSetRq,
    NSetRsp,
    NActionRq,
    NActionRsp,
    NCreateRq,
    NCreateRsp,
    NDeleteRq,
    NDeleteRsp,
    CCancelRq,
}

impl CommandField {
    pub fn code(self) -> u16 {
        match self {
            CommandField::CStoreRq => 0x0001,
            CommandField::CStoreRsp => 0x8001,
            CommandField::CGetRq => 0x0010,
            CommandField::CGetRsp => 0x8010,
            CommandField::CFindRq => 0x0020,
            CommandField::CFindRsp => 0x8020,
            CommandField::CMoveRq => 0x0021,
            CommandField::CMoveRsp => 0x8021,
            CommandField::CEchoRq => 0x0030,
            CommandField::CEchoRsp => 0x8030,
            CommandField::NEventReportRq => 0x0100,
            CommandField::NEventReportRsp => 0x8100,
            CommandField::NGetRq => 0x0110,
            CommandField::NGetRsp => 0x8110,
            CommandField::NSetRq => 0x0120,
            CommandField::NSetRsp => 0x8120,
            CommandField::NActionRq => 0x0130,
            CommandField::NActionRsp => 0x8130,
            CommandField::NCreateRq => 0x0140,
            CommandField::NCreateRsp => 0x8140,
            CommandField::NDeleteRq => 0x0150,
            CommandField::NDeleteRsp => 0x8150,
            CommandField::CCancelRq => 0x0FFF,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0001 => Some(CommandField::CStoreRq),
            0x8001 => Some(CommandField::CStoreRsp),
            0x0010 => Some(CommandField::CGetRq),
            0x8010 => Some(CommandField::CGetRsp),
            0x0020 => Some(CommandField::CFindRq),
            0x8020 => Some(CommandField::CFindRsp),
            0x0021 => Some(CommandField::CMoveRq),
            0x8021 => Some(CommandField::CMoveRsp),
            0x0030 => Some(CommandField::CEchoRq),
            0x8030 => Some(CommandField::CEchoRsp),
            0x0100 => Some(CommandField::NEventReportRq),
            0x8100 => Some(CommandField::NEventReportRsp),
            0x0110 => Some(CommandField::NGetRq),
            0x8110 => Some(CommandField::NGetRsp),
            0x0120 => Some(CommandField::NSetRq),
            0x8120 => Some(CommandField::NSetRsp),
            0x0130 => Some(CommandField::NActionRq),
            0x8130 => Some(CommandField::NActionRsp),
            0x0140 => Some(CommandField::NCreateRq),
            0x8140 => Some(CommandField::NCreateRsp),
            0x0150 => Some(CommandField::NDeleteRq),
            0x8150 => Some(CommandField::NDeleteRsp),
            0x0FFF => Some(CommandField::CCancelRq),
            _ => None,
        }
    }

    /// Whether the code names a request (or cancel) message.
    pub fn is_request(self) -> bool {
        self.code() & 0x8000 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_field_codes_roundtrip() {
        for field in [
            CommandField::CStoreRq,
            CommandField::CStoreRsp,
            CommandField::CGetRq,
            CommandField::CGetRsp,
            CommandField::CFindRq,
            CommandField::CFindRsp,
            CommandField::CMoveRq,
            CommandField::CMoveRsp,
            CommandField::CEchoRq,
            CommandField::CEchoRsp,
            CommandField::NEventReportRq,
            CommandField::NEventReportRsp,
            CommandField::NGetRq,
            CommandField::NGetRsp,
            CommandField::NSetRq,
            CommandField::NSetRsp,
            CommandField::NActionRq,
            CommandField::NActionRsp,
            CommandField::NCreateRq,
            CommandField::NCreateRsp,
            CommandField::NDeleteRq,
            CommandField::NDeleteRsp,
            CommandField::CCancelRq,
        ] {
            assert_eq!(CommandField::from_code(field.code()), Some(field));
        }
        assert_eq!(CommandField::from_code(0x4242), None);
    }

    #[test]
    fn requests_and_responses_are_told_apart() {
        assert!(CommandField::CEchoRq.is_request());
        assert!(!CommandField::CEchoRsp.is_request());
        assert!(CommandField::CCancelRq.is_request());
    }

    #[test]
    fn dictionary_covers_the_well_known_tags() {
        let entry = dictionary_entry(tags::COMMAND_FIELD).unwrap();
        assert_eq!(entry.1, "CommandField");
        assert_eq!(entry.2, ValueClass::Uint16);
        assert!(dictionary_entry(Tag(0x0000, 0x4242)).is_none());
    }
}
