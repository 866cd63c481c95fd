//! Command set representation and its wire codec.
//!
//! Command sets always travel as Implicit VR Little Endian,
//! regardless of the transfer syntax negotiated for data sets:
//! each element is `{group:u16 LE, element:u16 LE, length:u32 LE, value}`.
//! The command group length element (0000,0000) is computed
//! over the remainder of the command set at encoding time.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use byteordered::byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};

use crate::commands::{dictionary_entry, tags, Tag, ValueClass};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not read command element header"))]
    ReadElementHeader {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read value of command element {}", tag))]
    ReadElementValue {
        tag: Tag,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not write command element {}", tag))]
    WriteElement {
        tag: Tag,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Command element {} has invalid length {}", tag, length))]
    InvalidElementLength {
        tag: Tag,
        length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("Command element {} is not valid ISO 646 text", tag))]
    InvalidText { tag: Tag, backtrace: Backtrace },

    #[snafu(display("Command set has no {} element", keyword))]
    MissingElement {
        keyword: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("Element {} does not hold the expected kind of value", tag))]
    WrongValueKind { tag: Tag, backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A primitive command element value.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum CommandValue {
    /// a single unsigned 32-bit integer (UL)
    Uint32(u32),
    /// unsigned 16-bit integers (US)
    Uint16(Vec<u16>),
    /// a UID (UI), NUL padded on the wire
    Uid(String),
    /// a text string (AE, LO), space padded on the wire
    Text(String),
    /// attribute tags (AT)
    TagList(Vec<Tag>),
    /// the raw bytes of an element outside the dictionary
    Bytes(Vec<u8>),
}

/// A command set: group 0000 elements keyed by tag.
///
/// Elements iterate in ascending tag order,
/// which is also their wire order.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct CommandSet {
    elements: BTreeMap<Tag, CommandValue>,
}

impl CommandSet {
    pub fn new() -> Self {
        CommandSet::default()
    }

    /// Put an element, replacing any previous value under the same tag.
    pub fn put(&mut self, tag: Tag, value: CommandValue) {
        self.elements.insert(tag, value);
    }

    /// Put a single unsigned 16-bit integer element.
    pub fn put_u16(&mut self, tag: Tag, value: u16) {
        self.put(tag, CommandValue::Uint16(vec![value]));
    }

    /// Put a UID element.
    pub fn put_uid(&mut self, tag: Tag, value: impl Into<String>) {
        self.put(tag, CommandValue::Uid(value.into()));
    }

    /// Put a text element.
    pub fn put_text(&mut self, tag: Tag, value: impl Into<String>) {
        self.put(tag, CommandValue::Text(value.into()));
    }

    pub fn get(&self, tag: Tag) -> Option<&CommandValue> {
        self.elements.get(&tag)
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.elements.contains_key(&tag)
    }

    /// Fetch a single unsigned 16-bit integer element.
    pub fn u16_value(&self, tag: Tag) -> Option<u16> {
        match self.elements.get(&tag) {
            Some(CommandValue::Uint16(values)) => values.first().copied(),
            _ => None,
        }
    }

    /// Fetch a string element (UID or text).
    pub fn str_value(&self, tag: Tag) -> Option<&str> {
        match self.elements.get(&tag) {
            Some(CommandValue::Uid(value)) | Some(CommandValue::Text(value)) => Some(value),
            _ => None,
        }
    }

    /// Fetch an attribute tag list element.
    pub fn tag_list_value(&self, tag: Tag) -> Option<&[Tag]> {
        match self.elements.get(&tag) {
            Some(CommandValue::TagList(values)) => Some(values),
            _ => None,
        }
    }

    /// Fetch a required element,
    /// named by its dictionary keyword in the error.
    pub fn require_u16(&self, tag: Tag, keyword: &'static str) -> Result<u16> {
        self.u16_value(tag).context(MissingElementSnafu { keyword })
    }

    /// Fetch a required string element,
    /// named by its dictionary keyword in the error.
    pub fn require_str(&self, tag: Tag, keyword: &'static str) -> Result<String> {
        self.str_value(tag)
            .map(|s| s.to_string())
            .context(MissingElementSnafu { keyword })
    }

    /// The number of elements, not counting the group length.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Encode the command set as Implicit VR Little Endian bytes,
    /// prepending the computed command group length element.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        for (tag, value) in &self.elements {
            if *tag == tags::COMMAND_GROUP_LENGTH {
                // always recomputed below
                continue;
            }
            write_element(&mut body, *tag, value)?;
        }

        let mut bytes = Vec::with_capacity(body.len() + 12);
        write_element(
            &mut bytes,
            tags::COMMAND_GROUP_LENGTH,
            &CommandValue::Uint32(body.len() as u32),
        )?;
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Decode a command set from Implicit VR Little Endian bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let mut elements = BTreeMap::new();

        while (cursor.position() as usize) < bytes.len() {
            let group = cursor
                .read_u16::<LittleEndian>()
                .context(ReadElementHeaderSnafu)?;
            let element = cursor
                .read_u16::<LittleEndian>()
                .context(ReadElementHeaderSnafu)?;
            let length = cursor
                .read_u32::<LittleEndian>()
                .context(ReadElementHeaderSnafu)?;
            let tag = Tag(group, element);

            let mut value_bytes = vec![0u8; length as usize];
            cursor
                .read_exact(&mut value_bytes)
                .context(ReadElementValueSnafu { tag })?;

            let value = decode_value(tag, &value_bytes)?;
            elements.insert(tag, value);
        }

        Ok(CommandSet { elements })
    }
}

fn write_element(writer: &mut Vec<u8>, tag: Tag, value: &CommandValue) -> Result<()> {
    let value_bytes = encode_value(tag, value)?;
    writer
        .write_u16::<LittleEndian>(tag.group())
        .context(WriteElementSnafu { tag })?;
    writer
        .write_u16::<LittleEndian>(tag.element())
        .context(WriteElementSnafu { tag })?;
    writer
        .write_u32::<LittleEndian>(value_bytes.len() as u32)
        .context(WriteElementSnafu { tag })?;
    writer
        .write_all(&value_bytes)
        .context(WriteElementSnafu { tag })?;
    Ok(())
}

fn encode_value(tag: Tag, value: &CommandValue) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    match value {
        CommandValue::Uint32(value) => {
            bytes
                .write_u32::<LittleEndian>(*value)
                .context(WriteElementSnafu { tag })?;
        }
        CommandValue::Uint16(values) => {
            for value in values {
                bytes
                    .write_u16::<LittleEndian>(*value)
                    .context(WriteElementSnafu { tag })?;
            }
        }
        CommandValue::Uid(value) => {
            ensure!(value.is_ascii(), InvalidTextSnafu { tag });
            bytes.extend_from_slice(value.as_bytes());
            // UI values are padded to even length with a trailing NUL
            if bytes.len() % 2 != 0 {
                bytes.push(0);
            }
        }
        CommandValue::Text(value) => {
            ensure!(value.is_ascii(), InvalidTextSnafu { tag });
            bytes.extend_from_slice(value.as_bytes());
            // text values are padded to even length with a trailing space
            if bytes.len() % 2 != 0 {
                bytes.push(b' ');
            }
        }
        CommandValue::TagList(values) => {
            for value in values {
                bytes
                    .write_u16::<LittleEndian>(value.group())
                    .context(WriteElementSnafu { tag })?;
                bytes
                    .write_u16::<LittleEndian>(value.element())
                    .context(WriteElementSnafu { tag })?;
            }
        }
        CommandValue::Bytes(value) => {
            bytes.extend_from_slice(value);
        }
    }
    Ok(bytes)
}

fn decode_value(tag: Tag, bytes: &[u8]) -> Result<CommandValue> {
    let class = match dictionary_entry(tag) {
        Some((_, _, class)) => *class,
        None => return Ok(CommandValue::Bytes(bytes.to_vec())),
    };

    let mut cursor = Cursor::new(bytes);
    match class {
        ValueClass::Uint32 => {
            ensure!(
                bytes.len() == 4,
                InvalidElementLengthSnafu {
                    tag,
                    length: bytes.len() as u32
                }
            );
            let value = cursor
                .read_u32::<LittleEndian>()
                .context(ReadElementValueSnafu { tag })?;
            Ok(CommandValue::Uint32(value))
        }
        ValueClass::Uint16 => {
            ensure!(
                bytes.len() % 2 == 0,
                InvalidElementLengthSnafu {
                    tag,
                    length: bytes.len() as u32
                }
            );
            let mut values = Vec::with_capacity(bytes.len() / 2);
            for _ in 0..bytes.len() / 2 {
                values.push(
                    cursor
                        .read_u16::<LittleEndian>()
                        .context(ReadElementValueSnafu { tag })?,
                );
            }
            Ok(CommandValue::Uint16(values))
        }
        ValueClass::Uid => {
            let text = std::str::from_utf8(bytes)
                .ok()
                .filter(|s| s.is_ascii())
                .context(InvalidTextSnafu { tag })?;
            Ok(CommandValue::Uid(
                text.trim_end_matches(['\0', ' ']).to_string(),
            ))
        }
        ValueClass::Text => {
            let text = std::str::from_utf8(bytes)
                .ok()
                .filter(|s| s.is_ascii())
                .context(InvalidTextSnafu { tag })?;
            Ok(CommandValue::Text(text.trim_matches(' ').to_string()))
        }
        ValueClass::TagList => {
            ensure!(
                bytes.len() % 4 == 0,
                InvalidElementLengthSnafu {
                    tag,
                    length: bytes.len() as u32
                }
            );
            let mut values = Vec::with_capacity(bytes.len() / 4);
            for _ in 0..bytes.len() / 4 {
                let group = cursor
                    .read_u16::<LittleEndian>()
                    .context(ReadElementValueSnafu { tag })?;
                let element = cursor
                    .read_u16::<LittleEndian>()
                    .context(ReadElementValueSnafu { tag })?;
                values.push(Tag(group, element));
            }
            Ok(CommandValue::TagList(values))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tags;
    use matches::assert_matches;

    fn echo_rq_command_set() -> CommandSet {
        let mut command = CommandSet::new();
        command.put_uid(tags::AFFECTED_SOP_CLASS_UID, "1.2.840.10008.1.1");
        command.put_u16(tags::COMMAND_FIELD, 0x0030);
        command.put_u16(tags::MESSAGE_ID, 1);
        command.put_u16(tags::COMMAND_DATA_SET_TYPE, 0x0101);
        command
    }

    #[test]
    fn encode_decode_roundtrip() {
        let command = echo_rq_command_set();
        let bytes = command.encode().unwrap();
        let decoded = CommandSet::decode(&bytes).unwrap();

        assert_eq!(decoded.u16_value(tags::COMMAND_FIELD), Some(0x0030));
        assert_eq!(decoded.u16_value(tags::MESSAGE_ID), Some(1));
        assert_eq!(
            decoded.str_value(tags::AFFECTED_SOP_CLASS_UID),
            Some("1.2.840.10008.1.1")
        );
        assert_eq!(decoded.u16_value(tags::COMMAND_DATA_SET_TYPE), Some(0x0101));
    }

    #[test]
    fn group_length_covers_the_remainder() {
        let command = echo_rq_command_set();
        let bytes = command.encode().unwrap();

        // the first element must be (0000,0000) with a 4-byte value
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[4..8], &[0x04, 0x00, 0x00, 0x00]);
        let group_length = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        assert_eq!(group_length as usize, bytes.len() - 12);

        let decoded = CommandSet::decode(&bytes).unwrap();
        assert_eq!(
            decoded.get(tags::COMMAND_GROUP_LENGTH),
            Some(&CommandValue::Uint32(group_length))
        );
    }

    #[test]
    fn elements_are_encoded_in_tag_order() {
        // insertion order must not leak into the wire order
        let mut command = CommandSet::new();
        command.put_u16(tags::COMMAND_DATA_SET_TYPE, 0x0101);
        command.put_u16(tags::MESSAGE_ID, 7);
        command.put_u16(tags::COMMAND_FIELD, 0x0030);
        command.put_uid(tags::AFFECTED_SOP_CLASS_UID, "1.2.840.10008.1.1");

        let bytes = command.encode().unwrap();
        let reference = echo_rq_command_set();
        let mut reference = reference;
        reference.put_u16(tags::MESSAGE_ID, 7);
        assert_eq!(bytes, reference.encode().unwrap());
    }

    #[test]
    fn odd_uid_is_nul_padded() {
        let mut command = CommandSet::new();
        command.put_uid(tags::AFFECTED_SOP_CLASS_UID, "1.2.840.10008.1.1");
        let bytes = command.encode().unwrap();

        // element header: 12 bytes of group length element,
        // then tag (4) + length (4) of the UID element
        let length = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        assert_eq!(length, 18);
        assert_eq!(bytes[20 + 17], 0x00);

        let decoded = CommandSet::decode(&bytes).unwrap();
        assert_eq!(
            decoded.str_value(tags::AFFECTED_SOP_CLASS_UID),
            Some("1.2.840.10008.1.1")
        );
    }

    #[test]
    fn odd_text_is_space_padded() {
        let mut command = CommandSet::new();
        command.put_text(tags::MOVE_DESTINATION, "STORE");
        let bytes = command.encode().unwrap();

        let length = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        assert_eq!(length, 6);
        assert_eq!(bytes[20 + 5], b' ');

        let decoded = CommandSet::decode(&bytes).unwrap();
        assert_eq!(decoded.str_value(tags::MOVE_DESTINATION), Some("STORE"));
    }

    #[test]
    fn unknown_elements_are_kept_as_bytes() {
        let mut command = CommandSet::new();
        command.put(Tag(0x0000, 0x5150), CommandValue::Bytes(vec![1, 2, 3, 4]));
        let bytes = command.encode().unwrap();
        let decoded = CommandSet::decode(&bytes).unwrap();
        assert_eq!(
            decoded.get(Tag(0x0000, 0x5150)),
            Some(&CommandValue::Bytes(vec![1, 2, 3, 4]))
        );
    }

    #[test]
    fn truncated_element_is_an_error() {
        let command = echo_rq_command_set();
        let mut bytes = command.encode().unwrap();
        bytes.truncate(bytes.len() - 1);
        let result = CommandSet::decode(&bytes);
        assert_matches!(result, Err(Error::ReadElementValue { .. }));
    }

    #[test]
    fn missing_required_element_is_reported_by_keyword() {
        let command = CommandSet::new();
        let result = command.require_u16(tags::MESSAGE_ID, "MessageID");
        assert_matches!(
            result,
            Err(Error::MissingElement {
                keyword: "MessageID",
                ..
            })
        );
    }
}
