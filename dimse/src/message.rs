//! DIMSE message framing over presentation data values.
//!
//! On send, an encoded command set and its optional data set are
//! partitioned into PDV fragments sized against the peer's maximum
//! PDU length. On receive, a [`MessageAssembler`] accumulates PDV
//! fragments until both the command set and (when announced) the
//! data set are complete.

use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use tracing::trace;

use netdicom_ul::pdu::{PDataValue, PDataValueType, PDATA_VALUE_OVERHEAD};

use crate::cmdset::CommandSet;
use crate::commands::{tags, NO_DATA_SET};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display(
        "maximum PDU length {} cannot fit any message fragment",
        max_pdu_length
    ))]
    MaxPduTooSmall {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    /// a data set fragment arrived before any command set fragment
    DataBeforeCommand { backtrace: Backtrace },

    /// a fragment arrived after its set was already complete
    FragmentAfterLast { backtrace: Backtrace },

    #[snafu(display(
        "fragment of presentation context {} interleaved into a message of context {}",
        got,
        expected
    ))]
    ContextInterleaved {
        expected: u8,
        got: u8,
        backtrace: Backtrace,
    },

    /// could not decode the reassembled command set
    #[snafu(display("could not decode reassembled command set"))]
    DecodeCommandSet {
        #[snafu(backtrace)]
        source: crate::cmdset::Error,
    },

    /// the reassembled command set has no data set type element
    MissingDataSetType { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// When the peer does not bound the PDU length (a maximum of zero),
/// fragments are still capped to keep each P-DATA-TF bounded.
const UNLIMITED_FRAGMENT_SIZE: u32 = netdicom_ul::pdu::DEFAULT_MAX_PDU;

/// Partition an encoded message into P-DATA-TF payloads.
///
/// `max_pdu_length` is the maximum PDU length announced by the peer
/// (0 for no limit).
/// Each produced `Vec<PDataValue>` is the payload of one P-DATA-TF PDU
/// holding a single fragment:
/// first the command set fragments,
/// then the data set fragments,
/// each run ending with a fragment marked last.
pub fn fragment_message(
    presentation_context_id: u8,
    command_bytes: &[u8],
    dataset_bytes: Option<&[u8]>,
    max_pdu_length: u32,
) -> Result<Vec<Vec<PDataValue>>> {
    let effective = if max_pdu_length == 0 {
        UNLIMITED_FRAGMENT_SIZE
    } else {
        max_pdu_length
    };
    // a PDV leaves 6 bytes of item overhead inside the PDU
    ensure!(
        effective > PDATA_VALUE_OVERHEAD,
        MaxPduTooSmallSnafu {
            max_pdu_length: effective
        }
    );
    let fragment_size = (effective - PDATA_VALUE_OVERHEAD) as usize;

    let mut pdus = Vec::new();
    for (bytes, value_type) in std::iter::once((command_bytes, PDataValueType::Command)).chain(
        dataset_bytes
            .iter()
            .map(|bytes| (&bytes[..], PDataValueType::Data)),
    ) {
        let mut chunks = bytes.chunks(fragment_size).peekable();
        // an empty set still needs its (empty) last fragment
        if chunks.peek().is_none() {
            pdus.push(vec![PDataValue {
                presentation_context_id,
                value_type,
                is_last: true,
                data: Vec::new(),
            }]);
            continue;
        }
        while let Some(chunk) = chunks.next() {
            pdus.push(vec![PDataValue {
                presentation_context_id,
                value_type,
                is_last: chunks.peek().is_none(),
                data: chunk.to_vec(),
            }]);
        }
    }

    trace!(
        "message fragmented into {} PDUs of at most {} payload bytes",
        pdus.len(),
        fragment_size
    );
    Ok(pdus)
}

/// A fully reassembled message, before parameter mapping.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct RawMessage {
    /// the presentation context all fragments arrived on
    pub presentation_context_id: u8,
    /// the decoded command set
    pub command_set: CommandSet,
    /// the reassembled data set, when the command set announced one
    pub dataset: Option<Vec<u8>>,
}

/// Reassembles messages from a stream of PDV fragments.
///
/// One assembler serves one association;
/// all fragments of a message must share one presentation context.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    context_id: Option<u8>,
    command_buffer: Vec<u8>,
    command_complete: bool,
    command_set: Option<CommandSet>,
    expecting_dataset: bool,
    data_buffer: Vec<u8>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        MessageAssembler::default()
    }

    /// Whether a message is currently half assembled.
    pub fn in_progress(&self) -> bool {
        self.context_id.is_some()
    }

    /// Drop any partial assembly state.
    ///
    /// Called when the association is aborted mid-message.
    pub fn clear(&mut self) {
        *self = MessageAssembler::default();
    }

    /// Feed one PDV fragment.
    ///
    /// Returns the reassembled message once the final fragment
    /// of the message arrives.
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<RawMessage>> {
        match self.context_id {
            Some(expected) => ensure!(
                expected == pdv.presentation_context_id,
                ContextInterleavedSnafu {
                    expected,
                    got: pdv.presentation_context_id
                }
            ),
            None => self.context_id = Some(pdv.presentation_context_id),
        }

        match pdv.value_type {
            PDataValueType::Command => {
                ensure!(!self.command_complete, FragmentAfterLastSnafu);
                self.command_buffer.extend_from_slice(&pdv.data);
                if pdv.is_last {
                    self.command_complete = true;
                    let command_set =
                        CommandSet::decode(&self.command_buffer).context(DecodeCommandSetSnafu)?;
                    let data_set_type = command_set
                        .u16_value(tags::COMMAND_DATA_SET_TYPE)
                        .context(MissingDataSetTypeSnafu)?;
                    self.expecting_dataset = data_set_type != NO_DATA_SET;
                    self.command_set = Some(command_set);
                    if !self.expecting_dataset {
                        return Ok(Some(self.take_message(false)));
                    }
                }
                Ok(None)
            }
            PDataValueType::Data => {
                ensure!(self.command_complete, DataBeforeCommandSnafu);
                self.data_buffer.extend_from_slice(&pdv.data);
                if pdv.is_last {
                    return Ok(Some(self.take_message(true)));
                }
                Ok(None)
            }
        }
    }

    fn take_message(&mut self, with_dataset: bool) -> RawMessage {
        let message = RawMessage {
            presentation_context_id: self.context_id.take().unwrap_or_default(),
            command_set: self.command_set.take().unwrap_or_default(),
            dataset: with_dataset.then(|| std::mem::take(&mut self.data_buffer)),
        };
        self.clear();
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tags;
    use crate::params::{CEchoRq, CStoreRq, DimseMessage, Priority};
    use matches::assert_matches;

    fn store_rq_bytes(dataset_len: usize) -> (Vec<u8>, Vec<u8>) {
        let message = DimseMessage::CStoreRq(CStoreRq {
            message_id: 1,
            affected_sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
            affected_sop_instance_uid: "1.2.3.4".to_string(),
            priority: Priority::Medium,
            move_originator_ae_title: None,
            move_originator_message_id: None,
            dataset: (0..dataset_len).map(|i| i as u8).collect(),
        });
        let command_bytes = message.to_command_set().unwrap().encode().unwrap();
        let dataset_bytes = message.dataset().unwrap().to_vec();
        (command_bytes, dataset_bytes)
    }

    #[test]
    fn reassemble_inverts_fragment() {
        let (command_bytes, dataset_bytes) = store_rq_bytes(500);

        for max_pdu in [64u32, 128, 1024, 16_384, 0] {
            let pdus = fragment_message(3, &command_bytes, Some(&dataset_bytes), max_pdu).unwrap();

            let mut assembler = MessageAssembler::new();
            let mut outcome = None;
            for pdvs in pdus {
                for pdv in pdvs {
                    if let Some(message) = assembler.push(pdv).unwrap() {
                        outcome = Some(message);
                    }
                }
            }

            let message = outcome.expect("message must complete");
            assert_eq!(message.presentation_context_id, 3);
            assert_eq!(message.command_set.u16_value(tags::COMMAND_FIELD), Some(0x0001));
            assert_eq!(message.dataset.as_deref(), Some(&dataset_bytes[..]));
        }
    }

    #[test]
    fn dataset_split_matches_the_expected_fragment_count() {
        // a 500 byte data set against a maximum length of 128
        // makes ceil(500 / 122) = 5 fragments
        let (command_bytes, dataset_bytes) = store_rq_bytes(500);
        let pdus = fragment_message(1, &command_bytes, Some(&dataset_bytes), 128).unwrap();

        let data_pdvs: Vec<&PDataValue> = pdus
            .iter()
            .flatten()
            .filter(|pdv| pdv.value_type == PDataValueType::Data)
            .collect();
        assert_eq!(data_pdvs.len(), 5);
        for pdv in &data_pdvs[..4] {
            assert_eq!(pdv.data.len(), 122);
            assert!(!pdv.is_last);
        }
        assert_eq!(data_pdvs[4].data.len(), 500 - 4 * 122);
        assert!(data_pdvs[4].is_last);

        // every PDU fits in the negotiated maximum
        for pdvs in &pdus {
            let length: usize = pdvs.iter().map(|pdv| pdv.data.len() + 6).sum();
            assert!(length <= 128);
        }
    }

    #[test]
    fn command_only_message_completes_without_dataset() {
        let message = DimseMessage::CEchoRq(CEchoRq {
            message_id: 1,
            affected_sop_class_uid: "1.2.840.10008.1.1".to_string(),
        });
        let command_bytes = message.to_command_set().unwrap().encode().unwrap();
        let pdus = fragment_message(1, &command_bytes, None, 16_384).unwrap();
        assert_eq!(pdus.len(), 1);

        let mut assembler = MessageAssembler::new();
        let mut outcome = None;
        for pdv in pdus.into_iter().flatten() {
            outcome = assembler.push(pdv).unwrap();
        }
        let raw = outcome.expect("message must complete");
        assert_eq!(raw.dataset, None);
        let rebuilt = DimseMessage::from_command_set(&raw.command_set, raw.dataset).unwrap();
        assert_eq!(rebuilt, message);
    }

    #[test]
    fn too_small_maximum_is_a_protocol_error() {
        let (command_bytes, dataset_bytes) = store_rq_bytes(16);
        for max_pdu in [1u32, 6] {
            let result = fragment_message(1, &command_bytes, Some(&dataset_bytes), max_pdu);
            assert_matches!(result, Err(Error::MaxPduTooSmall { .. }));
        }
        // 7 is the smallest workable maximum: one payload byte per PDV
        assert!(fragment_message(1, &command_bytes, Some(&dataset_bytes), 7).is_ok());
    }

    #[test]
    fn data_before_command_is_refused() {
        let mut assembler = MessageAssembler::new();
        let result = assembler.push(PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: false,
            data: vec![1, 2, 3],
        });
        assert_matches!(result, Err(Error::DataBeforeCommand { .. }));
    }

    #[test]
    fn interleaved_context_is_refused() {
        let (command_bytes, _) = store_rq_bytes(8);
        let pdus = fragment_message(1, &command_bytes, None, 64).unwrap();
        let mut assembler = MessageAssembler::new();

        // feed the first command fragment from context 1
        let first = pdus[0][0].clone();
        assert!(!first.is_last, "test needs at least two fragments");
        assembler.push(first).unwrap();

        // then inject a fragment of another context
        let result = assembler.push(PDataValue {
            presentation_context_id: 3,
            value_type: PDataValueType::Command,
            is_last: false,
            data: vec![0],
        });
        assert_matches!(
            result,
            Err(Error::ContextInterleaved {
                expected: 1,
                got: 3,
                ..
            })
        );
    }

    #[test]
    fn partial_state_can_be_discarded() {
        let (command_bytes, dataset_bytes) = store_rq_bytes(300);
        let pdus = fragment_message(1, &command_bytes, Some(&dataset_bytes), 128).unwrap();

        let mut assembler = MessageAssembler::new();
        // feed only the first two PDVs of the message
        for pdvs in pdus.into_iter().take(2) {
            for pdv in pdvs {
                assembler.push(pdv).unwrap();
            }
        }
        assert!(assembler.in_progress());
        assembler.clear();
        assert!(!assembler.in_progress());

        // the assembler accepts a fresh message afterwards
        let message = DimseMessage::CEchoRq(CEchoRq {
            message_id: 9,
            affected_sop_class_uid: "1.2.840.10008.1.1".to_string(),
        });
        let command_bytes = message.to_command_set().unwrap().encode().unwrap();
        let mut outcome = None;
        for pdv in fragment_message(5, &command_bytes, None, 0)
            .unwrap()
            .into_iter()
            .flatten()
        {
            outcome = assembler.push(pdv).unwrap();
        }
        assert!(outcome.is_some());
    }
}
