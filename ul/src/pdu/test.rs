use crate::pdu::reader::read_pdu;
use crate::pdu::writer::write_pdu;
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use matches::assert_matches;
use std::io::Cursor;

fn roundtrip(pdu: &Pdu) -> Pdu {
    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, pdu).unwrap();
    read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true).unwrap()
}

#[test]
fn can_read_write_associate_rq() {
    let association_rq = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU-AE".to_string(),
        called_ae_title: "SCP-AE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2".to_string(),
                    "1.2.840.10008.1.2.1".to_string(),
                ],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16_384),
            UserVariableItem::ImplementationClassUID("1.2.345.6.7890.1.2.3".to_string()),
            UserVariableItem::ImplementationVersionName("NETDICOM010".to_string()),
        ],
    });

    assert_eq!(roundtrip(&association_rq), association_rq);
}

#[test]
fn can_read_write_associate_rq_with_negotiation_items() {
    let association_rq = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU-AE".to_string(),
        called_ae_title: "SCP-AE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![
            UserVariableItem::MaxLength(32_768),
            UserVariableItem::ImplementationClassUID("1.2.345.6.7890.1.2.3".to_string()),
            UserVariableItem::AsyncOperationsWindow(4, 4),
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                scu_role: true,
                scp_role: false,
            }),
            UserVariableItem::SopClassExtendedNegotiation(
                "1.2.840.10008.5.1.4.1.2.2.1".to_string(),
                vec![0x01, 0x00, 0x00],
            ),
            UserVariableItem::SopClassCommonExtendedNegotiation(CommonExtendedNegotiation {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.88.22".to_string(),
                service_class_uid: "1.2.840.10008.4.2".to_string(),
                related_general_sop_class_uids: vec![
                    "1.2.840.10008.5.1.4.1.1.88.11".to_string(),
                ],
            }),
            UserVariableItem::UserIdentity(UserIdentity::new(
                true,
                UserIdentityType::UsernameAndPasscode,
                b"username".to_vec(),
                b"passcode".to_vec(),
            )),
            UserVariableItem::Unknown(0x70, vec![1, 2, 3, 4]),
        ],
    });

    assert_eq!(roundtrip(&association_rq), association_rq);
}

#[test]
fn can_read_write_associate_ac() {
    let association_ac = Pdu::AssociationAC(AssociationAC {
        protocol_version: 1,
        called_ae_title: "SCP-AE".to_string(),
        calling_ae_title: "SCU-AE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16_384),
            UserVariableItem::ImplementationClassUID("1.2.345.6.7890.1.2.3".to_string()),
            UserVariableItem::UserIdentityResponse(vec![0xAA, 0xBB]),
        ],
    });

    assert_eq!(roundtrip(&association_ac), association_ac);
}

#[test]
fn can_read_write_associate_rj() {
    let association_rj = Pdu::AssociationRJ(AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::CalledAETitleNotRecognized,
        ),
    });

    assert_eq!(roundtrip(&association_rj), association_rj);
}

#[test]
fn can_read_write_pdata() {
    let pdata = Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 3,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0; 64],
            },
            PDataValue {
                presentation_context_id: 3,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![0x55; 128],
            },
        ],
    };

    assert_eq!(roundtrip(&pdata), pdata);
}

#[test]
fn can_read_write_release_and_abort() {
    assert_eq!(roundtrip(&Pdu::ReleaseRQ), Pdu::ReleaseRQ);
    assert_eq!(roundtrip(&Pdu::ReleaseRP), Pdu::ReleaseRP);

    let abort = Pdu::AbortRQ {
        source: AbortRQSource::ServiceUser,
    };
    assert_eq!(roundtrip(&abort), abort);

    let abort = Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
    };
    assert_eq!(roundtrip(&abort), abort);
}

#[test]
fn reads_unknown_pdu_type() {
    // a PDU with type 0x08 and a well formed header
    let bytes = [0x08, 0x00, 0x00, 0x00, 0x00, 0x04, 0xCA, 0xFE, 0xBA, 0xBE];
    let pdu = read_pdu(&mut Cursor::new(&bytes[..]), DEFAULT_MAX_PDU, true).unwrap();
    assert_eq!(
        pdu,
        Pdu::Unknown {
            pdu_type: 0x08,
            data: vec![0xCA, 0xFE, 0xBA, 0xBE],
        }
    );
}

#[test]
fn pdu_length_field_matches_remainder() {
    let mut bytes = vec![0u8; 0];
    let association_rq = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU-AE".to_string(),
        called_ae_title: "SCP-AE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![UserVariableItem::MaxLength(16_384)],
    });
    write_pdu(&mut bytes, &association_rq).unwrap();

    let mut cursor = Cursor::new(&bytes[2..6]);
    let pdu_length = cursor.read_u32::<BigEndian>().unwrap();
    assert_eq!(pdu_length as usize, bytes.len() - PDU_HEADER_SIZE as usize);
}

#[test]
fn item_length_field_matches_contents() {
    // encode a lone application context item through an A-ASSOCIATE-RQ
    // and check the item length against its content length
    let mut bytes = vec![0u8; 0];
    let association_rq = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU-AE".to_string(),
        called_ae_title: "SCP-AE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![],
        user_variables: vec![],
    });
    write_pdu(&mut bytes, &association_rq).unwrap();

    // variable items start at offset 74 from the start of the PDU
    let item = &bytes[74..];
    assert_eq!(item[0], 0x10);
    let item_length = u16::from_be_bytes([item[2], item[3]]) as usize;
    assert_eq!(item_length, item.len() - 4);
    // the UID has odd length and is padded with a trailing NUL
    assert_eq!(item_length % 2, 0);
    assert_eq!(item[4 + item_length - 1], 0x00);
}

#[test]
fn odd_uids_are_padded_and_trimmed() {
    // 17 characters, padded to 18 on the wire
    let abstract_syntax = "1.2.840.10008.1.1";
    assert_eq!(abstract_syntax.len() % 2, 1);

    let association_rq = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU-AE".to_string(),
        called_ae_title: "SCP-AE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: abstract_syntax.to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![],
    });

    match roundtrip(&association_rq) {
        Pdu::AssociationRQ(AssociationRQ {
            presentation_contexts,
            ..
        }) => {
            assert_eq!(presentation_contexts[0].abstract_syntax, abstract_syntax);
        }
        pdu => panic!("Expected AssociationRQ, got {:?}", pdu),
    }
}

#[test]
fn rejects_even_presentation_context_id() {
    let association_rq = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU-AE".to_string(),
        called_ae_title: "SCP-AE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 2,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![],
    });

    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, &association_rq).unwrap();

    let result = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true);
    assert_matches!(
        result,
        Err(reader::Error::InvalidPresentationContextId { id: 2, .. })
    );
}

#[test]
fn rejects_unsupported_protocol_version() {
    let association_rq = Pdu::AssociationRQ(AssociationRQ {
        // bit 0 clear
        protocol_version: 2,
        calling_ae_title: "SCU-AE".to_string(),
        called_ae_title: "SCP-AE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![],
        user_variables: vec![],
    });

    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, &association_rq).unwrap();

    let result = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true);
    assert_matches!(
        result,
        Err(reader::Error::UnsupportedProtocolVersion {
            protocol_version: 2,
            ..
        })
    );
}

#[test]
fn rejects_pdu_past_maximum_length_in_strict_mode() {
    let pdata = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; MINIMUM_PDU_SIZE as usize + 1],
        }],
    };

    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, &pdata).unwrap();

    let result = read_pdu(&mut Cursor::new(&bytes), MINIMUM_PDU_SIZE, true);
    assert_matches!(result, Err(reader::Error::PduTooLarge { .. }));

    // non-strict mode tolerates it
    let pdu = read_pdu(&mut Cursor::new(&bytes), MINIMUM_PDU_SIZE, false).unwrap();
    assert_matches!(pdu, Pdu::PData { .. });
}

#[test]
fn rejects_invalid_role_selection_byte() {
    // hand-craft a role selection sub-item with an SCU role byte of 2
    let mut bytes = vec![0u8; 0];
    let association_rq = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU-AE".to_string(),
        called_ae_title: "SCP-AE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![],
        user_variables: vec![UserVariableItem::RoleSelection(RoleSelection {
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
            scu_role: true,
            scp_role: false,
        })],
    });
    write_pdu(&mut bytes, &association_rq).unwrap();

    // the SCU role byte is the second-to-last byte of the message
    let index = bytes.len() - 2;
    assert_eq!(bytes[index], 0x01);
    bytes[index] = 0x02;

    let result = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true);
    assert_matches!(result, Err(reader::Error::InvalidRoleByte { value: 2, .. }));
}

#[test]
fn rejects_secondary_field_without_passcode_type() {
    let mut bytes = vec![0u8; 0];
    let association_rq = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU-AE".to_string(),
        called_ae_title: "SCP-AE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![],
        user_variables: vec![UserVariableItem::UserIdentity(UserIdentity::new(
            false,
            UserIdentityType::UsernameAndPasscode,
            b"username".to_vec(),
            b"oops".to_vec(),
        ))],
    });
    write_pdu(&mut bytes, &association_rq).unwrap();

    // rewrite the identity type byte from 2 (username and passcode) to 1
    // (username); the secondary field is now misplaced
    let needle = b"username";
    let pos = bytes
        .windows(needle.len())
        .position(|w| w == needle)
        .unwrap();
    // the type byte sits 4 bytes before the primary field length prefix
    let type_index = pos - 4;
    assert_eq!(bytes[type_index], 0x02);
    bytes[type_index] = 0x01;

    let result = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true);
    assert_matches!(
        result,
        Err(reader::Error::UnexpectedSecondaryField {
            identity_type: 1,
            ..
        })
    );
}

#[test]
fn rejects_truncated_pdu() {
    let mut bytes = vec![0u8; 0];
    write_pdu(
        &mut bytes,
        &Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        },
    )
    .unwrap();

    // declared length of 4, but only 2 content bytes available
    bytes.truncate(8);
    let result = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true);
    assert!(result.is_err());
}
