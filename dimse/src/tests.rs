//! End-to-end exchanges between two application entities
//! over loopback TCP connections.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use matches::assert_matches;

use netdicom_ul::association::acse::{AcseProvider, AssociateParams};
use netdicom_ul::association::negotiation::PresentationContext;
use netdicom_ul::pdu::{
    read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource, PDataValueType, Pdu,
    DEFAULT_MAX_PDU,
};
use netdicom_ul::provider::UlProviderOptions;
use netdicom_ul::AeAddr;

use crate::ae::{ApplicationEntity, ServiceContext, ServiceHandlers, SubOperation, SubOperationQueue, SubOperations, QueryResponses};
use crate::message::fragment_message;
use crate::params::{CStoreRq, DimseMessage};
use crate::service;
use crate::status::Status;

const VERIFICATION: &str = "1.2.840.10008.1.1";
const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
const STUDY_ROOT_QR_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
const STUDY_ROOT_QR_GET: &str = "1.2.840.10008.5.1.4.1.2.2.3";
const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

fn verification_context() -> PresentationContext {
    PresentationContext::new(1, VERIFICATION, vec![IMPLICIT_VR_LE.to_string()]).unwrap()
}

fn storage_context(id: u8) -> PresentationContext {
    PresentationContext::new(id, CT_IMAGE_STORAGE, vec![IMPLICIT_VR_LE.to_string()]).unwrap()
}

fn scu(title: &str) -> ApplicationEntity {
    ApplicationEntity::new(title)
        .unwrap()
        .acse_timeout(Some(Duration::from_secs(5)))
        .dimse_timeout(Some(Duration::from_secs(5)))
}

fn peer(addr: std::net::SocketAddr, title: &str) -> AeAddr {
    AeAddr::new(title, addr)
}

#[derive(Default)]
struct RecordingHandlers {
    stored: Mutex<Vec<(String, Vec<u8>)>>,
    store_called: AtomicBool,
    find_matches: Mutex<Vec<Vec<u8>>>,
    get_items: Mutex<Vec<SubOperation>>,
}

impl ServiceHandlers for RecordingHandlers {
    fn on_c_store(&self, dataset: Vec<u8>, ctx: &ServiceContext) -> Status {
        self.store_called.store(true, Ordering::Release);
        self.stored
            .lock()
            .unwrap()
            .push((ctx.presentation_context.abstract_syntax.clone(), dataset));
        Status::SUCCESS
    }

    fn on_c_find(&self, _identifier: Vec<u8>, _ctx: &ServiceContext) -> Box<dyn QueryResponses> {
        let matches: Vec<_> = self
            .find_matches
            .lock()
            .unwrap()
            .iter()
            .map(|identifier| (Status::PENDING, Some(identifier.clone())))
            .collect();
        Box::new(matches.into_iter())
    }

    fn on_c_get(&self, _identifier: Vec<u8>, _ctx: &ServiceContext) -> Box<dyn SubOperations> {
        Box::new(SubOperationQueue::new(
            self.get_items.lock().unwrap().clone(),
        ))
    }
}

#[test]
fn c_echo_happy_path() {
    let handlers = Arc::new(RecordingHandlers::default());
    let scp = ApplicationEntity::new("ECHO-SCP")
        .unwrap()
        .with_supported_context(verification_context())
        .start(handlers)
        .unwrap();

    let mut association = scu("ECHO-SCU")
        .with_requested_context(verification_context())
        .associate(peer(scp.local_addr(), "ECHO-SCP"))
        .unwrap();

    let status = association.echo().unwrap();
    assert_eq!(status, Status::SUCCESS);

    association.release().unwrap();
}

#[test]
fn association_with_unknown_abstract_syntax_accepts_no_context() {
    let handlers = Arc::new(RecordingHandlers::default());
    let scp = ApplicationEntity::new("QR-SCP")
        .unwrap()
        .with_supported_context(verification_context())
        .start(handlers)
        .unwrap();

    let unknown =
        PresentationContext::new(1, "1.2.3.4.5.6", vec![IMPLICIT_VR_LE.to_string()]).unwrap();
    let outcome = scu("QR-SCU")
        .with_requested_context(unknown)
        .associate(peer(scp.local_addr(), "QR-SCP"));

    assert_matches!(
        outcome,
        Err(crate::ae::Error::NoAcceptedPresentationContexts { .. })
    );
}

#[test]
fn c_store_with_fragmented_dataset() {
    let handlers = Arc::new(RecordingHandlers::default());
    let scp = ApplicationEntity::new("STORE-SCP")
        .unwrap()
        // small maximum so the data set must be fragmented
        .maximum_pdu_size(128)
        .with_supported_context(storage_context(1))
        .start(Arc::clone(&handlers) as Arc<dyn ServiceHandlers>)
        .unwrap();

    let dataset: Vec<u8> = (0..500).map(|i| i as u8).collect();

    let mut association = scu("STORE-SCU")
        .with_requested_context(storage_context(1))
        .associate(peer(scp.local_addr(), "STORE-SCP"))
        .unwrap();
    let status = association
        .store(CT_IMAGE_STORAGE, "1.2.3.4.5.6.7.8", dataset.clone())
        .unwrap();
    assert_eq!(status, Status::SUCCESS);
    association.release().unwrap();

    let stored = handlers.stored.lock().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].0, CT_IMAGE_STORAGE);
    assert_eq!(stored[0].1, dataset);
}

#[test]
fn abort_mid_message_discards_partial_state() {
    let handlers = Arc::new(RecordingHandlers::default());
    let scp = ApplicationEntity::new("STORE-SCP")
        .unwrap()
        .with_supported_context(storage_context(1))
        .start(Arc::clone(&handlers) as Arc<dyn ServiceHandlers>)
        .unwrap();

    // drive the association by hand so the message can be cut short
    let mut acse = AcseProvider::new_requestor(
        scp.local_addr(),
        UlProviderOptions::default(),
        Some(Duration::from_secs(5)),
    )
    .unwrap();
    acse.request(AssociateParams {
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "STORE-SCP".to_string(),
        max_pdu_length: 128,
        presentation_contexts: vec![storage_context(1)],
        user_items: vec![],
    })
    .unwrap();

    let message = DimseMessage::CStoreRq(CStoreRq {
        message_id: 1,
        affected_sop_class_uid: CT_IMAGE_STORAGE.to_string(),
        affected_sop_instance_uid: "1.2.3.4".to_string(),
        priority: crate::params::Priority::Medium,
        move_originator_ae_title: None,
        move_originator_message_id: None,
        dataset: (0..500u16).map(|i| i as u8).collect(),
    });
    let command_bytes = message.to_command_set().unwrap().encode().unwrap();
    let pdus = fragment_message(1, &command_bytes, message.dataset(), 128).unwrap();
    assert!(pdus.len() >= 4, "test needs a multi-PDU message");

    // send the command set and two data fragments, then abort
    let mut sent_data_fragments = 0;
    for pdvs in pdus {
        let is_data = pdvs
            .iter()
            .any(|pdv| pdv.value_type == PDataValueType::Data);
        acse.send_pdata(pdvs);
        if is_data {
            sent_data_fragments += 1;
            if sent_data_fragments == 2 {
                break;
            }
        }
    }
    acse.abort(AbortRQSource::ServiceUser);

    // the server must drop the association without storing anything
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while scp.active_associations() > 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(scp.active_associations(), 0);
    assert!(!handlers.store_called.load(Ordering::Acquire));
}

#[test]
fn invalid_pdu_type_is_answered_with_a_provider_abort() {
    let handlers = Arc::new(RecordingHandlers::default());
    let scp = ApplicationEntity::new("ECHO-SCP")
        .unwrap()
        .with_supported_context(verification_context())
        .start(handlers)
        .unwrap();

    // a first byte of 0x08 with a legal header shape
    let mut stream = std::net::TcpStream::connect(scp.local_addr()).unwrap();
    stream
        .write_all(&[0x08, 0x00, 0x00, 0x00, 0x00, 0x02, 0xAA, 0xBB])
        .unwrap();

    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let answer = read_pdu(&mut stream, DEFAULT_MAX_PDU, true).unwrap();
    assert_eq!(
        answer,
        Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPdu,
            ),
        }
    );
}

#[test]
fn association_request_timeout_aborts_and_reports() {
    // a listener that accepts and never answers
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let silent = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        // hold the connection open long enough to observe the abort
        let mut stream = stream;
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink);
        sink
    });

    let outcome = ApplicationEntity::new("ECHO-SCU")
        .unwrap()
        .acse_timeout(Some(Duration::from_millis(300)))
        .with_requested_context(verification_context())
        .associate(AeAddr::new("SILENT-SCP", addr));
    assert_matches!(
        outcome,
        Err(crate::ae::Error::Acse {
            source: netdicom_ul::association::acse::Error::Timeout { .. },
            ..
        })
    );

    // the peer observes an A-ASSOCIATE-RQ followed by a provider abort
    let bytes = silent.join().unwrap();
    assert_eq!(bytes[0], 0x01);
    let abort_at = bytes
        .iter()
        .position(|&b| b == 0x07)
        .expect("an A-ABORT must follow");
    let abort = read_pdu(&mut &bytes[abort_at..], DEFAULT_MAX_PDU, true).unwrap();
    assert_matches!(
        abort,
        Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(_),
        }
    );
}

#[test]
fn c_find_streams_pending_matches() {
    let handlers = Arc::new(RecordingHandlers::default());
    *handlers.find_matches.lock().unwrap() = vec![vec![1, 1, 1, 1], vec![2, 2, 2, 2]];

    let find_context =
        PresentationContext::new(1, STUDY_ROOT_QR_FIND, vec![IMPLICIT_VR_LE.to_string()])
            .unwrap();
    let scp = ApplicationEntity::new("FIND-SCP")
        .unwrap()
        .with_supported_context(find_context.clone())
        .start(Arc::clone(&handlers) as Arc<dyn ServiceHandlers>)
        .unwrap();

    let mut association = scu("FIND-SCU")
        .with_requested_context(find_context)
        .associate(peer(scp.local_addr(), "FIND-SCP"))
        .unwrap();
    let (status, matches) = association
        .find(STUDY_ROOT_QR_FIND, vec![0u8; 8])
        .unwrap();
    assert_eq!(status, Status::SUCCESS);
    assert_eq!(matches, vec![vec![1, 1, 1, 1], vec![2, 2, 2, 2]]);
    association.release().unwrap();
}

#[test]
fn c_get_runs_storage_sub_operations_over_the_same_association() {
    let handlers = Arc::new(RecordingHandlers::default());
    *handlers.get_items.lock().unwrap() = vec![
        SubOperation {
            sop_class_uid: CT_IMAGE_STORAGE.to_string(),
            sop_instance_uid: "1.2.3.1".to_string(),
            dataset: vec![0x11; 64],
        },
        SubOperation {
            sop_class_uid: CT_IMAGE_STORAGE.to_string(),
            sop_instance_uid: "1.2.3.2".to_string(),
            dataset: vec![0x22; 64],
        },
    ];

    let get_context =
        PresentationContext::new(1, STUDY_ROOT_QR_GET, vec![IMPLICIT_VR_LE.to_string()])
            .unwrap();
    let scp = ApplicationEntity::new("GET-SCP")
        .unwrap()
        .with_supported_context(get_context.clone())
        .with_supported_context(storage_context(3))
        .start(Arc::clone(&handlers) as Arc<dyn ServiceHandlers>)
        .unwrap();

    let mut association = scu("GET-SCU")
        .with_requested_context(get_context)
        .with_requested_context(storage_context(3))
        .associate(peer(scp.local_addr(), "GET-SCP"))
        .unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let outcome = association
        .get(STUDY_ROOT_QR_GET, vec![0u8; 8], move |rq| {
            sink.lock().unwrap().push((rq.affected_sop_instance_uid, rq.dataset));
            Status::SUCCESS
        })
        .unwrap();

    assert_eq!(outcome.status, Status::SUCCESS);
    assert_eq!(outcome.completed, 2);
    assert_eq!(outcome.failed, 0);
    let received = received.lock().unwrap();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].0, "1.2.3.1");
    assert_eq!(received[0].1, vec![0x11; 64]);
    assert_eq!(received[1].1, vec![0x22; 64]);

    association.release().unwrap();
}

#[test]
fn second_request_without_async_window_is_refused() {
    let handlers = Arc::new(RecordingHandlers::default());
    let scp = ApplicationEntity::new("ECHO-SCP")
        .unwrap()
        .with_supported_context(verification_context())
        .start(handlers)
        .unwrap();

    let mut association = scu("ECHO-SCU")
        .with_requested_context(verification_context())
        .associate(peer(scp.local_addr(), "ECHO-SCP"))
        .unwrap();

    let context_id = association.accepted_contexts()[0].id;
    let first = DimseMessage::CEchoRq(crate::params::CEchoRq {
        message_id: 1,
        affected_sop_class_uid: VERIFICATION.to_string(),
    });
    let second = DimseMessage::CEchoRq(crate::params::CEchoRq {
        message_id: 2,
        affected_sop_class_uid: VERIFICATION.to_string(),
    });

    association.send_message(context_id, &first).unwrap();
    let result = association.send_message(context_id, &second);
    assert_matches!(
        result,
        Err(crate::ae::Error::Dimse {
            source: service::Error::OperationInFlight { .. },
            ..
        })
    );

    // after the first response arrives, the next request is admitted
    let (_, answer) = association.receive_message().unwrap();
    assert_matches!(answer, DimseMessage::CEchoRsp(_));
    association.send_message(context_id, &second).unwrap();
    let (_, answer) = association.receive_message().unwrap();
    assert_matches!(answer, DimseMessage::CEchoRsp(_));

    association.release().unwrap();
}

#[test]
fn calling_ae_title_requirement_rejects_mismatch() {
    let handlers = Arc::new(RecordingHandlers::default());
    let scp = ApplicationEntity::new("PICKY-SCP")
        .unwrap()
        .require_calling_aet("TRUSTED-SCU")
        .with_supported_context(verification_context())
        .start(handlers)
        .unwrap();

    let outcome = scu("UNKNOWN-SCU")
        .with_requested_context(verification_context())
        .associate(peer(scp.local_addr(), "PICKY-SCP"));
    assert_matches!(outcome, Err(crate::ae::Error::Rejected { .. }));

    let mut association = scu("TRUSTED-SCU")
        .with_requested_context(verification_context())
        .associate(peer(scp.local_addr(), "PICKY-SCP"))
        .unwrap();
    assert_eq!(association.echo().unwrap(), Status::SUCCESS);
    association.release().unwrap();
}

#[test]
fn release_on_idle_association_is_orderly() {
    let handlers = Arc::new(RecordingHandlers::default());
    let mut scp = ApplicationEntity::new("IDLE-SCP")
        .unwrap()
        .with_supported_context(verification_context())
        .start(handlers)
        .unwrap();

    let mut association = scu("IDLE-SCU")
        .with_requested_context(verification_context())
        .associate(peer(scp.local_addr(), "IDLE-SCP"))
        .unwrap();
    association.release().unwrap();
    // releasing again is a no-op
    association.release().unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while scp.active_associations() > 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(scp.active_associations(), 0);
    scp.stop();
}

#[test]
fn write_then_read_pdu_stream_over_tcp() {
    // a PDU written through one socket arrives intact at the other
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let echo = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let pdu = read_pdu(&mut stream, DEFAULT_MAX_PDU, true).unwrap();
        write_pdu(&mut stream, &pdu).unwrap();
    });

    let mut stream = std::net::TcpStream::connect(addr).unwrap();
    let pdu = Pdu::ReleaseRQ;
    write_pdu(&mut stream, &pdu).unwrap();
    let answer = read_pdu(&mut stream, DEFAULT_MAX_PDU, true).unwrap();
    assert_eq!(answer, pdu);
    echo.join().unwrap();
}
