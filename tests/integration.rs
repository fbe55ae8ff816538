//! Integration tests for fastgate.
//!
//! These tests verify the integration between the wire codec modules.

use fastgate::protocol::{
    encode_record, params, BeginRequestBody, EndRequestBody, Header, ProtocolStatus, RecordBuffer,
    RecordType, Role, HEADER_SIZE, KEEP_CONN,
};

/// Test a full record encode/decode cycle with a name-value payload.
#[test]
fn test_record_with_params_payload() {
    let pairs = [
        ("SCRIPT_FILENAME", "/srv/www/index.php"),
        ("REQUEST_METHOD", "POST"),
        ("QUERY_STRING", "a=1&b=2"),
    ];
    let chunks = params::encode_pairs(pairs.iter().copied()).unwrap();
    assert_eq!(chunks.len(), 1);

    let record_bytes = encode_record(RecordType::Params, 9, &chunks[0]);
    assert_eq!(record_bytes.len() % 8, 0);

    let mut buffer = RecordBuffer::new();
    let records = buffer.push(&record_bytes).unwrap();
    assert_eq!(records.len(), 1);

    let decoded = params::decode_pairs(records[0].payload()).unwrap();
    assert_eq!(decoded.len(), 3);
    assert_eq!(decoded[0].0, "SCRIPT_FILENAME");
    assert_eq!(decoded[2].1, "a=1&b=2");
}

/// Test the full record sequence of one Responder request.
#[test]
fn test_responder_request_record_sequence() {
    let id = 1;
    let mut wire = Vec::new();

    let begin = BeginRequestBody {
        role: Role::Responder,
        flags: KEEP_CONN,
    };
    wire.extend_from_slice(&encode_record(RecordType::BeginRequest, id, &begin.encode()));

    let chunks = params::encode_pairs([("REQUEST_METHOD", "GET")]).unwrap();
    for chunk in &chunks {
        wire.extend_from_slice(&encode_record(RecordType::Params, id, chunk));
    }
    wire.extend_from_slice(&encode_record(RecordType::Params, id, &[]));
    wire.extend_from_slice(&encode_record(RecordType::Stdin, id, &[]));

    let mut buffer = RecordBuffer::new();
    let records = buffer.push(&wire).unwrap();

    assert_eq!(records.len(), 4);
    assert_eq!(records[0].rtype(), RecordType::BeginRequest);
    let begin_rt = BeginRequestBody::decode(records[0].payload()).unwrap();
    assert_eq!(begin_rt.role, Role::Responder);
    assert!(begin_rt.keep_conn());

    assert_eq!(records[1].rtype(), RecordType::Params);
    assert!(!records[1].payload().is_empty());
    assert!(records[2].is_stream_end());
    assert_eq!(records[3].rtype(), RecordType::Stdin);
    assert!(records[3].is_stream_end());
}

/// Test the response side: stdout chunks, stderr, then END_REQUEST.
#[test]
fn test_response_record_sequence() {
    let id = 3;
    let mut wire = Vec::new();
    wire.extend_from_slice(&encode_record(
        RecordType::Stdout,
        id,
        b"Content-Type: text/plain\n\n",
    ));
    wire.extend_from_slice(&encode_record(RecordType::Stdout, id, b"hello"));
    wire.extend_from_slice(&encode_record(RecordType::Stderr, id, b"warned"));
    let end = EndRequestBody {
        app_status: 0,
        protocol_status: ProtocolStatus::RequestComplete,
    };
    wire.extend_from_slice(&encode_record(RecordType::EndRequest, id, &end.encode()));

    let mut buffer = RecordBuffer::new();
    let records = buffer.push(&wire).unwrap();

    assert_eq!(records.len(), 4);
    let stdout: Vec<u8> = records
        .iter()
        .filter(|r| r.rtype() == RecordType::Stdout)
        .flat_map(|r| r.payload().to_vec())
        .collect();
    assert_eq!(stdout, b"Content-Type: text/plain\n\nhello");

    let end_rt = EndRequestBody::decode(records[3].payload()).unwrap();
    assert_eq!(end_rt.protocol_status, ProtocolStatus::RequestComplete);
}

/// Test record round-trips across content lengths, padding dropped.
#[test]
fn test_record_roundtrip_across_sizes() {
    let mut buffer = RecordBuffer::new();
    for len in [0usize, 1, 7, 8, 127, 128, 1000, 65535] {
        let payload = vec![0x7Fu8; len];
        let bytes = encode_record(RecordType::Stdout, 12, &payload);

        let records = buffer.push(&bytes).unwrap();
        assert_eq!(records.len(), 1, "content length {len}");
        assert_eq!(records[0].payload().len(), len);
        assert_eq!(records[0].header.content_length as usize, len);
        assert!(buffer.is_empty());
    }
}

/// Test that a large parameter set splits into multiple PARAMS records
/// and reassembles from the concatenated stream.
#[test]
fn test_large_params_split_and_reassemble() {
    let big = "v".repeat(30_000);
    let pairs: Vec<(String, String)> = (0..8).map(|i| (format!("KEY_{i}"), big.clone())).collect();

    let chunks =
        params::encode_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))).unwrap();
    assert!(chunks.len() > 1);

    let mut stream = Vec::new();
    for chunk in &chunks {
        let record_bytes = encode_record(RecordType::Params, 2, chunk);
        let mut buffer = RecordBuffer::new();
        let records = buffer.push(&record_bytes).unwrap();
        stream.extend_from_slice(records[0].payload());
    }

    let decoded = params::decode_pairs(&stream).unwrap();
    assert_eq!(decoded.len(), 8);
    for (i, (name, value)) in decoded.iter().enumerate() {
        assert_eq!(name, &format!("KEY_{i}"));
        assert_eq!(value.len(), 30_000);
    }
}

/// Test header arithmetic against hand-built wire bytes.
#[test]
fn test_header_against_reference_bytes() {
    // version 1, STDOUT, request 258, 5 bytes content, 3 bytes padding.
    let reference = [1u8, 6, 0x01, 0x02, 0x00, 0x05, 3, 0];
    let header = Header::decode(&reference).unwrap();

    assert_eq!(header.rtype, RecordType::Stdout);
    assert_eq!(header.request_id, 258);
    assert_eq!(header.content_length, 5);
    assert_eq!(header.padding_length, 3);
    assert_eq!(header.encode(), reference);
    assert_eq!(HEADER_SIZE, 8);
}
