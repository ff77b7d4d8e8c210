//! Wire codec tests through the public API
//!
//! Byte-exact vectors for the packets the session writes and reads, and
//! stream framing across arbitrary read boundaries.

use bytes::{Buf, Bytes, BytesMut};
use mqttsub::protocol::codec::{decode, decode_with_limit, encode, encode_to_bytes};
use mqttsub::protocol::{
    CodecError, Connect, Packet, ProtocolVersion, Publish, QoS, SubAck, Subscribe,
    SubscribeReturnCode, Unsubscribe,
};
use proptest::prelude::*;

#[test]
fn test_subscribe_wire_bytes() {
    let packet = Packet::Subscribe(Subscribe {
        packet_id: 10,
        filters: vec![("a/b".to_string(), QoS::AtLeastOnce)],
    });

    let bytes = encode_to_bytes(&packet).unwrap();

    assert_eq!(
        bytes.as_ref(),
        &[0x82, 0x08, 0x00, 0x0A, 0x00, 0x03, b'a', b'/', b'b', 0x01]
    );
}

#[test]
fn test_unsubscribe_wire_bytes() {
    let packet = Packet::Unsubscribe(Unsubscribe {
        packet_id: 2,
        filters: vec!["x".to_string()],
    });

    let bytes = encode_to_bytes(&packet).unwrap();

    assert_eq!(bytes.as_ref(), &[0xA2, 0x05, 0x00, 0x02, 0x00, 0x01, b'x']);
}

#[test]
fn test_suback_with_refused_filter_decodes() {
    let (packet, consumed) = decode(&[0x90, 0x04, 0x00, 0x0A, 0x01, 0x80]).unwrap();

    assert_eq!(consumed, 6);
    assert_eq!(
        packet,
        Packet::SubAck(SubAck {
            packet_id: 10,
            return_codes: vec![
                SubscribeReturnCode::Success(QoS::AtLeastOnce),
                SubscribeReturnCode::Failure
            ],
        })
    );
}

#[test]
fn test_qos1_publish_wire_bytes() {
    let mut publish = Publish::new("t", QoS::AtLeastOnce, Bytes::from_static(b"hi"));
    publish.packet_id = Some(5);

    let bytes = encode_to_bytes(&Packet::Publish(publish.clone())).unwrap();

    assert_eq!(
        bytes.as_ref(),
        &[0x32, 0x07, 0x00, 0x01, b't', 0x00, 0x05, b'h', b'i']
    );

    // DUP and RETAIN live in the fixed header flags
    publish.dup = true;
    publish.retain = true;
    let bytes = encode_to_bytes(&Packet::Publish(publish)).unwrap();
    assert_eq!(bytes[0], 0x3B);
}

#[test]
fn test_mqtt31_connect_uses_legacy_protocol_name() {
    let connect = Packet::Connect(Connect {
        protocol: ProtocolVersion::V31,
        client_id: "ab".to_string(),
        clean_session: true,
        keep_alive: 60,
        last_will: None,
        username: None,
        password: None,
    });

    let bytes = encode_to_bytes(&connect).unwrap();

    assert_eq!(
        bytes.as_ref(),
        &[
            0x10, 0x10, 0x00, 0x06, b'M', b'Q', b'I', b's', b'd', b'p', 0x03, 0x02, 0x00, 0x3C,
            0x00, 0x02, b'a', b'b'
        ]
    );
}

#[test]
fn test_decode_limit_applies_to_whole_packet() {
    let publish = Packet::Publish(Publish::new("t", QoS::AtMostOnce, vec![0u8; 100]));
    let bytes = encode_to_bytes(&publish).unwrap();

    assert!(decode_with_limit(&bytes, bytes.len()).is_ok());
    assert!(matches!(
        decode_with_limit(&bytes, bytes.len() - 1),
        Err(CodecError::PacketTooLarge { .. })
    ));
}

fn sample_stream() -> Vec<Packet> {
    let mut qos2 = Publish::new("sensors/room1/temp", QoS::ExactlyOnce, vec![7u8; 300]);
    qos2.packet_id = Some(300);
    vec![
        Packet::ConnAck(mqttsub::protocol::ConnAck {
            session_present: true,
            code: mqttsub::protocol::ConnectReturnCode::Accepted,
        }),
        Packet::Publish(qos2),
        Packet::PubRel(300),
        Packet::SubAck(SubAck {
            packet_id: 1,
            return_codes: vec![SubscribeReturnCode::Success(QoS::AtMostOnce)],
        }),
        Packet::PingResp,
        Packet::UnsubAck(2),
    ]
}

proptest! {
    #[test]
    fn test_stream_decodes_regardless_of_chunking(chunk_sizes in prop::collection::vec(1usize..64, 1..40)) {
        let packets = sample_stream();
        let mut wire = BytesMut::new();
        for packet in &packets {
            encode(packet, &mut wire).unwrap();
        }
        let wire = wire.freeze();

        let mut decoded = Vec::new();
        let mut buffer = BytesMut::new();
        let mut offset = 0;
        let mut sizes = chunk_sizes.iter().cycle();
        while offset < wire.len() {
            let size = (*sizes.next().unwrap()).min(wire.len() - offset);
            buffer.extend_from_slice(&wire[offset..offset + size]);
            offset += size;

            loop {
                match decode(&buffer) {
                    Ok((packet, consumed)) => {
                        buffer.advance(consumed);
                        decoded.push(packet);
                    }
                    Err(CodecError::Incomplete) => break,
                    Err(other) => panic!("unexpected codec error: {other}"),
                }
            }
        }

        prop_assert!(buffer.is_empty());
        prop_assert_eq!(decoded, packets);
    }
}
