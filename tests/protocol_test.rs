//! Wire-format robustness.

mod common;

use common::*;
use kcp_conversation::protocol::{header_length, Command};
use kcp_conversation::PacketHeader;
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use std::time::Duration;

proptest! {
    #[test]
    fn decode_never_overruns(data in proptest::collection::vec(any::<u8>(), 0..256), with_id: bool) {
        if let Some((segment, consumed)) = PacketHeader::decode(&data, with_id) {
            prop_assert!(consumed <= data.len());
            prop_assert_eq!(consumed, header_length(with_id) + segment.payload.len());
            prop_assert_eq!(segment.conversation_id.is_some(), with_id);
        } else {
            prop_assert!(
                data.len() < header_length(with_id)
                    || Command::from_u8(data[if with_id { 8 } else { 0 }]).is_none()
                    || {
                        let at = header_length(with_id) - 4;
                        let len = u32::from_le_bytes(data[at..at + 4].try_into().unwrap());
                        len as usize > data.len() - header_length(with_id)
                    },
                "decode rejected a well-formed packet"
            );
        }
    }

    #[test]
    fn truncated_payload_is_rejected(
        payload in proptest::collection::vec(any::<u8>(), 1..128),
        cut in 1usize..128,
    ) {
        let mut packet = Vec::new();
        PacketHeader::new(Command::Push, 0, 32, 1, 2, 3).encode(Some(5), payload.len(), &mut packet);
        packet.extend_from_slice(&payload);

        let cut = cut.min(payload.len());
        prop_assert!(PacketHeader::decode(&packet[..packet.len() - cut], true).is_none());
    }

    #[test]
    fn header_fields_survive_encode_decode(
        command in prop_oneof![
            Just(Command::Push),
            Just(Command::Ack),
            Just(Command::WindowProbe),
            Just(Command::WindowSize),
        ],
        fragment: u8,
        window_size: u16,
        timestamp: u32,
        serial_number: u32,
        unacknowledged: u32,
        conversation_id in proptest::option::of(any::<u64>()),
        payload in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let header = PacketHeader::new(
            command,
            fragment,
            window_size,
            timestamp,
            serial_number,
            unacknowledged,
        );
        let mut packet = Vec::new();
        let written = header.encode(conversation_id, payload.len(), &mut packet);
        packet.extend_from_slice(&payload);
        prop_assert_eq!(written, header_length(conversation_id.is_some()));

        let (segment, consumed) = PacketHeader::decode(&packet, conversation_id.is_some())
            .expect("well-formed packet must decode");
        prop_assert_eq!(segment.header, header);
        prop_assert_eq!(segment.conversation_id, conversation_id);
        prop_assert_eq!(segment.payload, &payload[..]);
        prop_assert_eq!(consumed, header_length(conversation_id.is_some()) + payload.len());
        prop_assert_eq!(consumed, packet.len());
    }
}

#[tokio::test(start_paused = true)]
async fn test_garbage_input_does_not_disturb_conversation() {
    let (a, b, _) = connected_pair(fast_config());
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);

    for _ in 0..500 {
        let len = rng.gen_range(0..200);
        let garbage: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        b.input_packet(&garbage);
    }

    assert!(a.send_async(b"still here", None).await.unwrap());
    let mut buf = [0u8; 32];
    let result = tokio::time::timeout(Duration::from_secs(60), b.receive_async(&mut buf, None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..result.bytes_received], b"still here");
}

#[tokio::test(start_paused = true)]
async fn test_ack_with_extreme_timestamp_is_absorbed() {
    let (a, b, _) = connected_pair(fast_config());

    // A framed Ack whose echoed timestamp sits half the clock range ahead.
    for ts in [i32::MAX as u32, u32::MAX, 1u32 << 31] {
        let mut packet = Vec::new();
        PacketHeader::new(Command::Ack, 0, 128, ts, 0, 0).encode(Some(0x4B43_5000), 0, &mut packet);
        assert!(a.input_packet(&packet));
    }

    assert!(a.send_async(b"after hostile ack", None).await.unwrap());
    let mut buf = [0u8; 32];
    let result = tokio::time::timeout(Duration::from_secs(60), b.receive_async(&mut buf, None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..result.bytes_received], b"after hostile ack");
    assert!(a.close_reason().is_none());
}
