//! Property tests for the frame codec: composed bytes parse back to an
//! equivalent message, and declared sizes match actual output length.

use bytes::{Bytes, BytesMut};
use mds_proto::codec::{self, Codec, ReadOutcome};
use mds_proto::header::HeaderList;
use mds_proto::message::Message;
use proptest::prelude::*;

fn header_name() -> impl Strategy<Value = String> {
    "[A-Za-z][A-Za-z -]{0,15}".prop_filter("no trailing space", |s| !s.ends_with(' '))
}

fn header_value() -> impl Strategy<Value = String> {
    "[ -~]{0,32}"
}

fn arb_message() -> impl Strategy<Value = Message> {
    (
        prop::collection::vec((header_name(), header_value()), 1..6),
        prop::collection::vec(any::<u8>(), 0..64),
    )
        .prop_map(|(pairs, payload)| {
            let mut headers = HeaderList::new();
            for (name, value) in pairs {
                let _ = headers.push(name, value);
            }
            headers.remove("Length");
            headers.push("Length", payload.len().to_string()).unwrap();
            Message::with_payload(headers, Bytes::from(payload))
        })
}

proptest! {
    #[test]
    fn compose_size_matches_compose_output_length(message in arb_message()) {
        let mut buffer = BytesMut::new();
        codec::compose(&message, &mut buffer);
        prop_assert_eq!(buffer.len(), codec::compose_size(&message));
    }

    #[test]
    fn parse_of_compose_reproduces_message(message in arb_message()) {
        let mut buffer = BytesMut::new();
        codec::compose(&message, &mut buffer);

        let mut parser = Codec::new();
        parser.feed(&buffer);
        match parser.poll() {
            ReadOutcome::Complete(parsed) => prop_assert_eq!(parsed, message),
            other => prop_assert!(false, "expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn marshal_round_trips_through_unmarshal(message in arb_message()) {
        let mut buffer = BytesMut::new();
        codec::marshal_message(&message, &mut buffer);
        prop_assert_eq!(buffer.len(), codec::message_marshal_size(&message));
        let restored = codec::unmarshal_message(buffer.freeze()).unwrap();
        prop_assert_eq!(restored, message);
    }

    #[test]
    fn byte_at_a_time_feed_eventually_completes(message in arb_message()) {
        let mut buffer = BytesMut::new();
        codec::compose(&message, &mut buffer);
        let bytes = buffer.freeze();

        let mut parser = Codec::new();
        let mut outcome = None;
        for byte in bytes.iter() {
            parser.feed(std::slice::from_ref(byte));
            match parser.poll() {
                ReadOutcome::NeedMore => continue,
                other => {
                    outcome = Some(other);
                    break;
                },
            }
        }
        match outcome {
            Some(ReadOutcome::Complete(parsed)) => prop_assert_eq!(parsed, message),
            other => prop_assert!(false, "expected eventual Complete, got {:?}", other),
        }
    }
}
