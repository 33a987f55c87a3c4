//! Property-based tests for the push-channel frame codec.
//!
//! Uses proptest to verify:
//! 1. Any server frame survives encode → decode.
//! 2. Arbitrary text never panics the decoder (it returns `Err` or `Ok(None)`).
//! 3. Any frame with an unrecognized action is ignored, whatever its payload.
//! 4. User ids decode identically from their integer and string forms.

use chrono::{DateTime, TimeZone, Utc};
use mentorchat_proto::frame::{self, InboundFrame};
use mentorchat_proto::message::{Message, MessageId, UserId};
use proptest::prelude::*;

fn arb_user_id() -> impl Strategy<Value = UserId> {
    prop_oneof![
        any::<u32>().prop_map(|n| UserId::new(n.to_string())),
        "[a-z]{1,12}".prop_map(UserId::new),
    ]
}

fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..4_000_000_000_000).prop_map(|ms| {
        Utc.timestamp_millis_opt(ms)
            .single()
            .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
    })
}

fn arb_message() -> impl Strategy<Value = Message> {
    (
        any::<u64>(),
        arb_user_id(),
        arb_user_id(),
        ".{0,256}",
        arb_timestamp(),
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(
            |(id, sender_id, receiver_id, text, sent_at, is_read, delivered)| Message {
                id: MessageId::new(id),
                sender_id,
                receiver_id,
                text,
                sent_at,
                is_read,
                delivered,
            },
        )
}

fn arb_inbound_frame() -> impl Strategy<Value = InboundFrame> {
    prop_oneof![
        arb_message().prop_map(|message| InboundFrame::Message { message }),
        arb_user_id().prop_map(|user_id| InboundFrame::Online { user_id }),
        (any::<u64>(), proptest::option::of(arb_user_id())).prop_map(|(id, delivered_by)| {
            InboundFrame::MessageDelivered {
                message_id: MessageId::new(id),
                delivered_by,
            }
        }),
        (arb_user_id(), any::<u64>()).prop_map(|(reader_id, id)| InboundFrame::MessagesRead {
            reader_id,
            last_read_message_id: MessageId::new(id),
        }),
    ]
}

proptest! {
    /// Any server frame survives an encode → decode cycle.
    #[test]
    fn inbound_frame_survives_codec(frame in arb_inbound_frame()) {
        let text = frame::encode_inbound(&frame).expect("encode should succeed");
        let decoded = frame::decode_inbound(&text).expect("decode should succeed");
        prop_assert_eq!(Some(frame), decoded);
    }

    /// Arbitrary text never causes a panic when decoded.
    #[test]
    fn random_text_decode_no_panic(text in ".{0,512}") {
        let _ = frame::decode_inbound(&text);
    }

    /// Frames with an unknown action are ignored rather than rejected.
    #[test]
    fn unknown_action_always_ignored(action in "[a-z_]{1,24}", n in any::<u32>()) {
        prop_assume!(!InboundFrame::ACTIONS.contains(&action.as_str()));
        let text = serde_json::json!({ "action": action, "value": n }).to_string();
        let decoded = frame::decode_inbound(&text).expect("unknown action should not error");
        prop_assert!(decoded.is_none());
    }

    /// Integer and string encodings of the same user id are equal.
    #[test]
    fn user_id_integer_and_string_agree(n in any::<u32>()) {
        let from_int: UserId = serde_json::from_str(&n.to_string()).expect("integer id");
        let from_str: UserId = serde_json::from_str(&format!("\"{n}\"")).expect("string id");
        prop_assert_eq!(from_int, from_str);
    }
}
