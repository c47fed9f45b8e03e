#![allow(dead_code)]

use audit_ledger::anchoring::rfc3161::{encode_tlv, parse_request};
use audit_ledger::events::{create_event, payload, AuditEvent, EventKind};
use audit_ledger::Ledger;
use serde_json::json;
use wiremock::{Request, Respond, ResponseTemplate};

/// 2025-01-15T00:00:00Z
pub const JAN_15: f64 = 1_736_899_200.0;
pub const DAY: f64 = 86_400.0;

/// `item_viewed` event carrying `{"a": a}` alongside the required item id
pub fn item_viewed(session: &str, a: i64, timestamp: f64) -> AuditEvent {
    create_event(
        EventKind::ItemViewed,
        session,
        "C1",
        "candidate",
        payload([("item_id", json!("item-1")), ("a", json!(a))]),
        None,
        Some(timestamp),
    )
}

pub fn answer_submitted(session: &str, item: &str, timestamp: f64) -> AuditEvent {
    create_event(
        EventKind::AnswerSubmitted,
        session,
        "C1",
        "candidate",
        payload([("item_id", json!(item)), ("response", json!("B"))]),
        None,
        Some(timestamp),
    )
}

/// Ledger holding one session's three `a` events
pub async fn three_event_ledger() -> Ledger {
    let ledger = Ledger::new();
    for a in 1..=3 {
        ledger
            .append(item_viewed("S1", a, JAN_15 + a as f64))
            .await
            .expect("append");
    }
    ledger
}

/// Fake TSA granting every request at `gen_time`, echoing imprint and nonce
pub struct GrantingTsa(pub &'static str);

impl Respond for GrantingTsa {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        match parse_request(&request.body) {
            Ok(req) => ResponseTemplate::new(200)
                .insert_header("content-type", "application/timestamp-reply")
                .set_body_bytes(granted_tsa_response(
                    &req.imprint,
                    self.0,
                    req.nonce.as_deref().unwrap_or_default(),
                )),
            Err(_) => ResponseTemplate::new(400),
        }
    }
}

/// Granted RFC 3161 reply stamping `imprint` at `gen_time` (GeneralizedTime)
pub fn granted_tsa_response(imprint: &[u8], gen_time: &str, nonce: &[u8]) -> Vec<u8> {
    let sha256 = [0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];
    let algorithm = [encode_tlv(0x06, &sha256), encode_tlv(0x05, &[])].concat();
    let message_imprint = [encode_tlv(0x30, &algorithm), encode_tlv(0x04, imprint)].concat();

    let tst_info = encode_tlv(
        0x30,
        &[
            encode_tlv(0x02, &[1]),
            encode_tlv(0x06, &[0x2a, 0x03]),
            encode_tlv(0x30, &message_imprint),
            encode_tlv(0x02, &[0x07, 0xd0]),
            encode_tlv(0x18, gen_time.as_bytes()),
            encode_tlv(0x02, nonce),
        ]
        .concat(),
    );

    let encap = [
        encode_tlv(0x06, &[0x2a, 0x86, 0x48]),
        encode_tlv(0xa0, &encode_tlv(0x04, &tst_info)),
    ]
    .concat();
    let signed_data = [
        encode_tlv(0x02, &[3]),
        encode_tlv(0x31, &[]),
        encode_tlv(0x30, &encap),
    ]
    .concat();
    let content_info = [
        encode_tlv(0x06, &[0x2a, 0x86, 0x48, 0x86, 0xf7]),
        encode_tlv(0xa0, &encode_tlv(0x30, &signed_data)),
    ]
    .concat();

    encode_tlv(
        0x30,
        &[
            encode_tlv(0x30, &encode_tlv(0x02, &[0])),
            encode_tlv(0x30, &content_info),
        ]
        .concat(),
    )
}
