//! RFC 3161 Time-Stamp Protocol Client
//!
//! Builds a DER `TimeStampReq` over a SHA-256 message imprint, posts it to
//! a TSA over HTTP, and extracts `genTime` from the signed `TSTInfo` in the
//! reply. Signature validation of the token is left to offline tooling; the
//! raw `TimeStampResp` is kept for that.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

use super::authority::{TimestampAuthority, TimestampToken};
use crate::error::{LedgerError, Result};

pub const TIMESTAMP_QUERY_CONTENT_TYPE: &str = "application/timestamp-query";

/// 2.16.840.1.101.3.4.2.1
const SHA256_OID: [u8; 9] = [0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];

const TAG_BOOLEAN: u8 = 0x01;
const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_GENERALIZED_TIME: u8 = 0x18;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_CONTEXT_0: u8 = 0xA0;

/// PKIStatus values that carry a token
const STATUS_GRANTED: i64 = 0;
const STATUS_GRANTED_WITH_MODS: i64 = 1;

/// Encode one DER TLV with a definite length
pub fn encode_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag);

    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }

    out.extend_from_slice(content);
    out
}

/// Random positive 64-bit nonce in minimal DER integer form
pub fn generate_nonce() -> [u8; 8] {
    let mut nonce: [u8; 8] = rand::random();
    nonce[0] = (nonce[0] & 0x7f) | 0x01;
    nonce
}

/// DER `TimeStampReq` (version 1, SHA-256, `certReq` true)
pub fn build_request(imprint: &[u8; 32], nonce: &[u8]) -> Vec<u8> {
    let algorithm = [encode_tlv(TAG_OID, &SHA256_OID), encode_tlv(TAG_NULL, &[])].concat();
    let message_imprint = [
        encode_tlv(TAG_SEQUENCE, &algorithm),
        encode_tlv(TAG_OCTET_STRING, imprint),
    ]
    .concat();

    let body = [
        encode_tlv(TAG_INTEGER, &[1]),
        encode_tlv(TAG_SEQUENCE, &message_imprint),
        encode_tlv(TAG_INTEGER, nonce),
        encode_tlv(TAG_BOOLEAN, &[0xff]),
    ]
    .concat();

    encode_tlv(TAG_SEQUENCE, &body)
}

/// Cursor over consecutive DER TLVs
struct DerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DerReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn peek_tag(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn next_byte(&mut self) -> Result<u8> {
        let byte = self
            .data
            .get(self.pos)
            .copied()
            .ok_or_else(|| malformed("unexpected end of data"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_any(&mut self) -> Result<(u8, &'a [u8])> {
        let tag = self.next_byte()?;
        let first = self.next_byte()?;

        let len = if first & 0x80 == 0 {
            first as usize
        } else {
            let count = (first & 0x7f) as usize;
            if count == 0 || count > 4 {
                return Err(malformed("unsupported length encoding"));
            }
            let mut len = 0usize;
            for _ in 0..count {
                len = (len << 8) | self.next_byte()? as usize;
            }
            len
        };

        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| malformed("length exceeds available data"))?;
        let content = &self.data[self.pos..end];
        self.pos = end;
        Ok((tag, content))
    }

    fn read(&mut self, expected: u8) -> Result<&'a [u8]> {
        let (tag, content) = self.read_any()?;
        if tag != expected {
            return Err(malformed(&format!(
                "expected tag 0x{:02x}, found 0x{:02x}",
                expected, tag
            )));
        }
        Ok(content)
    }
}

fn malformed(detail: &str) -> LedgerError {
    LedgerError::AnchoringUnavailable(format!("Malformed timestamp message: {}", detail))
}

fn integer_value(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(malformed("integer out of range"));
    }
    let negative = bytes[0] & 0x80 != 0;
    let mut value: i64 = if negative { -1 } else { 0 };
    for &b in bytes {
        value = (value << 8) | b as i64;
    }
    Ok(value)
}

fn parse_generalized_time(bytes: &[u8]) -> Result<DateTime<Utc>> {
    let text = std::str::from_utf8(bytes).map_err(|_| malformed("genTime is not ASCII"))?;
    let trimmed = text
        .strip_suffix('Z')
        .ok_or_else(|| malformed("genTime is not UTC"))?;
    let naive = NaiveDateTime::parse_from_str(trimmed, "%Y%m%d%H%M%S%.f")
        .map_err(|e| malformed(&format!("bad genTime {}: {}", text, e)))?;
    Ok(naive.and_utc())
}

/// Fields of a `TimeStampReq`
#[derive(Debug, Clone, PartialEq)]
pub struct TimeStampRequest {
    pub imprint: Vec<u8>,
    pub nonce: Option<Vec<u8>>,
}

/// Read the imprint and nonce back out of a DER `TimeStampReq`
pub fn parse_request(bytes: &[u8]) -> Result<TimeStampRequest> {
    let mut outer = DerReader::new(bytes);
    let mut req = DerReader::new(outer.read(TAG_SEQUENCE)?);
    req.read(TAG_INTEGER)?;

    let mut message_imprint = DerReader::new(req.read(TAG_SEQUENCE)?);
    message_imprint.read(TAG_SEQUENCE)?;
    let imprint = message_imprint.read(TAG_OCTET_STRING)?.to_vec();

    // reqPolicy may precede the nonce
    let mut nonce = None;
    while !req.is_empty() {
        let (tag, content) = req.read_any()?;
        if tag == TAG_INTEGER {
            nonce = Some(content.to_vec());
            break;
        }
    }

    Ok(TimeStampRequest { imprint, nonce })
}

/// Fields pulled from a granted `TimeStampResp`
#[derive(Debug, Clone, PartialEq)]
pub struct TstInfo {
    pub status: i64,
    pub gen_time: DateTime<Utc>,
    pub imprint: Vec<u8>,
    pub serial_number: String,
    pub nonce: Option<Vec<u8>>,
}

/// Walk `TimeStampResp` down to `TSTInfo`
pub fn parse_response(bytes: &[u8]) -> Result<TstInfo> {
    let mut outer = DerReader::new(bytes);
    let mut resp = DerReader::new(outer.read(TAG_SEQUENCE)?);

    let mut status_info = DerReader::new(resp.read(TAG_SEQUENCE)?);
    let status = integer_value(status_info.read(TAG_INTEGER)?)?;
    if status != STATUS_GRANTED && status != STATUS_GRANTED_WITH_MODS {
        return Err(LedgerError::AnchoringUnavailable(format!(
            "Timestamp request rejected with status {}",
            status
        )));
    }

    // ContentInfo { contentType, [0] SignedData }
    let mut content_info = DerReader::new(resp.read(TAG_SEQUENCE)?);
    content_info.read(TAG_OID)?;
    let mut explicit = DerReader::new(content_info.read(TAG_CONTEXT_0)?);
    let mut signed_data = DerReader::new(explicit.read(TAG_SEQUENCE)?);

    signed_data.read(TAG_INTEGER)?;
    signed_data.read_any()?; // digestAlgorithms
    let mut encap = DerReader::new(signed_data.read(TAG_SEQUENCE)?);
    encap.read(TAG_OID)?;
    let mut econtent = DerReader::new(encap.read(TAG_CONTEXT_0)?);
    let tst_der = econtent.read(TAG_OCTET_STRING)?;

    let mut tst_outer = DerReader::new(tst_der);
    let mut tst = DerReader::new(tst_outer.read(TAG_SEQUENCE)?);
    tst.read(TAG_INTEGER)?;
    tst.read(TAG_OID)?;

    let mut message_imprint = DerReader::new(tst.read(TAG_SEQUENCE)?);
    message_imprint.read(TAG_SEQUENCE)?;
    let imprint = message_imprint.read(TAG_OCTET_STRING)?.to_vec();

    let serial_number = hex::encode(tst.read(TAG_INTEGER)?);
    let gen_time = parse_generalized_time(tst.read(TAG_GENERALIZED_TIME)?)?;

    // accuracy and ordering may precede the nonce
    let mut nonce = None;
    while !tst.is_empty() {
        if tst.peek_tag() == Some(TAG_INTEGER) {
            nonce = Some(tst.read(TAG_INTEGER)?.to_vec());
            break;
        }
        tst.read_any()?;
    }

    Ok(TstInfo {
        status,
        gen_time,
        imprint,
        serial_number,
        nonce,
    })
}

/// HTTP client for one RFC 3161 TSA
pub struct Rfc3161Client {
    url: String,
    http_client: Client,
}

impl Rfc3161Client {
    /// Client whose requests give up after `timeout`
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            url: url.into(),
            http_client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, request: Vec<u8>) -> Result<Vec<u8>> {
        let response = self
            .http_client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, TIMESTAMP_QUERY_CONTENT_TYPE)
            .body(request)
            .send()
            .await
            .map_err(|e| {
                LedgerError::AnchoringUnavailable(format!("Request to {} failed: {}", self.url, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(LedgerError::AnchoringUnavailable(format!(
                "TSA {} returned HTTP {}",
                self.url, status
            )));
        }

        let body = response.bytes().await.map_err(|e| {
            LedgerError::AnchoringUnavailable(format!("Failed to read TSA response: {}", e))
        })?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl TimestampAuthority for Rfc3161Client {
    fn name(&self) -> &str {
        &self.url
    }

    async fn timestamp(&self, imprint: &[u8; 32]) -> Result<TimestampToken> {
        let nonce = generate_nonce();
        let request = build_request(imprint, &nonce);
        debug!("Submitting {}-byte timestamp request to {}", request.len(), self.url);

        let reply = self.post(request).await?;
        let info = parse_response(&reply)?;

        if info.imprint != imprint {
            return Err(LedgerError::AnchoringUnavailable(
                "TSA stamped a different message imprint".to_string(),
            ));
        }
        match &info.nonce {
            Some(returned) if returned.as_slice() == nonce.as_slice() => {}
            Some(_) => {
                return Err(LedgerError::AnchoringUnavailable(
                    "TSA returned a mismatched nonce".to_string(),
                ))
            }
            None => {
                return Err(LedgerError::AnchoringUnavailable(
                    "TSA reply omits the request nonce".to_string(),
                ))
            }
        }

        info!(
            "Received timestamp from {} at {} (serial {})",
            self.url, info.gen_time, info.serial_number
        );

        Ok(TimestampToken {
            authority: self.url.clone(),
            authoritative: true,
            imprint: hex::encode(imprint),
            time: info.gen_time,
            token: reply,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::anchoring::authority::message_imprint;
    use chrono::TimeZone;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_tlv_length_forms() {
        assert_eq!(encode_tlv(0x04, &[0xaa; 3]), vec![0x04u8, 0x03, 0xaa, 0xaa, 0xaa]);

        let long = encode_tlv(0x04, &[0u8; 200]);
        assert_eq!(&long[..3], &[0x04u8, 0x81, 200]);
        assert_eq!(long.len(), 203);

        let longer = encode_tlv(0x04, &[0u8; 300]);
        assert_eq!(&longer[..4], &[0x04u8, 0x82, 0x01, 0x2c]);
    }

    #[test]
    fn test_request_layout() {
        let imprint = message_imprint("root");
        let nonce = [0x11, 2, 3, 4, 5, 6, 7, 8];
        let request = build_request(&imprint, &nonce);

        let mut outer = DerReader::new(&request);
        let mut req = DerReader::new(outer.read(TAG_SEQUENCE).unwrap());
        assert_eq!(req.read(TAG_INTEGER).unwrap(), &[1u8]);

        let mut mi = DerReader::new(req.read(TAG_SEQUENCE).unwrap());
        let mut alg = DerReader::new(mi.read(TAG_SEQUENCE).unwrap());
        assert_eq!(alg.read(TAG_OID).unwrap(), &SHA256_OID);
        assert_eq!(mi.read(TAG_OCTET_STRING).unwrap(), &imprint);

        assert_eq!(req.read(TAG_INTEGER).unwrap(), &nonce);
        assert_eq!(req.read(TAG_BOOLEAN).unwrap(), &[0xffu8]);
        assert!(req.is_empty());

        let parsed = parse_request(&request).unwrap();
        assert_eq!(parsed.imprint, imprint.to_vec());
        assert_eq!(parsed.nonce, Some(nonce.to_vec()));
    }

    #[test]
    fn test_nonce_is_positive_and_minimal() {
        for _ in 0..32 {
            let nonce = generate_nonce();
            assert!(nonce[0] & 0x80 == 0);
            assert!(nonce[0] != 0);
        }
    }

    #[test]
    fn test_parse_granted_response() {
        let imprint = message_imprint("root");
        let reply = granted_response(&imprint, "20250115120000.5Z", Some(&[9, 9]));

        let info = parse_response(&reply).unwrap();
        assert_eq!(info.status, 0);
        assert_eq!(info.imprint, imprint.to_vec());
        assert_eq!(info.serial_number, "42");
        assert_eq!(info.nonce, Some(vec![9, 9]));
        assert_eq!(
            info.gen_time,
            Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap() + chrono::Duration::milliseconds(500)
        );
    }

    #[test]
    fn test_parse_rejects_bad_status_and_truncation() {
        let imprint = message_imprint("root");
        let rejected = response_with_status(2, &imprint, "20250115120000Z", None);
        assert!(parse_response(&rejected).is_err());

        let reply = granted_response(&imprint, "20250115120000Z", None);
        assert!(parse_response(&reply[..reply.len() - 5]).is_err());
        assert!(parse_response(&[]).is_err());
    }

    #[tokio::test]
    async fn test_timestamp_against_mock_tsa() {
        let server = MockServer::start().await;
        let imprint = message_imprint("abc123");

        Mock::given(method("POST"))
            .and(path("/tsr"))
            .and(header("content-type", TIMESTAMP_QUERY_CONTENT_TYPE))
            .respond_with(EchoingTsa {
                gen_time: "20250301000000Z",
                imprint: None,
            })
            .expect(1)
            .mount(&server)
            .await;

        let client =
            Rfc3161Client::new(format!("{}/tsr", server.uri()), Duration::from_secs(5)).unwrap();
        let token = client.timestamp(&imprint).await.unwrap();

        assert!(token.authoritative);
        assert_eq!(token.authority, client.url());
        assert_eq!(token.time, Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(token.imprint, hex::encode(imprint));
        assert!(!token.token.is_empty());
    }

    #[tokio::test]
    async fn test_mismatched_imprint_is_rejected() {
        let server = MockServer::start().await;
        let other = message_imprint("something else");

        Mock::given(method("POST"))
            .respond_with(EchoingTsa {
                gen_time: "20250301000000Z",
                imprint: Some(other.to_vec()),
            })
            .mount(&server)
            .await;

        let client = Rfc3161Client::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = client.timestamp(&message_imprint("abc123")).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("different message imprint"));
    }

    #[tokio::test]
    async fn test_reply_must_echo_nonce() {
        let server = MockServer::start().await;
        let imprint = message_imprint("abc123");

        Mock::given(method("POST"))
            .and(path("/missing"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(granted_response(&imprint, "20250301000000Z", None)),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/stale"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(granted_response(
                &imprint,
                "20250301000000Z",
                Some(&[0x01, 0x02]),
            )))
            .mount(&server)
            .await;

        let missing =
            Rfc3161Client::new(format!("{}/missing", server.uri()), Duration::from_secs(5)).unwrap();
        let err = missing.timestamp(&imprint).await.unwrap_err();
        assert!(err.to_string().contains("omits the request nonce"));

        let stale =
            Rfc3161Client::new(format!("{}/stale", server.uri()), Duration::from_secs(5)).unwrap();
        let err = stale.timestamp(&imprint).await.unwrap_err();
        assert!(err.to_string().contains("mismatched nonce"));
    }

    #[tokio::test]
    async fn test_http_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = Rfc3161Client::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = client.timestamp(&message_imprint("x")).await.unwrap_err();
        assert!(matches!(err, LedgerError::AnchoringUnavailable(_)));
    }
}
