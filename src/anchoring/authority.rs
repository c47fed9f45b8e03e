//! Timestamp Authorities
//!
//! A timestamp authority binds a message imprint (SHA-256 of a Merkle root)
//! to a point in time. The local authority never claims to be external.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Name recorded on tokens minted locally
pub const LOCAL_AUTHORITY: &str = "local";

/// Proof-of-time returned by an authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampToken {
    /// TSA URL, or [`LOCAL_AUTHORITY`]
    pub authority: String,
    /// False for locally synthesized tokens
    pub authoritative: bool,
    /// Hex SHA-256 of the Merkle root that was stamped
    pub imprint: String,
    /// Time asserted by the authority
    pub time: DateTime<Utc>,
    /// Opaque token bytes (DER `TimeStampResp` for RFC 3161)
    #[serde(serialize_with = "to_base64", deserialize_with = "from_base64")]
    pub token: Vec<u8>,
}

impl TimestampToken {
    /// ISO-8601 form of the asserted time
    pub fn time_iso(&self) -> String {
        self.time.to_rfc3339()
    }
}

fn to_base64<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

fn from_base64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}

/// SHA-256 of the root's hex text, the value submitted for stamping
pub fn message_imprint(merkle_root: &str) -> [u8; 32] {
    Sha256::digest(merkle_root.as_bytes()).into()
}

/// Something that can timestamp a message imprint
#[async_trait]
pub trait TimestampAuthority: Send + Sync {
    /// Identifier recorded on issued tokens
    fn name(&self) -> &str;

    /// Obtain a token over `imprint`
    async fn timestamp(&self, imprint: &[u8; 32]) -> Result<TimestampToken>;
}

/// Deterministic, non-authoritative authority using the local clock
#[derive(Debug, Clone, Default)]
pub struct LocalTimestampAuthority {
    fixed_time: Option<DateTime<Utc>>,
}

impl LocalTimestampAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always stamp with `time`
    pub fn with_fixed_time(time: DateTime<Utc>) -> Self {
        Self {
            fixed_time: Some(time),
        }
    }

    /// Mint a token without going through the trait
    pub fn issue(&self, imprint: &[u8; 32]) -> TimestampToken {
        let time = self.fixed_time.unwrap_or_else(Utc::now);
        let imprint = hex::encode(imprint);
        let token = json!({
            "authority": LOCAL_AUTHORITY,
            "imprint": imprint,
            "time": time.to_rfc3339(),
        })
        .to_string()
        .into_bytes();

        TimestampToken {
            authority: LOCAL_AUTHORITY.to_string(),
            authoritative: false,
            imprint,
            time,
            token,
        }
    }
}

#[async_trait]
impl TimestampAuthority for LocalTimestampAuthority {
    fn name(&self) -> &str {
        LOCAL_AUTHORITY
    }

    async fn timestamp(&self, imprint: &[u8; 32]) -> Result<TimestampToken> {
        Ok(self.issue(imprint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_local_token_is_marked_non_authoritative() {
        let time = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();
        let authority = LocalTimestampAuthority::with_fixed_time(time);
        let imprint = message_imprint("abc");

        let token = authority.timestamp(&imprint).await.unwrap();
        assert!(!token.authoritative);
        assert_eq!(token.authority, LOCAL_AUTHORITY);
        assert_eq!(token.imprint, hex::encode(imprint));
        assert_eq!(token.time, time);
        assert_eq!(token.time_iso(), "2025-01-15T12:00:00+00:00");

        let again = authority.timestamp(&imprint).await.unwrap();
        assert_eq!(again, token);
    }

    #[test]
    fn test_token_bytes_serialize_as_base64() {
        let token = LocalTimestampAuthority::new().issue(&message_imprint("root"));
        let json = serde_json::to_value(&token).unwrap();
        assert!(json["token"].is_string());

        let back: TimestampToken = serde_json::from_value(json).unwrap();
        assert_eq!(back, token);
    }
}
