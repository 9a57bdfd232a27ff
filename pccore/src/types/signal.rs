//! Records exchanged through the signaling relay.
//!
//! Timestamps are always assigned by the relay. Writers send the store's
//! server-timestamp sentinel in the `timestamp` field and readers see the
//! stamped value, so ordering never depends on a local clock.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// SDP offer written by the initiator at `sessions/{id}/offer`.
///
/// `revision` starts at 0 and is bumped by every ICE restart, which rewrites
/// the offer at the same path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub revision: u32,
    #[serde(default)]
    pub ice_restart: bool,
}

impl Offer {
    pub fn new(sdp: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Offer,
            from: from.into(),
            to: to.into(),
            timestamp: 0,
            revision: 0,
            ice_restart: false,
        }
    }

    pub fn restart(mut self, revision: u32) -> Self {
        self.revision = revision;
        self.ice_restart = true;
        self
    }
}

/// SDP answer written by the responder at `sessions/{id}/answer`.
///
/// `revision` mirrors the offer revision it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub from: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub revision: u32,
}

impl Answer {
    pub fn new(sdp: impl Into<String>, from: impl Into<String>, revision: u32) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Answer,
            from: from.into(),
            timestamp: 0,
            revision,
        }
    }
}

/// A network path proposal, appended under `sessions/{id}/ice/{pushKey}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub media_id: Option<String>,
    #[serde(default)]
    pub media_line_index: Option<u16>,
    pub from: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            media_id: None,
            media_line_index: None,
            from: from.into(),
            timestamp: 0,
        }
    }

    pub fn with_media_id(mut self, media_id: impl Into<String>) -> Self {
        self.media_id = Some(media_id.into());
        self
    }

    pub fn with_media_line_index(mut self, index: u16) -> Self {
        self.media_line_index = Some(index);
        self
    }

    /// True when this candidate was produced by `local_id` itself.
    pub fn is_from(&self, local_id: &str) -> bool {
        self.from == local_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_offer_wire_format() {
        let offer = Offer::new("v=0", "alice", "bob");
        let value = serde_json::to_value(&offer).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["from"], "alice");
        assert_eq!(value["to"], "bob");
        assert_eq!(value["iceRestart"], false);
    }

    #[test]
    fn test_candidate_parses_relay_payload() {
        let value = json!({
            "candidate": "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host",
            "mediaId": "0",
            "mediaLineIndex": 0,
            "from": "bob",
            "timestamp": 1700000000000i64
        });
        let cand: IceCandidate = serde_json::from_value(value).unwrap();
        assert_eq!(cand.media_id.as_deref(), Some("0"));
        assert_eq!(cand.media_line_index, Some(0));
        assert!(cand.is_from("bob"));
        assert!(!cand.is_from("alice"));
    }

    #[test]
    fn test_answer_defaults_missing_revision() {
        let value = json!({"sdp": "v=0", "type": "answer", "from": "bob"});
        let answer: Answer = serde_json::from_value(value).unwrap();
        assert_eq!(answer.revision, 0);
        assert_eq!(answer.timestamp, 0);
    }

    #[test]
    fn test_restart_offer_bumps_revision() {
        let offer = Offer::new("v=0", "alice", "bob").restart(2);
        assert!(offer.ice_restart);
        assert_eq!(offer.revision, 2);
    }
}
