//! Sync Protocol Messages
//!
//! Messages travel as an [`Envelope`]: a flat string-keyed map with a `Type`
//! discriminator. [`SyncMessage`] is the typed view of the variants we know
//! about; anything else is ignored so newer peers can add message types.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::timespan;
use crate::events::EventHub;
use crate::transport::InboundFrame;

pub const TYPE_KEY: &str = "Type";

const POSITION_DATA: &str = "PositionData";
const MEDIA_DATA: &str = "MediaData";
const REQUEST_MEDIA: &str = "RequestMedia";

const DRAG_POSITION_KEY: &str = "DragPosition";
const CARD_JSON_KEY: &str = "CardJson";
const MEDIA_PLAYED_POSITION_KEY: &str = "MediaPlayedPosition";
const MEDIA_URL_KEY: &str = "MediaUrl";

/// Wire representation of a message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope(BTreeMap<String, String>);

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Value of the `Type` discriminator, if present
    pub fn message_type(&self) -> Option<&str> {
        self.get(TYPE_KEY)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Decode failures. Both variants mean the frame is malformed and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("{kind} message is missing field {field}")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("{kind} message has malformed {field}: {value:?}")]
    MalformedField {
        kind: &'static str,
        field: &'static str,
        value: String,
    },
}

/// Full playback state handed from one device to another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffPayload {
    /// Serialized card description, passed through untouched
    pub card_json: String,
    /// How far into the media the sender had played
    pub played_position: Duration,
    pub media_url: String,
}

impl HandoffPayload {
    pub fn new(
        card_json: impl Into<String>,
        played_position: Duration,
        media_url: impl Into<String>,
    ) -> Self {
        Self {
            card_json: card_json.into(),
            played_position,
            media_url: media_url.into(),
        }
    }
}

/// Messages exchanged between peers on a session channel
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    /// Continuous scrub progress, nominally 0..=1 but never clamped
    PositionData { drag_position: f32 },

    /// Full handoff of the media being played
    MediaData(HandoffPayload),

    /// Ask the peer to re-send its current media
    RequestMedia,
}

impl SyncMessage {
    /// Name used in the `Type` field
    pub fn type_name(&self) -> &'static str {
        match self {
            SyncMessage::PositionData { .. } => POSITION_DATA,
            SyncMessage::MediaData(_) => MEDIA_DATA,
            SyncMessage::RequestMedia => REQUEST_MEDIA,
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let envelope = Envelope::new().with(TYPE_KEY, self.type_name());
        match self {
            SyncMessage::PositionData { drag_position } => {
                envelope.with(DRAG_POSITION_KEY, drag_position.to_string())
            }
            SyncMessage::MediaData(payload) => envelope
                .with(CARD_JSON_KEY, payload.card_json.as_str())
                .with(MEDIA_PLAYED_POSITION_KEY, timespan::format(payload.played_position))
                .with(MEDIA_URL_KEY, payload.media_url.as_str()),
            SyncMessage::RequestMedia => envelope,
        }
    }

    /// Decode an envelope.
    ///
    /// `Ok(None)` means the type is missing or not one we know, which is not
    /// an error.
    pub fn from_envelope(envelope: &Envelope) -> Result<Option<Self>, ProtocolError> {
        let message = match envelope.message_type() {
            Some(POSITION_DATA) => {
                let raw = require(envelope, POSITION_DATA, DRAG_POSITION_KEY)?;
                let drag_position = raw.trim().parse::<f32>().map_err(|_| ProtocolError::MalformedField {
                    kind: POSITION_DATA,
                    field: DRAG_POSITION_KEY,
                    value: raw.to_string(),
                })?;
                SyncMessage::PositionData { drag_position }
            }
            Some(MEDIA_DATA) => {
                let card_json = require(envelope, MEDIA_DATA, CARD_JSON_KEY)?;
                let raw_position = require(envelope, MEDIA_DATA, MEDIA_PLAYED_POSITION_KEY)?;
                let media_url = require(envelope, MEDIA_DATA, MEDIA_URL_KEY)?;
                let played_position =
                    timespan::parse(raw_position).ok_or_else(|| ProtocolError::MalformedField {
                        kind: MEDIA_DATA,
                        field: MEDIA_PLAYED_POSITION_KEY,
                        value: raw_position.to_string(),
                    })?;
                SyncMessage::MediaData(HandoffPayload::new(card_json, played_position, media_url))
            }
            Some(REQUEST_MEDIA) => SyncMessage::RequestMedia,
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

fn require<'a>(
    envelope: &'a Envelope,
    kind: &'static str,
    field: &'static str,
) -> Result<&'a str, ProtocolError> {
    envelope
        .get(field)
        .ok_or(ProtocolError::MissingField { kind, field })
}

/// Decode one inbound frame and publish it on the hub.
///
/// Malformed frames are logged, reported as a status line and dropped;
/// the error is returned only so callers can count them.
pub fn dispatch_frame(frame: &InboundFrame, hub: &EventHub) -> Result<(), ProtocolError> {
    trace!("Received frame from {}: {:?}", frame.sender, frame.envelope);

    match SyncMessage::from_envelope(&frame.envelope) {
        Ok(Some(SyncMessage::PositionData { drag_position })) => {
            hub.publish_progress(drag_position);
        }
        Ok(Some(SyncMessage::MediaData(payload))) => {
            debug!(
                "Handoff from {}: {} at {:?}",
                frame.sender, payload.media_url, payload.played_position
            );
            hub.publish_handoff(&payload);
        }
        Ok(Some(SyncMessage::RequestMedia)) => {
            debug!("Media requested by {}", frame.sender);
            hub.publish_media_requested();
        }
        Ok(None) => {
            debug!(
                "Ignoring frame from {} with unknown type {:?}",
                frame.sender,
                frame.envelope.message_type()
            );
        }
        Err(e) => {
            warn!("Dropping malformed frame from {}: {}", frame.sender, e);
            hub.publish_status(&format!("Dropped message from {}: {}", frame.sender, e));
            return Err(e);
        }
    }
    Ok(())
}
