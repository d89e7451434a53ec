//! Encoding and decoding of the ASCII delimited wire frame:
//! `TOPIC \x1F ACTION \x1F PART0 \x1F … \x1E`.

use crate::error::{Error, Result};
use crate::types::{Action, Frame, Topic, MSG_TERM, PART_SEP};
use std::str::FromStr;
use std::sync::Arc;

/// Encode `topic`/`action`/`parts` into the raw wire form, without the
/// trailing terminator — callers appending multiple frames to a shared
/// buffer add `MSG_TERM` themselves.
pub fn encode(topic: Topic, action: Action, parts: &[String]) -> String {
    let mut out = String::with_capacity(16 + parts.iter().map(|p| p.len() + 1).sum::<usize>());
    out.push_str(topic.as_str());
    out.push(PART_SEP);
    out.push_str(action.as_str());
    for p in parts {
        out.push(PART_SEP);
        out.push_str(p);
    }
    out.push(MSG_TERM);
    out
}

/// Split a buffer of one or more concatenated frames (as produced by
/// [`encode`]) into decoded [`Frame`] values, preserving each frame's raw
/// bytes for replay.
pub fn decode_all(buf: &str) -> Result<Vec<Frame>> {
    buf.split(MSG_TERM)
        .filter(|s| !s.is_empty())
        .map(|raw| decode_one(raw))
        .collect()
}

fn decode_one(raw: &str) -> Result<Frame> {
    let mut parts = raw.split(PART_SEP);
    let topic = parts
        .next()
        .ok_or_else(|| Error::InvalidFrame(raw.to_string()))?;
    let action = parts
        .next()
        .ok_or_else(|| Error::InvalidFrame(raw.to_string()))?;
    let data: Vec<String> = parts.map(|s| s.to_string()).collect();

    let mut with_term = String::with_capacity(raw.len() + 1);
    with_term.push_str(raw);
    with_term.push(MSG_TERM);

    Ok(Frame {
        topic: Topic::from_str(topic)?,
        action: Action::from_str(action)?,
        data,
        raw: Arc::from(with_term),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let raw = encode(
            Topic::Record,
            Action::Update,
            &["foo".into(), "1-aaa".into(), "{\"x\":1}".into()],
        );
        let frames = decode_all(&raw).unwrap();
        assert_eq!(frames.len(), 1);
        let f = &frames[0];
        assert_eq!(f.topic, Topic::Record);
        assert_eq!(f.action, Action::Update);
        assert_eq!(f.data, vec!["foo", "1-aaa", "{\"x\":1}"]);
    }

    #[test]
    fn decode_multiple_frames_from_one_buffer() {
        let mut buf = String::new();
        buf.push_str(&encode(Topic::Record, Action::Read, &["a".into()]));
        buf.push_str(&encode(Topic::Record, Action::Read, &["b".into()]));
        let frames = decode_all(&buf).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data[0], "a");
        assert_eq!(frames[1].data[0], "b");
    }

    #[test]
    fn decode_rejects_unknown_action() {
        let raw = format!("R{}ZZ{}foo{}", PART_SEP, PART_SEP, MSG_TERM);
        assert!(decode_all(&raw).is_err());
    }
}
