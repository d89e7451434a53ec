//! Wire-level types shared by every component: frames, topics/actions, and
//! the composite record version used for last-writer-wins conflict
//! resolution.

use std::fmt;
use std::sync::Arc;

/// Field separator used inside a frame (`0x1F`, ASCII Unit Separator).
pub const PART_SEP: char = '\u{1F}';
/// Frame terminator (`0x1E`, ASCII Record Separator).
pub const MSG_TERM: char = '\u{1E}';

/// Top-level routing key of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Record,
    Rpc,
    ListenPatterns,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Record => "R",
            Topic::Rpc => "P",
            Topic::ListenPatterns => "L",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Topic {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "R" => Ok(Topic::Record),
            "P" => Ok(Topic::Rpc),
            "L" => Ok(Topic::ListenPatterns),
            other => Err(crate::Error::UnknownTopic(other.to_string())),
        }
    }
}

/// Action carried by a frame; meaning is scoped to the enclosing [`Topic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Read,
    Update,
    Unsubscribe,
    Listen,
    Unlisten,
    ListenAccept,
    ListenReject,
    SubscriptionForPatternFound,
    SubscriptionForPatternRemoved,
    SubscriptionHasProvider,
    Provide,
    Unprovide,
    Request,
    Accept,
    Reject,
    Response,
    Error,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "RD",
            Action::Update => "U",
            Action::Unsubscribe => "US",
            Action::Listen => "L",
            Action::Unlisten => "UL",
            Action::ListenAccept => "LA",
            Action::ListenReject => "LR",
            Action::SubscriptionForPatternFound => "SPF",
            Action::SubscriptionForPatternRemoved => "SPR",
            Action::SubscriptionHasProvider => "SHP",
            Action::Provide => "PR",
            Action::Unprovide => "UP",
            Action::Request => "REQ",
            Action::Accept => "A",
            Action::Reject => "RJ",
            Action::Response => "RES",
            Action::Error => "E",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "RD" => Action::Read,
            "U" => Action::Update,
            "US" => Action::Unsubscribe,
            "L" => Action::Listen,
            "UL" => Action::Unlisten,
            "LA" => Action::ListenAccept,
            "LR" => Action::ListenReject,
            "SPF" => Action::SubscriptionForPatternFound,
            "SPR" => Action::SubscriptionForPatternRemoved,
            "SHP" => Action::SubscriptionHasProvider,
            "PR" => Action::Provide,
            "UP" => Action::Unprovide,
            "REQ" => Action::Request,
            "A" => Action::Accept,
            "RJ" => Action::Reject,
            "RES" => Action::Response,
            "E" => Action::Error,
            other => return Err(crate::Error::UnknownAction(other.to_string())),
        })
    }
}

/// A decoded wire frame: topic, action, ordered string parts, and the raw
/// encoded form (kept around so it can be replayed verbatim to future
/// subscribers without re-encoding).
#[derive(Debug, Clone)]
pub struct Frame {
    pub topic: Topic,
    pub action: Action,
    pub data: Vec<String>,
    pub raw: Arc<str>,
}

impl Frame {
    pub fn new(topic: Topic, action: Action, data: Vec<String>) -> Self {
        let raw = crate::codec::encode(topic, action, &data);
        Self {
            topic,
            action,
            data,
            raw: Arc::from(raw),
        }
    }

    pub fn part(&self, i: usize) -> Option<&str> {
        self.data.get(i).map(|s| s.as_str())
    }
}

/// Numeric part of a version: either a concrete integer or the `INF`
/// sentinel, which dominates every other version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VersionNum {
    Num(u64),
    Inf,
}

/// A record version `"<n>-<tag>"`. Ordering is: numeric part first
/// (`Inf` is maximal), tag is the lexicographic tie-break on equal numeric
/// parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub num: VersionNum,
    pub tag: String,
}

impl Version {
    pub const DEFAULT_TAG_WIDTH: usize = 14;

    pub fn new(num: u64, tag: impl Into<String>) -> Self {
        Self {
            num: VersionNum::Num(num),
            tag: tag.into(),
        }
    }

    pub fn inf(tag: impl Into<String>) -> Self {
        Self {
            num: VersionNum::Inf,
            tag: tag.into(),
        }
    }

    /// The "no record yet" placeholder stored while a READ is in flight.
    pub fn loading() -> Self {
        Self {
            num: VersionNum::Num(0),
            tag: String::new(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, crate::Error> {
        let (num_part, tag) = s
            .split_once('-')
            .ok_or_else(|| crate::Error::InvalidVersion(s.to_string()))?;
        let num = if num_part == "INF" {
            VersionNum::Inf
        } else {
            VersionNum::Num(
                num_part
                    .parse::<u64>()
                    .map_err(|_| crate::Error::InvalidVersion(s.to_string()))?,
            )
        };
        Ok(Self {
            num,
            tag: tag.to_string(),
        })
    }

    /// True if `self` is strictly newer than `other` and should replace it.
    pub fn dominates(&self, other: &Version) -> bool {
        match (self.num, other.num) {
            (VersionNum::Inf, VersionNum::Inf) => self.tag > other.tag,
            (VersionNum::Inf, _) => true,
            (_, VersionNum::Inf) => false,
            (VersionNum::Num(a), VersionNum::Num(b)) => a > b || (a == b && self.tag > other.tag),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.num {
            VersionNum::Inf => write!(f, "INF-{}", self.tag),
            VersionNum::Num(n) => write!(f, "{}-{}", n, self.tag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_roundtrip() {
        let v = Version::new(5, "aaa");
        assert_eq!(Version::parse(&v.to_string()).unwrap(), v);
    }

    #[test]
    fn version_domination_by_number() {
        let a = Version::new(5, "aaa");
        let b = Version::new(6, "aaa");
        assert!(b.dominates(&a));
        assert!(!a.dominates(&b));
    }

    #[test]
    fn version_domination_by_tag_on_tie() {
        let a = Version::new(5, "aaa");
        let b = Version::new(5, "zzz");
        assert!(b.dominates(&a));
        assert!(!a.dominates(&b));
    }

    #[test]
    fn inf_dominates_any_number() {
        let a = Version::inf("aaa");
        let b = Version::new(999_999, "zzz");
        assert!(a.dominates(&b));
        assert!(!b.dominates(&a));
    }

    #[test]
    fn topic_action_roundtrip() {
        use std::str::FromStr;
        assert_eq!(Topic::from_str(Topic::Record.as_str()).unwrap(), Topic::Record);
        assert_eq!(Action::from_str(Action::Update.as_str()).unwrap(), Action::Update);
    }
}
