//! p2pjs wire protocol: message types and field widths.

use crate::cookie::Cookie;

/// Width of the NUL-padded address text field (39 usable bytes: a full IPv6 literal).
pub const ADDRESS_FIELD_LEN: usize = 8 * 4 + 7 + 1;

/// Width of the NUL-padded port text field ("65535" plus terminator).
pub const PORT_FIELD_LEN: usize = 6;

/// Size of one peer-info record on the wire.
pub const PEER_INFO_LEN: usize = ADDRESS_FIELD_LEN + PORT_FIELD_LEN;

/// Largest script source accepted in a Job message.
pub const MAX_SOURCE_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Address and listening port of a peer, as shared in PeerList and QueryJobResources.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub address: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.address, self.port)
    }
}

/// Why an `ip#port` peer string was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SeedPeerError {
    #[error("expected <ip>#<port>")]
    MissingSeparator,
    #[error("empty address")]
    EmptyAddress,
    #[error("invalid port {0:?}")]
    InvalidPort(String),
}

impl std::str::FromStr for PeerAddress {
    type Err = SeedPeerError;

    /// Parse the `ip#port` form used on the command line.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, port) = s.rsplit_once('#').ok_or(SeedPeerError::MissingSeparator)?;
        let address = address.trim();
        if address.is_empty() {
            return Err(SeedPeerError::EmptyAddress);
        }
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| SeedPeerError::InvalidPort(port.to_owned()))?;
        Ok(PeerAddress::new(address, port))
    }
}

/// Kind of work a job carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Script source text run by the executor's script engine.
    Script,
}

impl JobKind {
    pub fn to_wire(self) -> u32 {
        match self {
            JobKind::Script => 1,
        }
    }

    pub fn from_wire(v: u32) -> Option<Self> {
        match v {
            1 => Some(JobKind::Script),
            _ => None,
        }
    }
}

/// Outcome of a job as reported in JobResult.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Success,
    CompileError,
    RuntimeError,
    /// The executor had no free slot when the job arrived.
    Rejected,
}

impl JobStatus {
    pub fn to_wire(self) -> u32 {
        match self {
            JobStatus::Success => 0,
            JobStatus::CompileError => 1,
            JobStatus::RuntimeError => 2,
            JobStatus::Rejected => 3,
        }
    }

    pub fn from_wire(v: u32) -> Option<Self> {
        match v {
            0 => Some(JobStatus::Success),
            1 => Some(JobStatus::CompileError),
            2 => Some(JobStatus::RuntimeError),
            3 => Some(JobStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        self == JobStatus::Success
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Success => "success",
            JobStatus::CompileError => "compile error",
            JobStatus::RuntimeError => "runtime error",
            JobStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// All wire message types. Layouts are fixed-width binary (see wire module).
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Sent right after connecting: how to reach the sender.
    Hello { port: u16 },
    /// Ask for every peer the receiver knows.
    GetPeers,
    /// Reply to GetPeers.
    PeerList { peers: Vec<PeerAddress> },
    /// Ask for spare capacity to run a job. Flooded until someone offers.
    QueryJobResources {
        kind: JobKind,
        cookie: Cookie,
        origin: PeerAddress,
    },
    /// Reply to QueryJobResources, sent straight to the originator.
    OfferJobResources { cookie: Cookie },
    /// Full job payload, sent to the first offering peer.
    Job {
        cookie: Cookie,
        arg: f64,
        source: String,
    },
    /// Execution outcome, sent back to the originator.
    JobResult {
        cookie: Cookie,
        status: JobStatus,
        result: f64,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello { .. } => MessageKind::Hello,
            Message::GetPeers => MessageKind::GetPeers,
            Message::PeerList { .. } => MessageKind::PeerList,
            Message::QueryJobResources { .. } => MessageKind::QueryJobResources,
            Message::OfferJobResources { .. } => MessageKind::OfferJobResources,
            Message::Job { .. } => MessageKind::Job,
            Message::JobResult { .. } => MessageKind::JobResult,
        }
    }
}

/// Message tag plus the framing facts needed to reassemble it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Hello,
    GetPeers,
    PeerList,
    QueryJobResources,
    OfferJobResources,
    Job,
    JobResult,
}

/// How the total length of a message is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Total length (tag included) known from the tag alone.
    Fixed(usize),
    /// A length/count field of this many bytes follows the tag.
    Prefixed(usize),
}

pub const TAG_LEN: usize = 2;
pub const COOKIE_LEN: usize = 32;

impl MessageKind {
    pub fn tag(self) -> u16 {
        match self {
            MessageKind::Hello => 0,
            MessageKind::GetPeers => 1,
            MessageKind::PeerList => 2,
            MessageKind::QueryJobResources => 3,
            MessageKind::OfferJobResources => 4,
            MessageKind::Job => 5,
            MessageKind::JobResult => 6,
        }
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            0 => Some(MessageKind::Hello),
            1 => Some(MessageKind::GetPeers),
            2 => Some(MessageKind::PeerList),
            3 => Some(MessageKind::QueryJobResources),
            4 => Some(MessageKind::OfferJobResources),
            5 => Some(MessageKind::Job),
            6 => Some(MessageKind::JobResult),
            _ => None,
        }
    }

    pub fn layout(self) -> Layout {
        match self {
            MessageKind::Hello => Layout::Fixed(TAG_LEN + PORT_FIELD_LEN),
            MessageKind::GetPeers => Layout::Fixed(TAG_LEN),
            MessageKind::PeerList => Layout::Prefixed(2),
            MessageKind::QueryJobResources => {
                Layout::Fixed(TAG_LEN + 4 + COOKIE_LEN + PEER_INFO_LEN)
            }
            MessageKind::OfferJobResources => Layout::Fixed(TAG_LEN + COOKIE_LEN),
            MessageKind::Job => Layout::Prefixed(4),
            MessageKind::JobResult => Layout::Fixed(TAG_LEN + COOKIE_LEN + 4 + 8),
        }
    }

    /// Total message length for a prefixed kind given its length field.
    /// None when the length field is out of range.
    pub fn prefixed_len(self, length_field: u32) -> Option<usize> {
        match self {
            MessageKind::PeerList => Some(TAG_LEN + 2 + length_field as usize * PEER_INFO_LEN),
            MessageKind::Job => {
                if length_field > MAX_SOURCE_LEN {
                    return None;
                }
                Some(TAG_LEN + 4 + COOKIE_LEN + 8 + length_field as usize)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageKind::Hello => "hello",
            MessageKind::GetPeers => "getPeers",
            MessageKind::PeerList => "peerList",
            MessageKind::QueryJobResources => "queryJobResources",
            MessageKind::OfferJobResources => "offerJobResources",
            MessageKind::Job => "job",
            MessageKind::JobResult => "jobResult",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seed_peer() {
        assert_eq!(
            "10.1.2.3#2096".parse::<PeerAddress>(),
            Ok(PeerAddress::new("10.1.2.3", 2096))
        );
        assert_eq!(
            "::1#80".parse::<PeerAddress>(),
            Ok(PeerAddress::new("::1", 80))
        );
        assert_eq!(
            "10.1.2.3:2096".parse::<PeerAddress>(),
            Err(SeedPeerError::MissingSeparator)
        );
        assert_eq!("#2096".parse::<PeerAddress>(), Err(SeedPeerError::EmptyAddress));
        assert!(matches!(
            "10.1.2.3#".parse::<PeerAddress>(),
            Err(SeedPeerError::InvalidPort(_))
        ));
        assert!(matches!(
            "10.1.2.3#http".parse::<PeerAddress>(),
            Err(SeedPeerError::InvalidPort(_))
        ));
    }

    #[test]
    fn tags_roundtrip() {
        for tag in 0..7u16 {
            let kind = MessageKind::from_tag(tag).unwrap();
            assert_eq!(kind.tag(), tag);
        }
        assert!(MessageKind::from_tag(7).is_none());
    }

    #[test]
    fn fixed_lengths_match_field_widths() {
        assert_eq!(MessageKind::Hello.layout(), Layout::Fixed(8));
        assert_eq!(MessageKind::GetPeers.layout(), Layout::Fixed(2));
        assert_eq!(MessageKind::QueryJobResources.layout(), Layout::Fixed(84));
        assert_eq!(MessageKind::OfferJobResources.layout(), Layout::Fixed(34));
        assert_eq!(MessageKind::JobResult.layout(), Layout::Fixed(46));
    }

    #[test]
    fn prefixed_lengths() {
        assert_eq!(MessageKind::PeerList.prefixed_len(0), Some(4));
        assert_eq!(MessageKind::PeerList.prefixed_len(2), Some(4 + 2 * 46));
        assert_eq!(MessageKind::Job.prefixed_len(0), Some(46));
        assert_eq!(MessageKind::Job.prefixed_len(MAX_SOURCE_LEN + 1), None);
    }

    #[test]
    fn status_wire_values() {
        for v in 0..4u32 {
            assert_eq!(JobStatus::from_wire(v).unwrap().to_wire(), v);
        }
        assert!(JobStatus::from_wire(4).is_none());
        assert_eq!(JobKind::from_wire(1), Some(JobKind::Script));
        assert!(JobKind::from_wire(0).is_none());
    }
}
