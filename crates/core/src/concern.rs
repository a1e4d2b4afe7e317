//! Consistency and durability levels
//!
//! A [`ConcernSet`] is the triple a database handle is bound to: how writes are
//! acknowledged ([`WriteConcern`]), what a read is allowed to observe
//! ([`ReadConcern`]) and which member serves it ([`ReadPreference`]).

use std::fmt;

use serde::{Deserialize, Serialize};

/// How many members must acknowledge a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AcknowledgementRepr", into = "AcknowledgementRepr")]
pub enum Acknowledgement {
    /// A fixed number of members (0 = unacknowledged)
    Nodes(u32),
    /// A majority of the voting members
    Majority,
}

impl Acknowledgement {
    /// Number of members that must have applied the write for a set of `members`
    pub fn required_members(&self, members: u32) -> u32 {
        match self {
            Self::Nodes(n) => *n,
            Self::Majority => members / 2 + 1,
        }
    }
}

impl fmt::Display for Acknowledgement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nodes(n) => write!(f, "{}", n),
            Self::Majority => write!(f, "majority"),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum AcknowledgementRepr {
    Nodes(u32),
    Tag(String),
}

impl TryFrom<AcknowledgementRepr> for Acknowledgement {
    type Error = String;

    fn try_from(repr: AcknowledgementRepr) -> Result<Self, Self::Error> {
        match repr {
            AcknowledgementRepr::Nodes(n) => Ok(Self::Nodes(n)),
            AcknowledgementRepr::Tag(tag) if tag == "majority" => Ok(Self::Majority),
            AcknowledgementRepr::Tag(tag) => Err(format!(
                "unknown write acknowledgement '{}', expected a number or \"majority\"",
                tag
            )),
        }
    }
}

impl From<Acknowledgement> for AcknowledgementRepr {
    fn from(ack: Acknowledgement) -> Self {
        match ack {
            Acknowledgement::Nodes(n) => Self::Nodes(n),
            Acknowledgement::Majority => Self::Tag("majority".to_string()),
        }
    }
}

/// Durability level requested for writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteConcern {
    pub w: Acknowledgement,

    /// Wait for the on-disk journal (None = server default)
    #[serde(default, rename = "j", skip_serializing_if = "Option::is_none")]
    pub journal: Option<bool>,
}

impl WriteConcern {
    pub fn nodes(n: u32) -> Self {
        Self {
            w: Acknowledgement::Nodes(n),
            journal: None,
        }
    }

    pub fn majority() -> Self {
        Self {
            w: Acknowledgement::Majority,
            journal: None,
        }
    }

    /// Set the journal flag
    pub fn with_journal(mut self, journal: bool) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Whether the client waits for any acknowledgement at all
    pub fn is_acknowledged(&self) -> bool {
        !matches!(self.w, Acknowledgement::Nodes(0)) || self.journal == Some(true)
    }
}

impl Default for WriteConcern {
    fn default() -> Self {
        Self::nodes(1)
    }
}

impl fmt::Display for WriteConcern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w={}", self.w)?;
        if let Some(journal) = self.journal {
            write!(f, " j={}", journal)?;
        }
        Ok(())
    }
}

/// Visibility guarantee applied to a read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadConcern {
    #[default]
    Local,
    Available,
    Majority,
    Linearizable,
    Snapshot,
}

impl fmt::Display for ReadConcern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Available => write!(f, "available"),
            Self::Majority => write!(f, "majority"),
            Self::Linearizable => write!(f, "linearizable"),
            Self::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Which replica-set member a read may be routed to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPreference {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::PrimaryPreferred => write!(f, "primary_preferred"),
            Self::Secondary => write!(f, "secondary"),
            Self::SecondaryPreferred => write!(f, "secondary_preferred"),
            Self::Nearest => write!(f, "nearest"),
        }
    }
}

/// Write concern, read concern and read preference bound together
///
/// Absent levels fall back to the server defaults (`w=1`, `local`, `primary`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcernSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write: Option<WriteConcern>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<ReadConcern>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preference: Option<ReadPreference>,
}

/// Options passed when starting a transaction
pub type TransactionOptions = ConcernSet;

impl ConcernSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write(mut self, write: WriteConcern) -> Self {
        self.write = Some(write);
        self
    }

    pub fn with_read(mut self, read: ReadConcern) -> Self {
        self.read = Some(read);
        self
    }

    pub fn with_preference(mut self, preference: ReadPreference) -> Self {
        self.preference = Some(preference);
        self
    }

    pub fn effective_write(&self) -> WriteConcern {
        self.write.unwrap_or_default()
    }

    pub fn effective_read(&self) -> ReadConcern {
        self.read.unwrap_or_default()
    }

    pub fn effective_preference(&self) -> ReadPreference {
        self.preference.unwrap_or_default()
    }

    pub fn is_default(&self) -> bool {
        self.write.is_none() && self.read.is_none() && self.preference.is_none()
    }
}

impl fmt::Display for ConcernSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            return write!(f, "server defaults");
        }

        let mut parts = Vec::with_capacity(3);
        if let Some(write) = self.write {
            parts.push(write.to_string());
        }
        if let Some(read) = self.read {
            parts.push(format!("rc={}", read));
        }
        if let Some(preference) = self.preference {
            parts.push(format!("rp={}", preference));
        }
        write!(f, "{}", parts.join(", "))
    }
}
