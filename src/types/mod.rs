//! Core identifier and access-control types shared across the server.

pub mod msg;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// User ids
// ---------------------------------------------------------------------------

/// Opaque user id. Zero means "not authenticated".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(pub u64);

impl Uid {
    pub const ZERO: Uid = Uid(0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Render as the external `usr...` form used on the wire.
    pub fn user_id(&self) -> String {
        format!("usr{}", URL_SAFE_NO_PAD.encode(self.0.to_be_bytes()))
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.user_id())
    }
}

impl Serialize for Uid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.user_id())
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(parse_user_id(&s))
    }
}

/// Parse an external `usr...` id. Malformed input yields [`Uid::ZERO`].
pub fn parse_user_id(s: &str) -> Uid {
    let Some(tail) = s.strip_prefix("usr") else {
        return Uid::ZERO;
    };
    match URL_SAFE_NO_PAD.decode(tail) {
        Ok(bytes) if bytes.len() == 8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes);
            Uid(u64::from_be_bytes(raw))
        }
        _ => Uid::ZERO,
    }
}

// ---------------------------------------------------------------------------
// Topic names and categories
// ---------------------------------------------------------------------------

/// Coarse topic category. Only the handling relevant to proxy topics is
/// implemented; master-side behavior lives elsewhere in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicCat {
    /// Per-user `me` topic.
    Me,
    /// One-to-one conversation.
    P2P,
    /// Group conversation, possibly channel-enabled.
    Grp,
    /// System topic.
    Sys,
}

/// Classify a topic by its routing name.
pub fn topic_cat(name: &str) -> TopicCat {
    if name.starts_with("usr") {
        TopicCat::Me
    } else if name.starts_with("p2p") {
        TopicCat::P2P
    } else if name.starts_with("sys") {
        TopicCat::Sys
    } else {
        TopicCat::Grp
    }
}

/// True if the name refers to the broadcast-only channel variant of a group.
pub fn is_channel(name: &str) -> bool {
    name.starts_with("chn")
}

/// Convert a group topic name to its channel alias.
pub fn grp_to_chn(name: &str) -> String {
    match name.strip_prefix("grp") {
        Some(tail) => format!("chn{tail}"),
        None => name.to_string(),
    }
}

/// Convert a channel alias back to the group topic name.
pub fn chn_to_grp(name: &str) -> String {
    match name.strip_prefix("chn") {
        Some(tail) => format!("grp{tail}"),
        None => name.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Access modes
// ---------------------------------------------------------------------------

bitflags! {
    /// Per-user topic access mode.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct AccessMode: u32 {
        /// Join the topic.
        const JOIN = 1 << 0;
        /// Read messages.
        const READ = 1 << 1;
        /// Write messages.
        const WRITE = 1 << 2;
        /// Receive presence updates.
        const PRES = 1 << 3;
        /// Approve subscription requests.
        const APPROVE = 1 << 4;
        /// Share the topic with others.
        const SHARE = 1 << 5;
        /// Delete messages.
        const DELETE = 1 << 6;
        /// Topic owner.
        const OWNER = 1 << 7;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModeError {
    #[error("mutation must start with '+' or '-'")]
    MissingOperator,
    #[error("unrecognized mode character {0:?}")]
    UnknownFlag(char),
}

impl AccessMode {
    fn flag(c: char) -> Result<AccessMode, ModeError> {
        Ok(match c.to_ascii_uppercase() {
            'J' => AccessMode::JOIN,
            'R' => AccessMode::READ,
            'W' => AccessMode::WRITE,
            'P' => AccessMode::PRES,
            'A' => AccessMode::APPROVE,
            'S' => AccessMode::SHARE,
            'D' => AccessMode::DELETE,
            'O' => AccessMode::OWNER,
            other => return Err(ModeError::UnknownFlag(other)),
        })
    }

    /// Apply a textual mutation such as `+RW-S`. An empty string is a no-op.
    pub fn apply_mutation(&mut self, mutation: &str) -> Result<(), ModeError> {
        let mut grant: Option<bool> = None;
        for c in mutation.chars() {
            match c {
                '+' => grant = Some(true),
                '-' => grant = Some(false),
                _ => {
                    let flag = Self::flag(c)?;
                    match grant {
                        Some(true) => self.insert(flag),
                        Some(false) => self.remove(flag),
                        None => return Err(ModeError::MissingOperator),
                    }
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("N");
        }
        for (flag, c) in [
            (AccessMode::JOIN, 'J'),
            (AccessMode::READ, 'R'),
            (AccessMode::WRITE, 'W'),
            (AccessMode::PRES, 'P'),
            (AccessMode::APPROVE, 'A'),
            (AccessMode::SHARE, 'S'),
            (AccessMode::DELETE, 'D'),
            (AccessMode::OWNER, 'O'),
        ] {
            if self.contains(flag) {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}
