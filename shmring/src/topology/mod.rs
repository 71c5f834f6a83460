use std::convert::TryFrom;
use std::fmt;

/// Where the writer sits relative to the reader.
///
/// The discriminants are what gets stored in the shared header.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Topology {
    /// Writer ahead of the reader, nothing wrapped.
    Linear = 0,
    /// Writer just restarted from the origin, behind the reader.
    JustWrapped = 1,
    /// Writer appending between the origin and the reader.
    WrappedBehindReader = 2,
    /// Writer caught up with the reader; linear inserts stay blocked until the
    /// reader wraps.
    WrappedAtCapacity = 3,
    /// Reader followed a link back to the origin.
    ReaderAtOrigin = 4,
}

/// A state change of the ring, as seen by the topology.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// The ring was empty and the writer restarted from the origin.
    /// `caught` is set when the record filled the whole store.
    Restart { caught: bool },
    /// Record appended after the write offset; writer stays ahead.
    Append,
    /// Writer moved to the origin, either by placing the record there or by
    /// ending exactly at the physical end of the store. `caught` is only set
    /// in the second case, when the reader is at the origin too.
    Wrap { caught: bool },
    /// Record appended between the write offset and the reader.
    AppendBehind { caught: bool },
    /// The reader followed a forward link of 0.
    ReaderWrapped,
}

impl Topology {
    /// Transition table. `ahead` is Linear or ReaderAtOrigin, `behind` is
    /// JustWrapped, WrappedBehindReader or WrappedAtCapacity.
    ///
    /// ```text
    /// step           from     to
    /// ReaderWrapped  any      ReaderAtOrigin
    /// Restart        any      Linear, or WrappedAtCapacity if caught
    /// Append         ahead    Linear
    /// Wrap           ahead    JustWrapped, or WrappedAtCapacity if caught
    /// AppendBehind   behind   WrappedBehindReader, or WrappedAtCapacity if caught
    /// ```
    ///
    /// Anything else is unreachable and yields `None`.
    pub fn after(self, step: Step) -> Option<Topology> {
        use Topology::*;

        let caught_or = |caught: bool, otherwise: Topology| {
            if caught {
                WrappedAtCapacity
            } else {
                otherwise
            }
        };
        let next = match (self, step) {
            (_, Step::ReaderWrapped) => ReaderAtOrigin,
            (_, Step::Restart { caught }) => caught_or(caught, Linear),
            (Linear | ReaderAtOrigin, Step::Append) => Linear,
            (Linear | ReaderAtOrigin, Step::Wrap { caught }) => caught_or(caught, JustWrapped),
            (JustWrapped | WrappedBehindReader | WrappedAtCapacity, Step::AppendBehind { caught }) => {
                caught_or(caught, WrappedBehindReader)
            }
            _ => return None,
        };
        Some(next)
    }

    /// Modes in which the write offset may legally be ahead of the read offset.
    pub fn writer_ahead(self) -> bool {
        matches!(
            self,
            Topology::Linear | Topology::ReaderAtOrigin | Topology::WrappedAtCapacity
        )
    }

    /// Modes in which the write offset may legally be at or behind the read offset.
    pub fn writer_behind(self) -> bool {
        matches!(
            self,
            Topology::JustWrapped | Topology::WrappedBehindReader | Topology::WrappedAtCapacity
        )
    }
}

impl TryFrom<u32> for Topology {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Topology::Linear),
            1 => Ok(Topology::JustWrapped),
            2 => Ok(Topology::WrappedBehindReader),
            3 => Ok(Topology::WrappedAtCapacity),
            4 => Ok(Topology::ReaderAtOrigin),
            other => Err(other),
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topology::Linear => "linear",
            Topology::JustWrapped => "just-wrapped",
            Topology::WrappedBehindReader => "wrapped-behind-reader",
            Topology::WrappedAtCapacity => "wrapped-at-capacity",
            Topology::ReaderAtOrigin => "reader-at-origin",
        };
        f.write_str(name)
    }
}
