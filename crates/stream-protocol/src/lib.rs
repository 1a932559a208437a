// stream-protocol: wire contract between a telemetry parent and its children.
//
// The capability bitset negotiated on connect is the source of truth for
// everything version-dependent; the initial prompt a parent writes on the
// stream socket is a pure function of it.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Handshake response tokens
// ---------------------------------------------------------------------------

/// Fixed tokens written back to a child during connection acceptance.
///
/// The first three travel as HTTP response bodies (the parent still owns the
/// request at that point); the rest are written raw on the stream socket
/// after takeover. Children match on the exact bytes, so these are frozen.
pub mod tokens {
    /// HTTP 401 body. One opaque token for every credential failure.
    pub const NOT_PERMITTED: &str = "START_STREAMING_ERROR_NOT_PERMITTED";
    /// HTTP 503 body. Service not accepting streams, or rate limited.
    pub const BUSY_TRY_LATER: &str = "START_STREAMING_ERROR_BUSY_TRY_LATER";
    /// HTTP 409 body, and in-band when a second receiver attaches mid-bind.
    pub const ALREADY_STREAMING: &str = "START_STREAMING_ERROR_ALREADY_STREAMING";

    /// In-band: host creation failed.
    pub const INTERNAL_ERROR: &str = "START_STREAMING_ERROR_INTERNAL_ERROR";
    /// In-band: host exists but is not ready to accept a child yet.
    pub const INITIALIZATION: &str = "START_STREAMING_ERROR_INITIALIZATION";
    /// In-band: the child presented the parent's own machine identity.
    pub const SAME_LOCALHOST: &str = "START_STREAMING_ERROR_SAME_LOCALHOST";

    /// In-band success prompts. `PROMPT_VN` is followed by a decimal number:
    /// the full capability bits when the child speaks VCAPS, the plain
    /// protocol version otherwise.
    pub const PROMPT_V1: &str = "START_STREAMING_PROMPT_V1";
    pub const PROMPT_V2: &str = "START_STREAMING_PROMPT_V2";
    pub const PROMPT_VN: &str = "START_STREAMING_PROMPT_VN";
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

bitflags! {
    /// Feature flags negotiated on connect.
    ///
    /// Encodes the protocol version plus optional features. Newer protocol
    /// versions are strict supersets of older ones (see
    /// [`Capabilities::for_version`]); negotiation relies on that.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        /// Original line protocol.
        const V1 = 1 << 0;
        /// Second-generation framing.
        const V2 = 1 << 1;
        /// Versioned prompts: the child can read a version number off the
        /// initial response.
        const VN = 1 << 2;
        /// Variable-sized capability exchange: the child can read the full
        /// bitset off the initial response.
        const VCAPS = 1 << 3;
        /// Host labels travel with the stream.
        const HOST_LABELS = 1 << 4;
        /// Claiming metadata travels with the stream.
        const CLAIM = 1 << 5;
        /// Gap replication after reconnect.
        const REPLICATION = 1 << 6;
        /// Remote function execution over the stream.
        const FUNCTIONS = 1 << 7;
        /// Binary sample encoding.
        const BINARY = 1 << 8;
        /// Interpolated sample timestamps.
        const INTERPOLATED = 1 << 9;
        /// Transport compression codecs the peer can decode.
        const COMPRESSION_GZIP = 1 << 10;
        const COMPRESSION_LZ4 = 1 << 11;
        const COMPRESSION_ZSTD = 1 << 12;
        /// Machine-learning model exchange.
        const ML_MODELS = 1 << 13;
    }
}

/// Highest protocol version this build understands.
pub const MAX_PROTOCOL_VERSION: u32 = 8;

impl Capabilities {
    /// Capability set for a numeric protocol version.
    ///
    /// The table is cumulative: every version's set contains every older
    /// version's set. Versions above [`MAX_PROTOCOL_VERSION`] are clamped,
    /// so a newer child still negotiates everything this build supports.
    pub fn for_version(version: u32) -> Self {
        let mut caps = Self::V1;
        if version >= 2 {
            caps |= Self::V2;
        }
        if version >= 3 {
            caps |= Self::VN;
        }
        if version >= 4 {
            caps |= Self::HOST_LABELS | Self::CLAIM;
        }
        if version >= 5 {
            caps |= Self::REPLICATION | Self::FUNCTIONS;
        }
        if version >= 6 {
            caps |= Self::COMPRESSION_GZIP | Self::COMPRESSION_LZ4;
        }
        if version >= 7 {
            caps |= Self::BINARY | Self::INTERPOLATED;
        }
        if version >= 8 {
            caps |= Self::VCAPS | Self::COMPRESSION_ZSTD | Self::ML_MODELS;
        }
        caps
    }

    /// Highest protocol version whose capability set is contained in `self`.
    pub fn version(self) -> u32 {
        (1..=MAX_PROTOCOL_VERSION)
            .rev()
            .find(|v| self.contains(Self::for_version(*v)))
            .unwrap_or(1)
    }

    /// Compose the initial response for a negotiated set.
    ///
    /// Dispatch order matters: VCAPS is checked before VN because every
    /// VCAPS-bearing set also carries VN, and the richer encoding wins.
    pub fn initial_prompt(self) -> String {
        if self.contains(Self::VCAPS) {
            format!("{}{}", tokens::PROMPT_VN, self.bits())
        } else if self.contains(Self::VN) {
            format!("{}{}", tokens::PROMPT_VN, self.version())
        } else if self.contains(Self::V2) {
            tokens::PROMPT_V2.to_owned()
        } else {
            tokens::PROMPT_V1.to_owned()
        }
    }

    /// Pick the stream compression codec, best first.
    pub fn select_compression(self) -> Option<Compression> {
        if self.contains(Self::COMPRESSION_ZSTD) {
            Some(Compression::Zstd)
        } else if self.contains(Self::COMPRESSION_LZ4) {
            Some(Compression::Lz4)
        } else if self.contains(Self::COMPRESSION_GZIP) {
            Some(Compression::Gzip)
        } else {
            None
        }
    }
}

/// Stream transport compression codecs, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Zstd,
    Lz4,
    Gzip,
}

// ---------------------------------------------------------------------------
// Disconnect reasons
// ---------------------------------------------------------------------------

/// Why a receiver left (or never reached) the streaming loop.
///
/// Logged on teardown; `StaleReceiver` is also the signal a preempting
/// connection sends to the receiver it replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A newer connection for the same host preempted this one.
    StaleReceiver,
    /// The child closed the connection.
    SocketClosed,
    /// A read or write on the stream socket failed.
    SocketError,
    /// Nothing arrived within the receive timeout.
    Timeout,
    /// The parent is shutting down.
    Shutdown,
    /// The initial response could not be delivered.
    CantReply,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StaleReceiver => "DISCONNECT_STALE_RECEIVER",
            Self::SocketClosed => "DISCONNECT_SOCKET_CLOSED",
            Self::SocketError => "DISCONNECT_SOCKET_ERROR",
            Self::Timeout => "DISCONNECT_TIMEOUT",
            Self::Shutdown => "DISCONNECT_SHUTDOWN",
            Self::CantReply => "DISCONNECT_CANT_REPLY",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_table_is_cumulative() {
        for v in 1..=MAX_PROTOCOL_VERSION {
            let older = Capabilities::for_version(v - 1);
            let newer = Capabilities::for_version(v);
            assert!(
                newer.contains(older),
                "version {v} must contain everything version {} has",
                v - 1
            );
        }
    }

    #[test]
    fn vcaps_sets_are_supersets_of_vn_sets() {
        // Negotiation checks VCAPS before VN; that branch order is only
        // correct while every VCAPS-bearing version also carries VN.
        for v in 1..=MAX_PROTOCOL_VERSION {
            let caps = Capabilities::for_version(v);
            if caps.contains(Capabilities::VCAPS) {
                assert!(caps.contains(Capabilities::VN));
            }
        }
    }

    #[test]
    fn version_zero_and_one_share_the_legacy_set() {
        assert_eq!(Capabilities::for_version(0), Capabilities::V1);
        assert_eq!(Capabilities::for_version(1), Capabilities::V1);
    }

    #[test]
    fn versions_above_max_clamp_to_max() {
        assert_eq!(
            Capabilities::for_version(MAX_PROTOCOL_VERSION + 5),
            Capabilities::for_version(MAX_PROTOCOL_VERSION)
        );
    }

    #[test]
    fn version_round_trips_through_the_table() {
        for v in 1..=MAX_PROTOCOL_VERSION {
            assert_eq!(Capabilities::for_version(v).version(), v);
        }
    }

    #[test]
    fn prompt_dispatch_follows_the_capability_ladder() {
        let v1 = Capabilities::for_version(1);
        assert_eq!(v1.initial_prompt(), tokens::PROMPT_V1);

        let v2 = Capabilities::for_version(2);
        assert_eq!(v2.initial_prompt(), tokens::PROMPT_V2);

        let v5 = Capabilities::for_version(5);
        assert_eq!(v5.initial_prompt(), format!("{}5", tokens::PROMPT_VN));

        let v8 = Capabilities::for_version(8);
        assert_eq!(
            v8.initial_prompt(),
            format!("{}{}", tokens::PROMPT_VN, v8.bits())
        );
    }

    #[test]
    fn compression_preference_is_zstd_then_lz4_then_gzip() {
        assert_eq!(
            Capabilities::for_version(8).select_compression(),
            Some(Compression::Zstd)
        );
        assert_eq!(
            Capabilities::for_version(6).select_compression(),
            Some(Compression::Lz4)
        );
        assert_eq!(
            Capabilities::COMPRESSION_GZIP.select_compression(),
            Some(Compression::Gzip)
        );
        assert_eq!(Capabilities::for_version(3).select_compression(), None);
    }
}
