//! Ordered admission control for incoming stream connections.
//!
//! Every credential failure collapses into one opaque "not permitted"
//! response so probing reveals nothing; which gate actually fired is only
//! visible in the logs. Capacity problems use a separate "busy" response.

use crate::clock::monotonic_secs;
use crate::config::{Config, ScopeKind};
use crate::receiver::ReceiverState;
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

/// Outcome of running the gates over a parsed connection.
pub enum Admission {
    Granted { key: Uuid, machine: Uuid },
    /// The child presented this node's own machine identity. Still needs a
    /// takeover so the error token can travel in-band.
    SameLocalhost,
    Denied(DenyReason),
    Busy(BusyReason),
}

/// Log-only differentiation of credential failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    MissingKey,
    MissingHostname,
    MissingMachineGuid,
    MalformedKey,
    MalformedMachineGuid,
    KeyNotApi,
    KeyDisabled,
    KeyIpDenied,
    MachineTypeMismatch,
    MachineDisabled,
    MachineIpDenied,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingKey => "missing_api_key",
            Self::MissingHostname => "missing_hostname",
            Self::MissingMachineGuid => "missing_machine_guid",
            Self::MalformedKey => "malformed_api_key",
            Self::MalformedMachineGuid => "malformed_machine_guid",
            Self::KeyNotApi => "api_key_is_not_api",
            Self::KeyDisabled => "api_key_disabled",
            Self::KeyIpDenied => "api_key_ip_denied",
            Self::MachineTypeMismatch => "machine_guid_is_an_api_key",
            Self::MachineDisabled => "machine_guid_disabled",
            Self::MachineIpDenied => "machine_guid_ip_denied",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyReason {
    NotAcceptingStreams,
    RateLimited { wait_secs: i64 },
}

impl BusyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotAcceptingStreams => "not_accepting_streams",
            Self::RateLimited { .. } => "rate_limited",
        }
    }
}

// ---------------------------------------------------------------------------
// Rate limiter
// ---------------------------------------------------------------------------

/// Process-wide gate on how often a stream may be accepted.
///
/// One monotonic second counter, serialized by compare-and-swap; the
/// contract is the read-modify-write, not any particular lock.
pub struct RateLimiter {
    last_accepted: AtomicI64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            last_accepted: AtomicI64::new(i64::MIN),
        }
    }

    /// Claim an acceptance slot. `Err` carries the seconds left to wait.
    pub fn try_acquire(&self, min_interval_secs: i64, now: i64) -> Result<(), i64> {
        if min_interval_secs <= 0 {
            return Ok(());
        }
        loop {
            let last = self.last_accepted.load(Ordering::Acquire);
            if last != i64::MIN {
                let elapsed = now - last;
                if elapsed < min_interval_secs {
                    return Err(min_interval_secs - elapsed);
                }
            }
            if self
                .last_accepted
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// The gates
// ---------------------------------------------------------------------------

/// Run the ordered admission checks over a parsed connection.
///
/// `accepting` reflects whether the streaming service is currently running
/// at all; `localhost_guid` is this node's own machine identity.
pub fn admit(
    config: &Config,
    accepting: bool,
    localhost_guid: Uuid,
    limiter: &RateLimiter,
    state: &ReceiverState,
) -> Admission {
    if !accepting {
        return Admission::Busy(BusyReason::NotAcceptingStreams);
    }
    if state.key.is_empty() {
        return Admission::Denied(DenyReason::MissingKey);
    }
    if state.hostname.is_empty() {
        return Admission::Denied(DenyReason::MissingHostname);
    }
    if state.machine_guid.is_empty() {
        return Admission::Denied(DenyReason::MissingMachineGuid);
    }
    let Ok(key) = Uuid::parse_str(&state.key) else {
        return Admission::Denied(DenyReason::MalformedKey);
    };
    let Ok(machine) = Uuid::parse_str(&state.machine_guid) else {
        return Admission::Denied(DenyReason::MalformedMachineGuid);
    };
    if config.kind_of(&key).unwrap_or(ScopeKind::Api) != ScopeKind::Api {
        return Admission::Denied(DenyReason::KeyNotApi);
    }
    if !config.scope_enabled(&key, ScopeKind::Api) {
        return Admission::Denied(DenyReason::KeyDisabled);
    }
    if !config.ip_allowed(&key, &state.client_ip) {
        return Admission::Denied(DenyReason::KeyIpDenied);
    }
    if config.kind_of(&machine).unwrap_or(ScopeKind::Machine) != ScopeKind::Machine {
        return Admission::Denied(DenyReason::MachineTypeMismatch);
    }
    if !config.scope_enabled(&machine, ScopeKind::Machine) {
        return Admission::Denied(DenyReason::MachineDisabled);
    }
    if !config.ip_allowed(&machine, &state.client_ip) {
        return Admission::Denied(DenyReason::MachineIpDenied);
    }
    if machine == localhost_guid {
        return Admission::SameLocalhost;
    }
    if let Err(wait_secs) =
        limiter.try_acquire(config.stream.min_interval_secs, monotonic_secs())
    {
        return Admission::Busy(BusyReason::RateLimited { wait_secs });
    }
    Admission::Granted { key, machine }
}
