//! Per-connection receiver state and the handshake parameter parser.
//!
//! One `ReceiverState` exists per incoming child connection. The acceptance
//! flow owns it exclusively until handoff, when ownership moves to a
//! streaming worker. The `ReceiverShared` block inside it is the part the
//! host registry keeps a handle to, so a later connection for the same host
//! can observe liveness and signal a stop.

use crate::clock::monotonic_secs;
use crate::config::ReceiverConfig;
use crate::socket::StreamConn;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stream_protocol::{Capabilities, Compression, ExitReason};
use tokio::sync::Notify;
use tracing::debug;

/// Fixed size of the per-connection compressed read buffer.
pub const COMPRESSED_CHUNK_SIZE: usize = 16 * 1024;

static LIVE_RECEIVERS: AtomicUsize = AtomicUsize::new(0);
static RECEIVER_BUFFER_BYTES: AtomicUsize = AtomicUsize::new(0);

/// Number of receiver states currently alive in the process.
pub fn live_receivers() -> usize {
    LIVE_RECEIVERS.load(Ordering::Relaxed)
}

/// Bytes currently allocated for receiver read buffers.
pub fn receiver_buffer_bytes() -> usize {
    RECEIVER_BUFFER_BYTES.load(Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Shared block
// ---------------------------------------------------------------------------

/// The part of a receiver that outlives exclusive ownership: liveness
/// timestamp, stop signal, and exit notification. The host's receiver slot
/// holds an `Arc` of this.
pub struct ReceiverShared {
    shutdown: AtomicBool,
    exited: AtomicBool,
    exit_notify: Notify,
    last_msg_t: AtomicI64,
    exit_reason: Mutex<Option<ExitReason>>,
    sock: Mutex<Option<Arc<std::net::TcpStream>>>,
}

impl ReceiverShared {
    fn new() -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            exit_notify: Notify::new(),
            last_msg_t: AtomicI64::new(monotonic_secs()),
            exit_reason: Mutex::new(None),
            sock: Mutex::new(None),
        }
    }

    /// Monotonic second of the last message seen on this connection.
    pub fn last_msg_secs(&self) -> i64 {
        self.last_msg_t.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        self.last_msg_t.store(monotonic_secs(), Ordering::Relaxed);
    }

    /// For tests and stale-receiver simulation: backdate the liveness stamp.
    pub fn set_last_msg_secs(&self, secs: i64) {
        self.last_msg_t.store(secs, Ordering::Relaxed);
    }

    /// Record why this receiver is going away. First reason wins.
    pub fn set_exit_reason(&self, reason: ExitReason) {
        let mut slot = self
            .exit_reason
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        *self
            .exit_reason
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Ask the owning worker to stop. Shuts the socket down as well, so a
    /// read blocked inside the receive timeout wakes immediately.
    pub fn signal_stop(&self, reason: ExitReason) {
        self.set_exit_reason(reason);
        self.shutdown.store(true, Ordering::Release);
        let sock = self
            .sock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(sock) = sock.as_ref() {
            let _ = sock.shutdown(std::net::Shutdown::Both);
        }
    }

    pub fn should_stop(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Called once the connection is in blocking mode, so `signal_stop` can
    /// reach the socket.
    pub fn register_socket(&self, sock: Arc<std::net::TcpStream>) {
        *self
            .sock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(sock);
    }

    /// The owning worker announces its exit. Wakes at most one waiter; a
    /// permit is stored if nobody is waiting yet.
    pub fn mark_exited(&self) {
        self.exited.store(true, Ordering::Release);
        self.exit_notify.notify_one();
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Wait for the owning worker to exit, bounded by `timeout`.
    pub async fn wait_exited(&self, timeout: Duration) -> bool {
        if self.has_exited() {
            return true;
        }
        tokio::time::timeout(timeout, self.exit_notify.notified())
            .await
            .is_ok()
            || self.has_exited()
    }
}

// ---------------------------------------------------------------------------
// System info
// ---------------------------------------------------------------------------

/// Free-form host metadata reported by the child. Only known names are
/// accepted; once handed to the host at bind time the acceptance flow must
/// not touch it again.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    entries: BTreeMap<String, String>,
}

const SYSTEM_INFO_NAMES: &[&str] = &["hops", "ml_capable", "ml_enabled", "mc_version"];
const SYSTEM_INFO_PREFIXES: &[&str] = &[
    "NETDATA_HOST_",
    "NETDATA_SYSTEM_",
    "NETDATA_CONTAINER_",
    "NETDATA_INSTANCE_",
];

impl SystemInfo {
    /// Store `name = value`. Returns false when the name is unknown.
    pub fn set(&mut self, name: &str, value: &str) -> bool {
        let known = SYSTEM_INFO_NAMES.contains(&name)
            || SYSTEM_INFO_PREFIXES.iter().any(|p| name.starts_with(p));
        if !known {
            return false;
        }
        self.entries.insert(name.to_owned(), value.to_owned());
        true
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Decompressor state
// ---------------------------------------------------------------------------

/// Selected stream codec plus the fixed-size read buffer the worker fills.
/// The frame decoder downstream owns the actual decompression.
pub struct DecompressorState {
    pub algorithm: Option<Compression>,
    pub buffer: Vec<u8>,
}

impl DecompressorState {
    fn new() -> Self {
        RECEIVER_BUFFER_BYTES.fetch_add(COMPRESSED_CHUNK_SIZE, Ordering::Relaxed);
        Self {
            algorithm: None,
            buffer: vec![0u8; COMPRESSED_CHUNK_SIZE],
        }
    }
}

impl Drop for DecompressorState {
    fn drop(&mut self) {
        RECEIVER_BUFFER_BYTES.fetch_sub(COMPRESSED_CHUNK_SIZE, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Receiver state
// ---------------------------------------------------------------------------

pub struct ReceiverState {
    pub conn: StreamConn,
    pub client_ip: String,
    pub client_port: String,

    pub key: String,
    pub hostname: String,
    pub registry_hostname: String,
    pub machine_guid: String,
    pub os: String,
    pub timezone: String,
    pub abbrev_timezone: String,
    pub utc_offset: i32,
    pub program_name: String,
    pub program_version: String,
    pub hops: i16,
    pub update_every: i64,

    pub capabilities: Capabilities,
    /// Resolved after admission, from defaults + API key + machine sections.
    pub config: Option<ReceiverConfig>,
    /// `take()`n by the host binder; `None` afterwards.
    pub system_info: Option<SystemInfo>,

    pub connected_since: DateTime<Utc>,
    pub shared: Arc<ReceiverShared>,
    pub decompressor: DecompressorState,
}

impl ReceiverState {
    pub fn new(conn: StreamConn, client_ip: String, client_port: String) -> Self {
        LIVE_RECEIVERS.fetch_add(1, Ordering::Relaxed);
        Self {
            conn,
            client_ip,
            client_port,
            key: String::new(),
            hostname: String::new(),
            registry_hostname: String::new(),
            machine_guid: String::new(),
            os: String::new(),
            timezone: String::new(),
            abbrev_timezone: String::new(),
            utc_offset: 0,
            program_name: String::new(),
            program_version: String::new(),
            hops: 1,
            update_every: 1,
            capabilities: Capabilities::empty(),
            config: None,
            system_info: Some(SystemInfo::default()),
            connected_since: Utc::now(),
            shared: Arc::new(ReceiverShared::new()),
            decompressor: DecompressorState::new(),
        }
    }
}

impl Drop for ReceiverState {
    fn drop(&mut self) {
        self.conn.close();
        LIVE_RECEIVERS.fetch_sub(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Handshake parameter parsing
// ---------------------------------------------------------------------------

/// Decode the handshake query string into the receiver state.
///
/// Pairs are `name=value` separated by `&` (consecutive separators
/// collapse). Identity fields keep their first occurrence; unknown names go
/// to the system-info bag; names the bag refuses are logged unused.
pub fn parse_stream_request(state: &mut ReceiverState, query: &str, user_agent: Option<&str>) {
    let mut caps: Option<Capabilities> = None;
    let mut system_info = state.system_info.take().unwrap_or_default();

    for pair in query.split('&').filter(|s| !s.is_empty()) {
        let (raw_name, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
        let name = percent_decode(raw_name);
        let value = percent_decode(raw_value);

        match name.as_str() {
            "key" => set_first(&mut state.key, value),
            "hostname" => set_first(&mut state.hostname, value),
            "registry_hostname" => set_first(&mut state.registry_hostname, value),
            "machine_guid" => set_first(&mut state.machine_guid, value),
            "os" => set_first(&mut state.os, value),
            "timezone" => set_first(&mut state.timezone, value),
            "abbrev_timezone" => set_first(&mut state.abbrev_timezone, value),
            // Overrides on every occurrence.
            "update_every" => {
                if let Ok(v) = value.parse::<i64>() {
                    state.update_every = v;
                }
            }
            "utc_offset" => {
                if let Ok(v) = value.parse::<i32>() {
                    state.utc_offset = v;
                }
            }
            "hops" => {
                if let Ok(v) = value.parse::<i16>() {
                    state.hops = v;
                }
                system_info.set("hops", &value);
            }
            "ml_capable" | "ml_enabled" | "mc_version" => {
                if value.parse::<u64>().is_ok() {
                    system_info.set(&name, &value);
                } else {
                    debug!(name = %name, value = %value, "ignoring non-numeric parameter");
                }
            }
            "ver" => {
                if caps.is_none() {
                    if let Ok(v) = value.parse::<u32>() {
                        caps = Some(Capabilities::for_version(v));
                    }
                }
            }
            "NETDATA_PROTOCOL_VERSION" => {
                if caps.is_none() {
                    caps = Some(Capabilities::for_version(1));
                }
            }
            other => {
                let stored = match other.strip_prefix("NETDATA_SYSTEM_OS_") {
                    Some(rest) => format!("NETDATA_HOST_OS_{rest}"),
                    None => other.to_owned(),
                };
                if !system_info.set(&stored, &value) {
                    debug!(name = %stored, "unused parameter");
                }
            }
        }
    }

    state.capabilities = caps.unwrap_or_else(|| Capabilities::for_version(0));
    if state.registry_hostname.is_empty() {
        state.registry_hostname = state.hostname.clone();
    }
    if let Some(ua) = user_agent {
        match ua.split_once('/') {
            Some((name, version)) => {
                state.program_name = name.trim().to_owned();
                state.program_version = version.trim().to_owned();
            }
            None => state.program_name = ua.trim().to_owned(),
        }
    }
    state.system_info = Some(system_info);
}

fn set_first(slot: &mut String, value: String) {
    if slot.is_empty() {
        *slot = value;
    }
}

/// Percent-decoding for one query-string token; `+` becomes a space and
/// malformed escapes pass through literally.
pub fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi * 16 + lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stream_protocol::tokens;

    fn parsed(query: &str, user_agent: Option<&str>) -> ReceiverState {
        let mut state =
            ReceiverState::new(StreamConn::Closed, "10.0.0.9".into(), "40123".into());
        parse_stream_request(&mut state, query, user_agent);
        state
    }

    #[test]
    fn identity_fields_keep_the_first_occurrence() {
        let state = parsed(
            "key=k1&key=k2&hostname=alpha&hostname=beta&machine_guid=g1&machine_guid=g2\
             &os=linux&os=freebsd&timezone=UTC&timezone=CET&abbrev_timezone=U\
             &abbrev_timezone=C&registry_hostname=reg1&registry_hostname=reg2",
            None,
        );
        assert_eq!(state.key, "k1");
        assert_eq!(state.hostname, "alpha");
        assert_eq!(state.machine_guid, "g1");
        assert_eq!(state.os, "linux");
        assert_eq!(state.timezone, "UTC");
        assert_eq!(state.abbrev_timezone, "U");
        assert_eq!(state.registry_hostname, "reg1");
    }

    #[test]
    fn non_identity_duplicates_silently_override() {
        let state = parsed("update_every=2&update_every=5&utc_offset=3600&utc_offset=-7200", None);
        assert_eq!(state.update_every, 5);
        assert_eq!(state.utc_offset, -7200);
    }

    #[test]
    fn capabilities_resolve_from_ver_once() {
        let state = parsed("ver=8&ver=2", None);
        assert_eq!(state.capabilities, Capabilities::for_version(8));
    }

    #[test]
    fn capabilities_default_to_version_zero_when_absent() {
        let state = parsed("hostname=h", None);
        assert_eq!(state.capabilities, Capabilities::for_version(0));
        assert_ne!(state.capabilities, Capabilities::empty());
    }

    #[test]
    fn legacy_protocol_version_parameter_maps_to_version_one() {
        let state = parsed("NETDATA_PROTOCOL_VERSION=1", None);
        assert_eq!(state.capabilities, Capabilities::for_version(1));
        assert_eq!(state.capabilities.initial_prompt(), tokens::PROMPT_V1);

        // `ver` wins when it comes first.
        let state = parsed("ver=5&NETDATA_PROTOCOL_VERSION=1", None);
        assert_eq!(state.capabilities, Capabilities::for_version(5));
    }

    #[test]
    fn legacy_system_os_names_are_rewritten_to_host_os() {
        let state = parsed("NETDATA_SYSTEM_OS_NAME=Debian&NETDATA_SYSTEM_OS_ID=debian", None);
        let info = state.system_info.as_ref().unwrap();
        assert_eq!(info.get("NETDATA_HOST_OS_NAME"), Some("Debian"));
        assert_eq!(info.get("NETDATA_HOST_OS_ID"), Some("debian"));
        assert_eq!(info.get("NETDATA_SYSTEM_OS_NAME"), None);
    }

    #[test]
    fn hops_lands_in_state_and_system_info() {
        let state = parsed("hops=3", None);
        assert_eq!(state.hops, 3);
        assert_eq!(state.system_info.as_ref().unwrap().get("hops"), Some("3"));
    }

    #[test]
    fn ml_parameters_require_numbers() {
        let state = parsed("ml_capable=1&ml_enabled=0&mc_version=2&ml_capable=x", None);
        let info = state.system_info.as_ref().unwrap();
        assert_eq!(info.get("ml_capable"), Some("1"));
        assert_eq!(info.get("ml_enabled"), Some("0"));
        assert_eq!(info.get("mc_version"), Some("2"));
    }

    #[test]
    fn unknown_names_are_dropped_not_stored() {
        let state = parsed("frobnicate=1&NETDATA_HOST_IS_K8S_NODE=false", None);
        let info = state.system_info.as_ref().unwrap();
        assert_eq!(info.get("frobnicate"), None);
        assert_eq!(info.get("NETDATA_HOST_IS_K8S_NODE"), Some("false"));
    }

    #[test]
    fn consecutive_separators_collapse() {
        let state = parsed("&&hostname=h&&&key=k&&", None);
        assert_eq!(state.hostname, "h");
        assert_eq!(state.key, "k");
    }

    #[test]
    fn registry_hostname_defaults_to_hostname() {
        let state = parsed("hostname=alpha", None);
        assert_eq!(state.registry_hostname, "alpha");

        let state = parsed("hostname=alpha&registry_hostname=display", None);
        assert_eq!(state.registry_hostname, "display");
    }

    #[test]
    fn user_agent_splits_into_program_name_and_version() {
        let state = parsed("", Some("child-agent/1.42.0"));
        assert_eq!(state.program_name, "child-agent");
        assert_eq!(state.program_version, "1.42.0");

        let state = parsed("", Some("curl"));
        assert_eq!(state.program_name, "curl");
        assert_eq!(state.program_version, "");
    }

    #[test]
    fn percent_decoding_applies_to_names_and_values() {
        let state = parsed("hostname=my%20host&timezone=Europe%2FBerlin", None);
        assert_eq!(state.hostname, "my host");
        assert_eq!(state.timezone, "Europe/Berlin");
        assert_eq!(percent_decode("a+b%3d"), "a b=");
        assert_eq!(percent_decode("bad%zz"), "bad%zz");
        assert_eq!(percent_decode("trail%2"), "trail%2");
    }

    #[test]
    fn receiver_counters_track_construction_and_drop() {
        // Other tests in this binary create receivers concurrently, so only
        // directional claims are safe here.
        let alive = ReceiverState::new(StreamConn::Closed, "a".into(), "1".into());
        assert!(live_receivers() >= 1);
        assert!(receiver_buffer_bytes() >= COMPRESSED_CHUNK_SIZE);
        assert_eq!(alive.decompressor.buffer.len(), COMPRESSED_CHUNK_SIZE);
        drop(alive);
    }

    #[tokio::test]
    async fn shared_block_signals_and_waits_for_exit() {
        let shared = Arc::new(ReceiverShared::new());
        assert!(!shared.should_stop());

        shared.signal_stop(ExitReason::StaleReceiver);
        assert!(shared.should_stop());
        assert_eq!(shared.exit_reason(), Some(ExitReason::StaleReceiver));

        // First reason sticks.
        shared.set_exit_reason(ExitReason::Timeout);
        assert_eq!(shared.exit_reason(), Some(ExitReason::StaleReceiver));

        // Exit announced before the wait still completes it (stored permit).
        shared.mark_exited();
        assert!(shared.wait_exited(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn wait_exited_times_out_when_the_worker_stays() {
        let shared = Arc::new(ReceiverShared::new());
        assert!(!shared.wait_exited(Duration::from_millis(20)).await);
    }
}
