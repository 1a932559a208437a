//! Process-wide host registry.
//!
//! One `Host` per known child machine identity, each with a single receiver
//! slot. The slot and the receiver's host form a short ownership cycle;
//! only the registry's attach/detach operations may create or break it, and
//! neither side ever frees the other.
//!
//! Lock discipline: the registry map lock covers lookup and insert only;
//! the per-host slot mutex covers a handful of instructions and is never
//! held across socket I/O. Classifying a previous receiver happens under
//! both; signaling and waiting for it happens after both are released.

use crate::clock::monotonic_secs;
use crate::config::{ReceiverConfig, STALE_RECEIVER_SECS};
use crate::receiver::{ReceiverShared, SystemInfo};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Hosts
// ---------------------------------------------------------------------------

/// Everything the binder knows about a child when it finds or creates the
/// host entry.
#[derive(Debug, Clone)]
pub struct HostIdentity {
    pub machine_guid: Uuid,
    pub hostname: String,
    pub registry_hostname: String,
    pub os: String,
    pub timezone: String,
    pub abbrev_timezone: String,
    pub utc_offset: i32,
    pub program_name: String,
    pub program_version: String,
    pub config: ReceiverConfig,
}

#[derive(Debug, Clone)]
struct HostMeta {
    hostname: String,
    registry_hostname: String,
    os: String,
    timezone: String,
    abbrev_timezone: String,
    utc_offset: i32,
    program_name: String,
    program_version: String,
    config: ReceiverConfig,
}

/// Reconnection state of this host's upstream sender. Handoff resets it so
/// a fresh child connection restarts the forwarding pipeline from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Idle,
    Preparing,
}

/// What the host's receiver slot holds while a connection is attached.
pub struct ReceiverHandle {
    pub shared: Arc<ReceiverShared>,
    pub client_ip: String,
    pub client_port: String,
    pub connected_since: DateTime<Utc>,
}

pub struct Host {
    pub machine_guid: Uuid,
    meta: Mutex<HostMeta>,
    archived: AtomicBool,
    pending_context_load: AtomicBool,
    ephemeral: AtomicBool,
    system_info: Mutex<SystemInfo>,
    upstream: Mutex<UpstreamState>,
    receiver: Mutex<Option<ReceiverHandle>>,
}

impl Host {
    fn new(identity: HostIdentity) -> Self {
        Self {
            machine_guid: identity.machine_guid,
            meta: Mutex::new(HostMeta {
                hostname: identity.hostname,
                registry_hostname: identity.registry_hostname,
                os: identity.os,
                timezone: identity.timezone,
                abbrev_timezone: identity.abbrev_timezone,
                utc_offset: identity.utc_offset,
                program_name: identity.program_name,
                program_version: identity.program_version,
                config: identity.config,
            }),
            archived: AtomicBool::new(false),
            pending_context_load: AtomicBool::new(false),
            ephemeral: AtomicBool::new(false),
            system_info: Mutex::new(SystemInfo::default()),
            upstream: Mutex::new(UpstreamState::Idle),
            receiver: Mutex::new(None),
        }
    }

    fn update_meta(&self, identity: HostIdentity) {
        let mut meta = self.meta.lock().unwrap_or_else(PoisonError::into_inner);
        *meta = HostMeta {
            hostname: identity.hostname,
            registry_hostname: identity.registry_hostname,
            os: identity.os,
            timezone: identity.timezone,
            abbrev_timezone: identity.abbrev_timezone,
            utc_offset: identity.utc_offset,
            program_name: identity.program_name,
            program_version: identity.program_version,
            config: identity.config,
        };
    }

    pub fn hostname(&self) -> String {
        self.meta
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .hostname
            .clone()
    }

    pub fn receiver_config(&self) -> ReceiverConfig {
        self.meta
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .config
            .clone()
    }

    pub fn is_archived(&self) -> bool {
        self.archived.load(Ordering::Acquire)
    }

    pub fn set_archived(&self, value: bool) {
        self.archived.store(value, Ordering::Release);
    }

    pub fn pending_context_load(&self) -> bool {
        self.pending_context_load.load(Ordering::Acquire)
    }

    pub fn set_pending_context_load(&self, value: bool) {
        self.pending_context_load.store(value, Ordering::Release);
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral.load(Ordering::Acquire)
    }

    pub fn set_ephemeral(&self, value: bool) {
        self.ephemeral.store(value, Ordering::Release);
    }

    /// Consume the system info a child reported. Ownership moves to the
    /// host; the caller must not read its copy again.
    pub fn set_system_info(&self, info: SystemInfo) {
        *self
            .system_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = info;
    }

    pub fn system_info_len(&self) -> usize {
        self.system_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn upstream_state(&self) -> UpstreamState {
        *self.upstream.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_upstream_state(&self, state: UpstreamState) {
        *self.upstream.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Attach a receiver to the slot. Fails when another receiver attached
    /// meanwhile; the slot never holds two.
    pub fn attach_receiver(&self, handle: ReceiverHandle) -> bool {
        let mut slot = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(handle);
        true
    }

    /// Detach, but only if the slot still holds `shared`. A worker tearing
    /// down must not evict the receiver that preempted it.
    pub fn detach_receiver(&self, shared: &Arc<ReceiverShared>) -> bool {
        let mut slot = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(handle) if Arc::ptr_eq(&handle.shared, shared) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    pub fn has_receiver(&self) -> bool {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn receiver_shared(&self) -> Option<Arc<ReceiverShared>> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|h| Arc::clone(&h.shared))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Outcome of looking at a host's receiver slot before admission.
pub enum DuplicateDecision {
    NoReceiver,
    /// A receiver is attached and spoke within the staleness window.
    Working { age: i64 },
    /// A receiver is attached but silent for too long; it may be preempted.
    Stale {
        age: i64,
        shared: Arc<ReceiverShared>,
    },
}

/// A deferred cloud node-state notification (the cloud client drains these).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingNodeUpdate {
    pub machine_guid: Uuid,
    pub not_before: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum HostCreateError {
    #[error("cannot create a host without a hostname")]
    EmptyHostname,
    #[error("cannot create a host with a nil machine identity")]
    NilMachineGuid,
}

pub struct Registry {
    hosts: RwLock<HashMap<Uuid, Arc<Host>>>,
    is_parent: AtomicBool,
    accepting_children: AtomicBool,
    pending_updates: Mutex<Vec<PendingNodeUpdate>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            is_parent: AtomicBool::new(false),
            accepting_children: AtomicBool::new(true),
            pending_updates: Mutex::new(Vec::new()),
        }
    }

    pub async fn lookup(&self, machine_guid: &Uuid) -> Option<Arc<Host>> {
        self.hosts.read().await.get(machine_guid).cloned()
    }

    pub async fn host_count(&self) -> usize {
        self.hosts.read().await.len()
    }

    /// Classify the previous receiver for a machine identity, holding the
    /// registry lock only long enough to look. Archived hosts count as
    /// absent.
    pub async fn classify_existing(&self, machine_guid: &Uuid) -> DuplicateDecision {
        let hosts = self.hosts.read().await;
        let Some(host) = hosts.get(machine_guid) else {
            return DuplicateDecision::NoReceiver;
        };
        if host.is_archived() {
            return DuplicateDecision::NoReceiver;
        }
        let slot = host
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            None => DuplicateDecision::NoReceiver,
            Some(handle) => {
                let age = monotonic_secs() - handle.shared.last_msg_secs();
                if age < STALE_RECEIVER_SECS {
                    DuplicateDecision::Working { age }
                } else {
                    DuplicateDecision::Stale {
                        age,
                        shared: Arc::clone(&handle.shared),
                    }
                }
            }
        }
    }

    /// Find the host for a machine identity, creating it on first sight.
    /// An existing entry gets its metadata refreshed and loses its archived
    /// mark; creation is deliberately deferred to bind time so rejected
    /// connections never mutate the registry.
    pub async fn find_or_create(
        &self,
        identity: HostIdentity,
    ) -> Result<Arc<Host>, HostCreateError> {
        if identity.hostname.is_empty() {
            return Err(HostCreateError::EmptyHostname);
        }
        if identity.machine_guid.is_nil() {
            return Err(HostCreateError::NilMachineGuid);
        }
        let mut hosts = self.hosts.write().await;
        if let Some(host) = hosts.get(&identity.machine_guid) {
            let host = Arc::clone(host);
            host.update_meta(identity);
            host.set_archived(false);
            return Ok(host);
        }
        let host = Arc::new(Host::new(identity));
        hosts.insert(host.machine_guid, Arc::clone(&host));
        Ok(host)
    }

    /// Whether new children may bind at all (false e.g. while storage tiers
    /// are backfilling).
    pub fn children_should_be_accepted(&self) -> bool {
        self.accepting_children.load(Ordering::Acquire)
    }

    pub fn set_accepting_children(&self, value: bool) {
        self.accepting_children.store(value, Ordering::Release);
    }

    pub fn is_parent(&self) -> bool {
        self.is_parent.load(Ordering::Acquire)
    }

    pub fn set_is_parent(&self, value: bool) {
        self.is_parent.store(value, Ordering::Release);
    }

    /// Queue a cloud node-state notification to run no sooner than
    /// `delay_secs` from now.
    pub fn schedule_node_state_update(&self, machine_guid: Uuid, delay_secs: i64) {
        self.pending_updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PendingNodeUpdate {
                machine_guid,
                not_before: monotonic_secs() + delay_secs,
            });
    }

    /// Drain the notifications whose delay has elapsed.
    pub fn take_due_node_updates(&self, now: i64) -> Vec<PendingNodeUpdate> {
        let mut pending = self
            .pending_updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (due, later): (Vec<_>, Vec<_>) =
            pending.drain(..).partition(|u| u.not_before <= now);
        *pending = later;
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::ReceiverState;
    use crate::socket::StreamConn;

    fn identity(guid: Uuid, hostname: &str) -> HostIdentity {
        HostIdentity {
            machine_guid: guid,
            hostname: hostname.to_owned(),
            registry_hostname: hostname.to_owned(),
            os: "linux".to_owned(),
            timezone: "UTC".to_owned(),
            abbrev_timezone: "UTC".to_owned(),
            utc_offset: 0,
            program_name: "agent".to_owned(),
            program_version: "1.0".to_owned(),
            config: crate::config::load_config_from_str("schema_version = 1")
                .unwrap()
                .defaults,
        }
    }

    fn handle() -> (ReceiverHandle, Arc<ReceiverShared>) {
        let state = ReceiverState::new(StreamConn::Closed, "10.0.0.1".into(), "999".into());
        let shared = Arc::clone(&state.shared);
        (
            ReceiverHandle {
                shared: Arc::clone(&shared),
                client_ip: state.client_ip.clone(),
                client_port: state.client_port.clone(),
                connected_since: state.connected_since,
            },
            shared,
        )
    }

    #[tokio::test]
    async fn find_or_create_reuses_and_refreshes_existing_hosts() {
        let registry = Registry::new();
        let guid = Uuid::new_v4();

        let first = registry.find_or_create(identity(guid, "alpha")).await.unwrap();
        assert_eq!(registry.host_count().await, 1);

        first.set_archived(true);
        let second = registry.find_or_create(identity(guid, "renamed")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.hostname(), "renamed");
        assert!(!second.is_archived());
        assert_eq!(registry.host_count().await, 1);
    }

    #[tokio::test]
    async fn find_or_create_rejects_unusable_identities() {
        let registry = Registry::new();
        let mut id = identity(Uuid::new_v4(), "");
        assert!(matches!(
            registry.find_or_create(id.clone()).await,
            Err(HostCreateError::EmptyHostname)
        ));
        id.hostname = "ok".to_owned();
        id.machine_guid = Uuid::nil();
        assert!(matches!(
            registry.find_or_create(id).await,
            Err(HostCreateError::NilMachineGuid)
        ));
        assert_eq!(registry.host_count().await, 0);
    }

    #[tokio::test]
    async fn receiver_slot_holds_at_most_one() {
        let registry = Registry::new();
        let host = registry
            .find_or_create(identity(Uuid::new_v4(), "alpha"))
            .await
            .unwrap();

        let (first, first_shared) = handle();
        let (second, second_shared) = handle();

        assert!(host.attach_receiver(first));
        assert!(!host.attach_receiver(second));

        // Detach is guarded by pointer identity: the loser cannot evict the
        // winner.
        assert!(!host.detach_receiver(&second_shared));
        assert!(host.has_receiver());
        assert!(host.detach_receiver(&first_shared));
        assert!(!host.has_receiver());
    }

    #[tokio::test]
    async fn classification_uses_the_staleness_window() {
        let registry = Registry::new();
        let guid = Uuid::new_v4();
        let host = registry.find_or_create(identity(guid, "alpha")).await.unwrap();

        assert!(matches!(
            registry.classify_existing(&guid).await,
            DuplicateDecision::NoReceiver
        ));

        let (h, shared) = handle();
        assert!(host.attach_receiver(h));

        shared.set_last_msg_secs(monotonic_secs());
        assert!(matches!(
            registry.classify_existing(&guid).await,
            DuplicateDecision::Working { .. }
        ));

        // Exactly at the boundary the receiver counts as stale.
        shared.set_last_msg_secs(monotonic_secs() - STALE_RECEIVER_SECS);
        match registry.classify_existing(&guid).await {
            DuplicateDecision::Stale { age, .. } => assert!(age >= STALE_RECEIVER_SECS),
            _ => panic!("expected a stale classification"),
        }

        // Archived hosts are treated as absent, receiver or not.
        host.set_archived(true);
        assert!(matches!(
            registry.classify_existing(&guid).await,
            DuplicateDecision::NoReceiver
        ));
    }

    #[tokio::test]
    async fn unknown_machines_classify_as_absent() {
        let registry = Registry::new();
        assert!(matches!(
            registry.classify_existing(&Uuid::new_v4()).await,
            DuplicateDecision::NoReceiver
        ));
    }

    #[test]
    fn node_state_updates_respect_their_delay() {
        let registry = Registry::new();
        let guid = Uuid::new_v4();
        let now = monotonic_secs();

        registry.schedule_node_state_update(guid, 300);
        assert!(registry.take_due_node_updates(now).is_empty());

        let due = registry.take_due_node_updates(now + 301);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].machine_guid, guid);
        // Drained once, gone.
        assert!(registry.take_due_node_updates(now + 301).is_empty());
    }
}
