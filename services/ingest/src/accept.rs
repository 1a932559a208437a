//! The connection-acceptance flow.
//!
//! parse → admission → duplicate check → takeover → host bind →
//! negotiate → handoff. Rejections before takeover answer over HTTP and
//! never touch the registry; once the socket is ours, failures write an
//! in-band error token (best effort) and tear the receiver down.

use crate::admission::{self, Admission, BusyReason};
use crate::negotiate;
use crate::receiver::{parse_stream_request, ReceiverState};
use crate::registry::{DuplicateDecision, HostIdentity, ReceiverHandle, UpstreamState};
use crate::socket::StreamConn;
use crate::state::AppState;
use crate::web::{StreamRequest, WebClient};
use crate::workers::BoundReceiver;
use crate::MSGID_STREAM_FROM_CHILD;
use std::sync::Arc;
use std::time::Duration;
use stream_protocol::{tokens, ExitReason};
use tracing::{error, info, warn};
use uuid::Uuid;

/// How long a preempting connection waits for the stale receiver to leave.
const STALE_STOP_WAIT: Duration = Duration::from_secs(5);

/// Delay before the cloud learns about the (re)connected node.
const NODE_STATE_UPDATE_DELAY_SECS: i64 = 300;

/// Drive one streaming handshake to completion. Returns the HTTP status
/// recorded in the access log; after takeover it is informational only.
pub async fn handle_stream_request(
    app: &Arc<AppState>,
    mut client: WebClient,
    request: &StreamRequest,
) -> u16 {
    let mut state = ReceiverState::new(
        StreamConn::Closed,
        client.client_ip.clone(),
        client.client_port.clone(),
    );
    parse_stream_request(&mut state, &request.query, request.user_agent.as_deref());

    match admission::admit(
        &app.config,
        app.accepting_streams(),
        app.localhost_guid,
        &app.limiter,
        &state,
    ) {
        Admission::Denied(reason) => {
            warn!(
                client_ip = %state.client_ip,
                client_port = %state.client_port,
                hostname = %state.hostname,
                reason = reason.as_str(),
                "stream connection not permitted"
            );
            let _ = client.respond(401, tokens::NOT_PERMITTED).await;
            access_log(&state, 401, "not_permitted");
            401
        }
        Admission::Busy(reason) => {
            if let BusyReason::RateLimited { wait_secs } = reason {
                warn!(
                    client_ip = %state.client_ip,
                    hostname = %state.hostname,
                    wait_secs,
                    "stream connection rate limited, retry in {wait_secs}s"
                );
            } else {
                warn!(
                    client_ip = %state.client_ip,
                    hostname = %state.hostname,
                    reason = reason.as_str(),
                    "stream connection refused"
                );
            }
            let _ = client.respond(503, tokens::BUSY_TRY_LATER).await;
            access_log(&state, 503, reason.as_str());
            503
        }
        Admission::SameLocalhost => {
            // Takeover even though the connection is doomed: the child
            // expects its error token on the stream, not in an HTTP body.
            if let Some(conn) = client.take_over().await {
                state.conn = conn;
            }
            let _ = state
                .conn
                .send_token(tokens::SAME_LOCALHOST, error_send_timeout(app))
                .await;
            warn!(
                client_ip = %state.client_ip,
                hostname = %state.hostname,
                "child presented this node's own machine identity"
            );
            access_log(&state, 200, "same_localhost");
            200
        }
        Admission::Granted { key, machine } => {
            accept_granted(app, client, state, key, machine).await
        }
    }
}

async fn accept_granted(
    app: &Arc<AppState>,
    mut client: WebClient,
    mut state: ReceiverState,
    key: Uuid,
    machine: Uuid,
) -> u16 {
    // Resolve the previous receiver, if any, before committing to anything.
    match app.registry.classify_existing(&machine).await {
        DuplicateDecision::NoReceiver => {}
        DuplicateDecision::Working { age } => {
            warn!(
                client_ip = %state.client_ip,
                hostname = %state.hostname,
                age,
                signaled = false,
                "host already has a working receiver"
            );
            let _ = client.respond(409, tokens::ALREADY_STREAMING).await;
            access_log(&state, 409, "already_streaming");
            return 409;
        }
        DuplicateDecision::Stale { age, shared } => {
            shared.signal_stop(ExitReason::StaleReceiver);
            if shared.wait_exited(STALE_STOP_WAIT).await {
                info!(
                    client_ip = %state.client_ip,
                    hostname = %state.hostname,
                    age,
                    "stale receiver preempted"
                );
            } else {
                warn!(
                    client_ip = %state.client_ip,
                    hostname = %state.hostname,
                    age,
                    signaled = true,
                    "stale receiver did not exit in time"
                );
                let _ = client.respond(409, tokens::ALREADY_STREAMING).await;
                access_log(&state, 409, "already_streaming");
                return 409;
            }
        }
    }

    // Takeover: from here on the transport is ours and HTTP statuses only
    // feed the access log.
    match client.take_over().await {
        Some(conn) => state.conn = conn,
        None => {
            error!(client_ip = %state.client_ip, "web client lost its connection before takeover");
            access_log(&state, 500, "internal_error");
            return 500;
        }
    }

    let receiver_config = app.config.resolve_receiver(&key, &machine);
    state.config = Some(receiver_config.clone());

    let host = match app
        .registry
        .find_or_create(HostIdentity {
            machine_guid: machine,
            hostname: state.hostname.clone(),
            registry_hostname: state.registry_hostname.clone(),
            os: state.os.clone(),
            timezone: state.timezone.clone(),
            abbrev_timezone: state.abbrev_timezone.clone(),
            utc_offset: state.utc_offset,
            program_name: state.program_name.clone(),
            program_version: state.program_version.clone(),
            config: receiver_config.clone(),
        })
        .await
    {
        Ok(host) => host,
        Err(e) => {
            error!(
                client_ip = %state.client_ip,
                hostname = %state.hostname,
                error = %e,
                "internal_server_error"
            );
            let _ = state
                .conn
                .send_token(tokens::INTERNAL_ERROR, error_send_timeout(app))
                .await;
            access_log(&state, 500, "internal_error");
            return 500;
        }
    };

    // The host exists; the system info belongs to it from this point on.
    if let Some(info) = state.system_info.take() {
        host.set_system_info(info);
    }

    let not_ready = if host.pending_context_load() {
        Some("pending_context_load")
    } else if !app.registry.children_should_be_accepted() {
        Some("children_not_accepted")
    } else {
        None
    };
    if let Some(cause) = not_ready {
        warn!(
            client_ip = %state.client_ip,
            hostname = %state.hostname,
            cause,
            "initialization"
        );
        let _ = state
            .conn
            .send_token(tokens::INITIALIZATION, error_send_timeout(app))
            .await;
        access_log(&state, 503, "initialization");
        return 503;
    }

    if !host.attach_receiver(ReceiverHandle {
        shared: Arc::clone(&state.shared),
        client_ip: state.client_ip.clone(),
        client_port: state.client_port.clone(),
        connected_since: state.connected_since,
    }) {
        warn!(
            client_ip = %state.client_ip,
            hostname = %state.hostname,
            "duplicate_receiver: another receiver attached meanwhile"
        );
        let _ = state
            .conn
            .send_token(tokens::ALREADY_STREAMING, error_send_timeout(app))
            .await;
        access_log(&state, 409, "already_streaming");
        return 409;
    }

    // Attachment is in place; the rest is blocking work: switch the socket,
    // greet, and hand the receiver to its worker.
    let shared = Arc::clone(&state.shared);
    let hostname = state.hostname.clone();
    let client_ip = state.client_ip.clone();
    let client_port = state.client_port.clone();
    let settings = app.config.stream.clone();
    let tail_app = Arc::clone(app);
    let tail_host = Arc::clone(&host);

    let tail = tokio::task::spawn_blocking(move || {
        if let Err(e) = negotiate::negotiate_and_greet(&mut state, &settings) {
            tail_host.detach_receiver(&state.shared);
            state.shared.set_exit_reason(ExitReason::CantReply);
            state.shared.mark_exited();
            return Err(e.to_string());
        }

        tail_app.registry.set_is_parent(true);
        tail_app
            .registry
            .schedule_node_state_update(machine, NODE_STATE_UPDATE_DELAY_SECS);
        if state.config.as_ref().is_some_and(|c| c.ephemeral) {
            tail_host.set_ephemeral(true);
        }
        tail_host.set_upstream_state(UpstreamState::Preparing);

        tail_app
            .workers
            .enqueue(BoundReceiver {
                state,
                host: Arc::clone(&tail_host),
            })
            .map_err(|e| e.to_string())
    })
    .await;

    match tail {
        Ok(Ok(())) => {
            info!(
                client_ip = %client_ip,
                client_port = %client_port,
                hostname = %hostname,
                msg_id = MSGID_STREAM_FROM_CHILD,
                "child connected"
            );
            access_log_fields(&client_ip, &client_port, &hostname, 200, "connected");
            200
        }
        Ok(Err(e)) => {
            warn!(
                client_ip = %client_ip,
                hostname = %hostname,
                error = %e,
                "cant_reply"
            );
            access_log_fields(&client_ip, &client_port, &hostname, 500, "cant_reply");
            500
        }
        Err(join_error) => {
            error!(
                client_ip = %client_ip,
                hostname = %hostname,
                error = %join_error,
                "acceptance tail failed"
            );
            host.detach_receiver(&shared);
            access_log_fields(&client_ip, &client_port, &hostname, 500, "internal_error");
            500
        }
    }
}

fn error_send_timeout(app: &AppState) -> Duration {
    Duration::from_secs(app.config.stream.error_send_timeout_secs)
}

fn access_log(state: &ReceiverState, status: u16, result: &str) {
    access_log_fields(
        &state.client_ip,
        &state.client_port,
        &state.hostname,
        status,
        result,
    );
}

fn access_log_fields(client_ip: &str, client_port: &str, hostname: &str, status: u16, result: &str) {
    info!(
        target: "access",
        status,
        result,
        client_ip = %client_ip,
        client_port = %client_port,
        hostname = %hostname,
        msg_id = MSGID_STREAM_FROM_CHILD,
        "stream request"
    );
}
