// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RPC client: request issuance, response correlation, deadlines.
//!
//! Each call allocates a session id, records a pending entry keyed by
//! it and submits the REQUEST. The terminal event - response, error,
//! timeout or cancellation - consumes the pending entry, so exactly one
//! of them ever reaches the completion sink.

use crate::config::{RpcConfig, TpConfig};
use crate::error::{Error, Result};
use crate::protocol::message::{Message, MessageId, MessageType, RequestId};
use crate::rpc::{CallOutcome, RpcError};
use crate::session::SessionManager;
use crate::tp::segment::segment_message;
use crate::transport::Transport;
use crossbeam::channel::bounded;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Deadline sweep granularity.
const SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Consumes the call's terminal outcome. Invoked exactly once.
pub type CompletionSink = Box<dyn FnOnce(CallOutcome) + Send + 'static>;

/// Handle to a pending call, usable for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallHandle {
    session_id: u16,
}

struct PendingCall {
    service_id: u16,
    method_id: u16,
    deadline: Instant,
    sink: parking_lot::Mutex<Option<CompletionSink>>,
}

impl PendingCall {
    fn fire(self, outcome: CallOutcome) {
        if let Some(sink) = self.sink.lock().take() {
            sink(outcome);
        }
    }
}

/// Client-side RPC correlator bound to one server endpoint.
pub struct RpcClient {
    client_id: u16,
    interface_version: u8,
    transport: Arc<Transport>,
    server: SocketAddr,
    sessions: Arc<SessionManager>,
    pending: Arc<DashMap<u16, PendingCall>>,
    cfg: RpcConfig,
    tp: TpConfig,
    late_responses: AtomicU64,
    shutdown: Arc<AtomicBool>,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Create a client and start its deadline sweeper.
    pub fn new(
        client_id: u16,
        transport: Arc<Transport>,
        server: SocketAddr,
        cfg: RpcConfig,
        tp: TpConfig,
    ) -> Result<Self> {
        let pending: Arc<DashMap<u16, PendingCall>> = Arc::new(DashMap::new());
        let sessions = Arc::new(SessionManager::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let sweeper = {
            let pending = Arc::clone(&pending);
            let sessions = Arc::clone(&sessions);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("hsip-rpc-sweeper".to_string())
                .spawn(move || sweep_loop(&pending, &sessions, &shutdown))
                .map_err(Error::Network)?
        };

        Ok(Self {
            client_id,
            interface_version: 0x01,
            transport,
            server,
            sessions,
            pending,
            cfg,
            tp,
            late_responses: AtomicU64::new(0),
            shutdown,
            sweeper: parking_lot::Mutex::new(Some(sweeper)),
        })
    }

    pub fn with_interface_version(mut self, version: u8) -> Self {
        self.interface_version = version;
        self
    }

    pub fn client_id(&self) -> u16 {
        self.client_id
    }

    /// Issue a request; `sink` receives the terminal outcome.
    ///
    /// A send failure is itself the terminal event: the sink fires with
    /// `RpcError::Network` and the returned handle is already dead.
    pub fn call_async(
        &self,
        service_id: u16,
        method_id: u16,
        params: &[u8],
        timeout: Option<Duration>,
        sink: CompletionSink,
    ) -> Result<CallHandle> {
        if self.shutdown.load(Ordering::Relaxed) {
            sink(Err(RpcError::Shutdown));
            return Err(Error::State("rpc client shut down"));
        }

        let session_id = self.sessions.create(self.client_id);
        let deadline =
            Instant::now() + timeout.unwrap_or(self.cfg.default_response_timeout);

        let msg = Message {
            message_id: MessageId::new(service_id, method_id),
            request_id: RequestId::new(self.client_id, session_id),
            protocol_version: crate::config::PROTOCOL_VERSION,
            interface_version: self.interface_version,
            message_type: MessageType::Request,
            return_code: crate::protocol::message::ReturnCode::Ok,
            payload: params.to_vec(),
        };

        // Record before sending so a fast response still matches.
        self.pending.insert(
            session_id,
            PendingCall {
                service_id,
                method_id,
                deadline,
                sink: parking_lot::Mutex::new(Some(sink)),
            },
        );

        if let Err(e) = self.submit(&msg) {
            if let Some((_, call)) = self.pending.remove(&session_id) {
                self.sessions.release(session_id);
                call.fire(Err(RpcError::Network(e.to_string())));
            }
            return Ok(CallHandle { session_id });
        }

        log::debug!(
            "[rpc] issued 0x{:04x}/0x{:04x} session=0x{:04x}",
            service_id,
            method_id,
            session_id
        );
        Ok(CallHandle { session_id })
    }

    /// Issue a request and block the caller until the terminal event.
    pub fn call_sync(
        &self,
        service_id: u16,
        method_id: u16,
        params: &[u8],
        timeout: Option<Duration>,
    ) -> CallOutcome {
        let (tx, rx) = bounded(1);
        let sink: CompletionSink = Box::new(move |outcome| {
            let _ = tx.send(outcome);
        });
        if let Err(e) = self.call_async(service_id, method_id, params, timeout, sink) {
            // The sink fired before the error where a terminal event
            // exists (shutdown); otherwise surface the issue directly.
            return rx
                .try_recv()
                .unwrap_or_else(|_| Err(RpcError::Network(e.to_string())));
        }

        // The sweeper guarantees a terminal event at the deadline; the
        // extra slack only covers its granularity.
        let wait = timeout.unwrap_or(self.cfg.default_response_timeout) + SWEEP_INTERVAL * 4;
        match rx.recv_timeout(wait) {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Timeout),
        }
    }

    /// Cancel a pending call. Returns false when the call already
    /// reached its terminal event.
    pub fn cancel(&self, handle: CallHandle) -> bool {
        match self.pending.remove(&handle.session_id) {
            Some((_, call)) => {
                self.sessions.release(handle.session_id);
                call.fire(Err(RpcError::Cancelled));
                log::debug!("[rpc] cancelled session=0x{:04x}", handle.session_id);
                true
            }
            None => false,
        }
    }

    /// Feed an inbound RESPONSE or ERROR message to the correlator.
    ///
    /// Non-matching or late messages are dropped silently.
    pub fn handle_response(&self, msg: &Message) {
        if !matches!(
            msg.message_type,
            MessageType::Response | MessageType::Error
        ) {
            return;
        }
        if msg.request_id.client_id != self.client_id {
            return;
        }

        let session_id = msg.request_id.session_id;
        let matches_call = self
            .pending
            .get(&session_id)
            .map(|call| {
                call.service_id == msg.message_id.service_id
                    && call.method_id == msg.message_id.method_id
            })
            .unwrap_or(false);
        if !matches_call {
            self.late_responses.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "[rpc] dropping unmatched response session=0x{:04x}",
                session_id
            );
            return;
        }

        if let Some((_, call)) = self.pending.remove(&session_id) {
            self.sessions.release(session_id);
            let outcome = match (msg.message_type, msg.return_code) {
                (MessageType::Response, crate::protocol::message::ReturnCode::Ok) => {
                    Ok(msg.payload.clone())
                }
                (_, code) => Err(RpcError::from_return_code(code)),
            };
            call.fire(outcome);
        }
    }

    /// Submit a request, segmenting through TP when oversized.
    fn submit(&self, msg: &Message) -> Result<()> {
        for part in segment_message(msg, &self.tp)? {
            self.transport.send(&part, self.server)?;
        }
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Responses that arrived after their call had terminated.
    pub fn late_response_count(&self) -> u64 {
        self.late_responses.load(Ordering::Relaxed)
    }

    /// Stop the sweeper and fail every pending call with `Shutdown`.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.sweeper.lock().take() {
            let _ = handle.join();
        }
        let keys: Vec<u16> = self.pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, call)) = self.pending.remove(&key) {
                self.sessions.release(key);
                call.fire(Err(RpcError::Shutdown));
            }
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Walk pending calls and fire `Timeout` for any past their deadline.
fn sweep_loop(
    pending: &DashMap<u16, PendingCall>,
    sessions: &SessionManager,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(SWEEP_INTERVAL);

        let now = Instant::now();
        let expired: Vec<u16> = pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        for session_id in expired {
            if let Some((_, call)) = pending.remove(&session_id) {
                sessions.release(session_id);
                log::debug!("[rpc] deadline hit session=0x{:04x}", session_id);
                call.fire(Err(RpcError::Timeout));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::ReturnCode;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;

    fn client() -> (RpcClient, Arc<Transport>) {
        let transport = Arc::new(
            Transport::udp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).unwrap(),
        );
        transport.start().unwrap();
        // Point at ourselves; these tests never expect a real server.
        let server = transport.local_addr();
        let c = RpcClient::new(
            0x1234,
            Arc::clone(&transport),
            server,
            RpcConfig::default(),
            TpConfig::default(),
        )
        .unwrap();
        (c, transport)
    }

    fn collecting_sink(slot: Arc<Mutex<Vec<CallOutcome>>>) -> CompletionSink {
        Box::new(move |outcome| slot.lock().unwrap().push(outcome))
    }

    #[test]
    fn response_completes_call_with_payload() {
        let (client, _t) = client();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let handle = client
            .call_async(
                0x1000,
                0x0001,
                b"in",
                Some(Duration::from_secs(5)),
                collecting_sink(Arc::clone(&outcomes)),
            )
            .unwrap();

        let response = Message {
            message_id: MessageId::new(0x1000, 0x0001),
            request_id: RequestId::new(0x1234, handle.session_id),
            protocol_version: 0x01,
            interface_version: 0x01,
            message_type: MessageType::Response,
            return_code: ReturnCode::Ok,
            payload: b"out".to_vec(),
        };
        client.handle_response(&response);

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.as_slice(), &[Ok(b"out".to_vec())]);
        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn error_response_maps_return_code() {
        let (client, _t) = client();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let handle = client
            .call_async(
                0x1000,
                0x0002,
                b"",
                Some(Duration::from_secs(5)),
                collecting_sink(Arc::clone(&outcomes)),
            )
            .unwrap();

        let mut response = Message::new(
            MessageId::new(0x1000, 0x0002),
            RequestId::new(0x1234, handle.session_id),
            MessageType::Error,
            Vec::new(),
        );
        response.return_code = ReturnCode::UnknownMethod;
        client.handle_response(&response);

        assert_eq!(
            outcomes.lock().unwrap().as_slice(),
            &[Err(RpcError::MethodNotFound)]
        );
    }

    #[test]
    fn deadline_fires_exactly_one_timeout() {
        let (client, _t) = client();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let handle = client
            .call_async(
                0x1000,
                0x0003,
                b"",
                Some(Duration::from_millis(60)),
                collecting_sink(Arc::clone(&outcomes)),
            )
            .unwrap();

        thread::sleep(Duration::from_millis(250));
        assert_eq!(
            outcomes.lock().unwrap().as_slice(),
            &[Err(RpcError::Timeout)]
        );

        // A response after the timeout is dropped silently.
        let response = Message::new(
            MessageId::new(0x1000, 0x0003),
            RequestId::new(0x1234, handle.session_id),
            MessageType::Response,
            Vec::new(),
        );
        client.handle_response(&response);
        assert_eq!(outcomes.lock().unwrap().len(), 1);
        assert_eq!(client.late_response_count(), 1);
    }

    #[test]
    fn cancel_wins_over_later_response() {
        let (client, _t) = client();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let handle = client
            .call_async(
                0x1000,
                0x0004,
                b"",
                Some(Duration::from_secs(5)),
                collecting_sink(Arc::clone(&outcomes)),
            )
            .unwrap();

        assert!(client.cancel(handle));
        assert!(!client.cancel(handle));

        let response = Message::new(
            MessageId::new(0x1000, 0x0004),
            RequestId::new(0x1234, handle.session_id),
            MessageType::Response,
            b"late".to_vec(),
        );
        client.handle_response(&response);

        assert_eq!(
            outcomes.lock().unwrap().as_slice(),
            &[Err(RpcError::Cancelled)]
        );
    }

    #[test]
    fn mismatched_method_does_not_complete() {
        let (client, _t) = client();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let handle = client
            .call_async(
                0x1000,
                0x0005,
                b"",
                Some(Duration::from_secs(5)),
                collecting_sink(Arc::clone(&outcomes)),
            )
            .unwrap();

        // Same session id, different method: not ours.
        let response = Message::new(
            MessageId::new(0x1000, 0x0099),
            RequestId::new(0x1234, handle.session_id),
            MessageType::Response,
            Vec::new(),
        );
        client.handle_response(&response);

        assert!(outcomes.lock().unwrap().is_empty());
        assert_eq!(client.pending_count(), 1);
        assert!(client.cancel(handle));
    }

    #[test]
    fn call_sync_times_out_against_silent_server() {
        let (client, _t) = client();
        let started = Instant::now();
        let outcome = client.call_sync(0x1000, 0x0006, b"", Some(Duration::from_millis(80)));
        assert_eq!(outcome, Err(RpcError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn shutdown_fails_pending_calls() {
        let (client, _t) = client();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        client
            .call_async(
                0x1000,
                0x0007,
                b"",
                Some(Duration::from_secs(30)),
                collecting_sink(Arc::clone(&outcomes)),
            )
            .unwrap();

        client.shutdown();
        assert_eq!(
            outcomes.lock().unwrap().as_slice(),
            &[Err(RpcError::Shutdown)]
        );
    }
}
