// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RPC server: method registry and request dispatch.

use crate::protocol::message::{Message, MessageType, ReturnCode};
use crate::rpc::RpcError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A registered method implementation.
///
/// Receives the request payload, returns the response payload or a
/// typed failure that maps onto a wire return code.
pub type MethodHandler =
    Arc<dyn Fn(&[u8]) -> std::result::Result<Vec<u8>, RpcError> + Send + Sync>;

/// Method dispatch for one served service.
pub struct RpcServer {
    service_id: u16,
    interface_version: u8,
    handlers: Mutex<HashMap<u16, MethodHandler>>,
}

impl RpcServer {
    pub fn new(service_id: u16, interface_version: u8) -> Self {
        Self {
            service_id,
            interface_version,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn service_id(&self) -> u16 {
        self.service_id
    }

    /// Register a method. A second registration for the same id is
    /// rejected (returns false) rather than silently replacing.
    pub fn register<F>(&self, method_id: u16, handler: F) -> bool
    where
        F: Fn(&[u8]) -> std::result::Result<Vec<u8>, RpcError> + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.lock();
        if handlers.contains_key(&method_id) {
            log::debug!(
                "[rpc] duplicate registration for method 0x{:04x} rejected",
                method_id
            );
            return false;
        }
        handlers.insert(method_id, Arc::new(handler));
        true
    }

    /// Remove a method. Idempotent: false when nothing was registered.
    pub fn unregister(&self, method_id: u16) -> bool {
        self.handlers.lock().remove(&method_id).is_some()
    }

    pub fn method_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Dispatch one inbound request.
    ///
    /// Returns the message to send back, or `None` for fire-and-forget
    /// requests (and for inbound messages that are not requests at all).
    pub fn handle_request(&self, msg: &Message) -> Option<Message> {
        let fire_and_forget = match msg.message_type {
            MessageType::Request => false,
            MessageType::RequestNoReturn => true,
            MessageType::Unknown(raw) => {
                log::debug!("[rpc] request with unknown type byte 0x{:02x}", raw);
                return Some(msg.response(ReturnCode::WrongMessageType, Vec::new()));
            }
            _ => return None,
        };

        if msg.message_id.service_id != self.service_id {
            return self.refuse(msg, fire_and_forget, ReturnCode::UnknownService);
        }
        if msg.interface_version != self.interface_version {
            return self.refuse(msg, fire_and_forget, ReturnCode::WrongInterfaceVersion);
        }

        // Clone the handler out so user code runs without the lock.
        let handler = self.handlers.lock().get(&msg.message_id.method_id).cloned();
        let handler = match handler {
            Some(h) => h,
            None => {
                log::debug!(
                    "[rpc] unknown method 0x{:04x} on service 0x{:04x}",
                    msg.message_id.method_id,
                    self.service_id
                );
                return self.refuse(msg, fire_and_forget, ReturnCode::UnknownMethod);
            }
        };

        let result = handler(&msg.payload);
        if fire_and_forget {
            return None;
        }
        Some(match result {
            Ok(payload) => msg.response(ReturnCode::Ok, payload),
            Err(e) => msg.response(e.to_return_code(), Vec::new()),
        })
    }

    fn refuse(
        &self,
        msg: &Message,
        fire_and_forget: bool,
        code: ReturnCode,
    ) -> Option<Message> {
        if fire_and_forget {
            None
        } else {
            Some(msg.response(code, Vec::new()))
        }
    }
}
