// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client-side notification routing.
//!
//! The dispatcher hands every inbound NOTIFICATION to the consumer,
//! which routes it to the handler installed for its event id. Handlers
//! are installed by `subscribe_eventgroup` on the SD engine.

use crate::protocol::message::{Message, MessageType};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Callback receiving `(event_id, payload)` for each notification.
pub type NotifyHandler = Arc<dyn Fn(u16, &[u8]) + Send + Sync>;

/// Routes notifications to per-event handlers.
#[derive(Default)]
pub struct EventConsumer {
    handlers: Mutex<HashMap<u16, NotifyHandler>>,
    unrouted: AtomicU64,
}

impl EventConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the handler for one event id, replacing any previous one.
    pub fn insert(&self, event_id: u16, handler: NotifyHandler) {
        self.handlers.lock().insert(event_id, handler);
    }

    /// Install one handler for every event id in `event_ids`.
    pub fn insert_many(&self, event_ids: &[u16], handler: NotifyHandler) {
        let mut handlers = self.handlers.lock();
        for &id in event_ids {
            handlers.insert(id, Arc::clone(&handler));
        }
    }

    pub fn remove(&self, event_id: u16) {
        self.handlers.lock().remove(&event_id);
    }

    /// Route one inbound notification. Non-notifications and events
    /// without a handler are counted and dropped.
    pub fn handle_notification(&self, msg: &Message) {
        if msg.message_type != MessageType::Notification {
            return;
        }
        let event_id = msg.message_id.method_id;
        let handler = self.handlers.lock().get(&event_id).cloned();
        match handler {
            Some(handler) => handler(event_id, &msg.payload),
            None => {
                self.unrouted.fetch_add(1, Ordering::Relaxed);
                log::debug!("[events] no handler for event 0x{:04x}", event_id);
            }
        }
    }

    /// Notifications that arrived with no handler installed.
    pub fn unrouted_count(&self) -> u64 {
        self.unrouted.load(Ordering::Relaxed)
    }
}
