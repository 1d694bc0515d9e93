//! Kernel event bus.
//!
//! The scheduler and the module manager announce every observable change
//! (task registration, state transitions, guest ratio updates, module
//! status changes) as an [`Event`] on an [`IpcBus`] built on top of
//! [`tokio::sync::broadcast`].  Attaching a bus is optional: both
//! components work without one.
//!
//! Events are wrapped in [`Arc`] so broadcasting to several subscribers does
//! not clone the payload.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use chimera_kernel::ipc::{IpcBus, Event};
//! # async fn example() {
//! let bus = IpcBus::new(256);
//! let mut rx = bus.subscribe();
//!
//! bus.publish(Event::ModuleRegistered {
//!     module_id: "timer".into(),
//! });
//!
//! let event = rx.recv().await.unwrap();
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::module::ModuleStatus;
use crate::scheduler::{Domain, TaskId, TaskState};

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// An event that flows through the kernel bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// A task was added to the scheduler's registry.
    TaskRegistered {
        task_id: TaskId,
        task_name: String,
        domain: Domain,
        timestamp: DateTime<Utc>,
    },

    /// A task changed state through `update_task_state`.
    TaskStateChanged {
        task_id: TaskId,
        old_state: TaskState,
        new_state: TaskState,
        timestamp: DateTime<Utc>,
    },

    /// The guest-domain selection weight changed.
    GuestRatioAdjusted {
        old_ratio: f64,
        new_ratio: f64,
        /// `true` when recomputed from load, `false` for an explicit value.
        automatic: bool,
    },

    /// A module was accepted by the registry.
    ModuleRegistered { module_id: String },

    /// A module's self-reported status differs after a lifecycle call.
    ModuleStatusChanged {
        module_id: String,
        old_status: ModuleStatus,
        new_status: ModuleStatus,
        timestamp: DateTime<Utc>,
    },

    /// A module's lifecycle capability reported a failure.
    ModuleOperationFailed {
        module_id: String,
        operation: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

// ---------------------------------------------------------------------------
// IPC Bus
// ---------------------------------------------------------------------------

/// Publish/subscribe event bus backed by [`tokio::sync::broadcast`].
///
/// The bus is cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct IpcBus {
    inner: Arc<IpcBusInner>,
}

struct IpcBusInner {
    sender: broadcast::Sender<Arc<Event>>,
}

impl IpcBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// A subscriber that falls behind by more than `capacity` events
    /// receives [`broadcast::error::RecvError::Lagged`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(IpcBusInner { sender }),
        }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of receivers that will observe the event.  With no
    /// subscribers the event is dropped and `0` is returned.
    pub fn publish(&self, event: Event) -> usize {
        match self.inner.sender.send(Arc::new(event)) {
            Ok(n) => {
                tracing::trace!(receivers = n, "event published to kernel bus");
                n
            }
            Err(_) => {
                tracing::trace!("event published but no active receivers");
                0
            }
        }
    }

    /// Create a new subscriber that will receive all future events.
    ///
    /// Events published *before* this call are **not** replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.inner.sender.subscribe()
    }

    /// Return the current number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

impl Default for IpcBus {
    fn default() -> Self {
        Self::new(256)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive() {
        let bus = IpcBus::new(16);
        let mut rx = bus.subscribe();

        let receivers = bus.publish(Event::ModuleRegistered {
            module_id: "timer".into(),
        });
        assert_eq!(receivers, 1);

        let received = rx.recv().await.expect("should receive event");
        match received.as_ref() {
            Event::ModuleRegistered { module_id } => assert_eq!(module_id, "timer"),
            other => panic!("unexpected event variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_share_payload() {
        let bus = IpcBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(Event::ModuleRegistered {
            module_id: "net-driver".into(),
        });

        let e1 = rx1.recv().await.expect("rx1");
        let e2 = rx2.recv().await.expect("rx2");
        assert!(Arc::ptr_eq(&e1, &e2));
    }

    #[test]
    fn publish_with_no_subscribers_is_dropped() {
        let bus = IpcBus::new(16);
        let delivered = bus.publish(Event::GuestRatioAdjusted {
            old_ratio: 0.5,
            new_ratio: 0.7,
            automatic: false,
        });
        assert_eq!(delivered, 0);
    }

    #[test]
    fn subscriber_count_tracks_drops() {
        let bus = IpcBus::new(16);
        assert_eq!(bus.subscriber_count(), 0);

        let rx1 = bus.subscribe();
        let _rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(rx1);
        assert_eq!(bus.subscriber_count(), 1);
    }
}
