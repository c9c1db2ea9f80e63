//! # Event Bus System
//!
//! Provides an event-driven view of the bridge using `tokio::sync::broadcast`.
//! Transport, protocol and script-bridge components publish typed events here
//! so embedders (and tests) can observe connection and session lifecycle
//! without hooking into the components themselves.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: Strongly-typed enum hierarchies for different layers
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   emit    ┌───────────┐
//! │ Transport server ├──────────>│           │
//! │ / client         │           │           │
//! └──────────────────┘           │ EventBus  │   subscribe   ┌────────────┐
//! ┌──────────────────┐   emit    │ (broadcast├──────────────>│ Subscriber │
//! │ Extension host   ├──────────>│  channel) │               └────────────┘
//! └──────────────────┘           │           │
//! ┌──────────────────┐   emit    │           │   subscribe   ┌────────────┐
//! │ Injected bundle  ├──────────>│           ├──────────────>│ Subscriber │
//! └──────────────────┘           └───────────┘               └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{BridgeEvent, ConnectionEvent, EventBus};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut stream = event_bus.subscribe();
//!
//! event_bus
//!     .emit(BridgeEvent::Connection(ConnectionEvent::Listening {
//!         address: "unix:path=/run/user/5000/.app.Extension".to_string(),
//!     }))
//!     .ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert_eq!(event.description(), "Bus server listening");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   Non-fatal; the subscriber keeps receiving new events.
//! - **`RecvError::Closed`**: All senders have been dropped. Treat as shutdown.
//!
//! Publishers ignore `SendError`: having no subscriber is the normal case.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Bridge Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum BridgeEvent {
    /// Bus connection lifecycle
    Connection(ConnectionEvent),
    /// Script session lifecycle in the content process
    Session(SessionEvent),
    /// Extension registry and instance lifecycle
    Extension(ExtensionEvent),
}

impl BridgeEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            BridgeEvent::Connection(e) => e.description(),
            BridgeEvent::Session(e) => e.description(),
            BridgeEvent::Extension(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            BridgeEvent::Connection(ConnectionEvent::PeerRejected { .. }) => {
                EventSeverity::Warning
            }
            BridgeEvent::Connection(ConnectionEvent::Disconnected {
                reason: Some(_), ..
            }) => EventSeverity::Warning,
            BridgeEvent::Session(SessionEvent::ExternalOriginRejected { .. }) => {
                EventSeverity::Warning
            }
            BridgeEvent::Extension(ExtensionEvent::PendingCallsFlushed { .. }) => {
                EventSeverity::Warning
            }
            BridgeEvent::Connection(ConnectionEvent::Listening { .. })
            | BridgeEvent::Connection(ConnectionEvent::Connected { .. })
            | BridgeEvent::Session(SessionEvent::Started { .. })
            | BridgeEvent::Extension(ExtensionEvent::Registered { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    /// Debug-level events (verbose)
    Debug,
    /// Informational events
    Info,
    /// Warning events
    Warning,
    /// Error events
    Error,
}

// ============================================================================
// Connection Events
// ============================================================================

/// Events emitted by the transport server and client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ConnectionEvent {
    /// Server bound its socket and is accepting peers.
    Listening {
        /// Client-facing bus address.
        address: String,
    },
    /// Server authenticated a peer and made it the active connection.
    PeerAccepted {
        /// Peer process id, when the platform reports it.
        pid: Option<i32>,
        /// Peer user id.
        uid: u32,
        /// Peer group id.
        gid: u32,
    },
    /// Server refused a peer before reading any message from it.
    PeerRejected {
        /// Peer user id, if credentials could be read at all.
        uid: Option<u32>,
        /// Why the peer was refused (unauthorized, busy).
        reason: String,
    },
    /// Client completed the handshake with a server.
    Connected {
        /// Address that was dialed.
        address: String,
    },
    /// A connection ended, on either side.
    Disconnected {
        /// Address of the connection.
        address: String,
        /// Failure reason; `None` for an orderly close.
        reason: Option<String>,
    },
}

impl ConnectionEvent {
    fn description(&self) -> &str {
        match self {
            ConnectionEvent::Listening { .. } => "Bus server listening",
            ConnectionEvent::PeerAccepted { .. } => "Peer accepted",
            ConnectionEvent::PeerRejected { .. } => "Peer rejected",
            ConnectionEvent::Connected { .. } => "Connected to bus",
            ConnectionEvent::Disconnected { .. } => "Connection closed",
        }
    }
}

// ============================================================================
// Session Events
// ============================================================================

/// Events emitted by the script bridge for each script context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SessionEvent {
    /// A script context was bound to a routing id.
    Started {
        /// Routing id of the content view.
        routing_id: i32,
        /// Script context identifier.
        context_id: u64,
        /// Document base URL.
        base_url: String,
    },
    /// A script context was released.
    Stopped {
        /// Routing id of the content view.
        routing_id: i32,
        /// Script context identifier.
        context_id: u64,
        /// Pending calls dropped without completion.
        released_calls: usize,
    },
    /// The privileged host announced it is ready for this routing id.
    EndpointCreated {
        /// Routing id of the content view.
        routing_id: i32,
    },
    /// Extensions were withheld because the document is remote.
    ExternalOriginRejected {
        /// Routing id of the content view.
        routing_id: i32,
        /// The rejected base URL.
        base_url: String,
    },
}

impl SessionEvent {
    fn description(&self) -> &str {
        match self {
            SessionEvent::Started { .. } => "Script session started",
            SessionEvent::Stopped { .. } => "Script session stopped",
            SessionEvent::EndpointCreated { .. } => "Extension endpoint created",
            SessionEvent::ExternalOriginRejected { .. } => "Remote origin denied extensions",
        }
    }
}

// ============================================================================
// Extension Events
// ============================================================================

/// Events emitted by the extension host and the protocol client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ExtensionEvent {
    /// An extension was added to the registry.
    Registered {
        /// Extension name.
        name: String,
        /// Script symbols it claims.
        entry_points: Vec<String>,
    },
    /// An instance was created for a content view.
    InstanceCreated {
        /// Extension name.
        extension: String,
        /// Instance handle.
        instance_id: String,
    },
    /// An instance was destroyed, explicitly or on disconnect.
    InstanceDestroyed {
        /// Instance handle.
        instance_id: String,
    },
    /// Outstanding asynchronous calls were failed in bulk.
    PendingCallsFlushed {
        /// Number of calls completed with a failure.
        count: usize,
        /// Why they were flushed.
        reason: String,
    },
}

impl ExtensionEvent {
    fn description(&self) -> &str {
        match self {
            ExtensionEvent::Registered { .. } => "Extension registered",
            ExtensionEvent::InstanceCreated { .. } => "Extension instance created",
            ExtensionEvent::InstanceDestroyed { .. } => "Extension instance destroyed",
            ExtensionEvent::PendingCallsFlushed { .. } => "Pending calls flushed",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Uses `tokio::sync::broadcast` internally, which provides:
/// - Multiple producers (clone the `EventBus`)
/// - Multiple consumers (each `subscribe()` creates a new receiver)
/// - Non-blocking sends (events are cloned for each subscriber)
/// - Lagging detection (slow subscribers get `RecvError::Lagged`)
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of events to buffer per subscriber.
    ///
    /// # Example
    ///
    /// ```rust
    /// use core_runtime::events::EventBus;
    ///
    /// let event_bus = EventBus::new(100);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Creates a new event bus with the default buffer size.
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// if there are no active subscribers.
    pub fn emit(&self, event: BridgeEvent) -> Result<usize, SendError<BridgeEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<BridgeEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    ///
    /// # Example
    ///
    /// ```rust
    /// use core_runtime::events::EventBus;
    ///
    /// let event_bus = EventBus::new(100);
    /// assert_eq!(event_bus.subscriber_count(), 0);
    ///
    /// let _subscriber = event_bus.subscribe();
    /// assert_eq!(event_bus.subscriber_count(), 1);
    /// ```
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

/// Type alias for event filter functions.
type EventFilter = Box<dyn Fn(&BridgeEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with optional filtering.
///
/// # Example
///
/// ```rust
/// use core_runtime::events::{BridgeEvent, EventBus, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let sessions_only = EventStream::new(event_bus.subscribe())
///     .filter(|event| matches!(event, BridgeEvent::Session(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<BridgeEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    /// Creates a new event stream from a receiver.
    pub fn new(receiver: Receiver<BridgeEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Adds a filter function to this stream.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&BridgeEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &BridgeEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter (if any).
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<BridgeEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no matching events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<BridgeEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
