//! Shared application state for the control server.

use orion::control::ControlPlane;
use orion::io::sink::BroadcastSink;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Operator surface of the running Orion runtime.
    pub control: ControlPlane,
    /// Source of dashboard updates for SSE clients.
    pub events: BroadcastSink,
}

impl AppState {
    pub fn new(control: ControlPlane, events: BroadcastSink) -> Self {
        Self { control, events }
    }
}
