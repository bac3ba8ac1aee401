//! The coordinator link: how the client learns configuration snapshots.
//!
//! The wire protocol between client and coordinator is not the multiplexer's
//! concern; the event pump only needs the narrow surface below. Deployments
//! whose configuration arrives out of band (or tests) can use
//! [`StaticCoordinator`]; a live coordinator connection implements the same
//! trait.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::Configuration;

/// Status of a coordinator link operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// The operation completed.
    Success,
    /// The link could not be established.
    ConnectFail,
    /// The link dropped.
    Disconnect,
    /// The coordinator is shutting down.
    Shutdown,
    /// The link violated its own protocol.
    LogicError,
}

/// Narrow interface over the coordinator connection.
pub trait CoordinatorLink {
    /// Establish the link.
    fn connect(&mut self) -> LinkStatus;

    /// Whether the link is currently established.
    fn connected(&self) -> bool;

    /// Advance the link's internal event loop by one step. `None` waits
    /// indefinitely for progress.
    fn step(&mut self, timeout: Option<Duration>) -> LinkStatus;

    /// Descriptor to include in the client's poll set, or `-1` if the link
    /// has nothing to poll.
    fn pollfd(&self) -> RawFd;

    /// Whether a configuration newer than the last acknowledged one is
    /// available.
    fn unacknowledged(&self) -> bool;

    /// The most recent configuration snapshot.
    fn config(&self) -> Arc<Configuration>;

    /// Acknowledge the current configuration.
    fn acknowledge(&mut self);
}

struct StaticState {
    current: Arc<Configuration>,
    unacked: bool,
    connected: bool,
}

/// A coordinator link serving locally supplied configuration snapshots.
///
/// Cloned handles share state, so a test (or a deployment's own config
/// watcher) can [`publish`](StaticCoordinator::publish) a new snapshot while
/// the client owns another handle.
#[derive(Clone)]
pub struct StaticCoordinator {
    state: Rc<RefCell<StaticState>>,
}

impl StaticCoordinator {
    /// Create a link whose first published snapshot is `initial`.
    pub fn new(initial: Configuration) -> Self {
        Self {
            state: Rc::new(RefCell::new(StaticState {
                current: Arc::new(initial),
                unacked: true,
                connected: false,
            })),
        }
    }

    /// Make a new snapshot available to the client.
    pub fn publish(&self, config: Configuration) {
        let mut state = self.state.borrow_mut();
        debug!(version = config.version(), "publishing configuration");
        state.current = Arc::new(config);
        state.unacked = true;
    }
}

impl CoordinatorLink for StaticCoordinator {
    fn connect(&mut self) -> LinkStatus {
        self.state.borrow_mut().connected = true;
        LinkStatus::Success
    }

    fn connected(&self) -> bool {
        self.state.borrow().connected
    }

    fn step(&mut self, _timeout: Option<Duration>) -> LinkStatus {
        LinkStatus::Success
    }

    fn pollfd(&self) -> RawFd {
        -1
    }

    fn unacknowledged(&self) -> bool {
        self.state.borrow().unacked
    }

    fn config(&self) -> Arc<Configuration> {
        self.state.borrow().current.clone()
    }

    fn acknowledge(&mut self) {
        self.state.borrow_mut().unacked = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_link_handshake() {
        let mut link = StaticCoordinator::new(Configuration::builder().version(1).build());
        assert!(!link.connected());
        assert_eq!(link.connect(), LinkStatus::Success);
        assert!(link.connected());

        assert!(link.unacknowledged());
        assert_eq!(link.config().version(), 1);
        link.acknowledge();
        assert!(!link.unacknowledged());
    }

    #[test]
    fn publish_raises_unacknowledged() {
        let mut link = StaticCoordinator::new(Configuration::builder().version(1).build());
        link.connect();
        link.acknowledge();

        let publisher = link.clone();
        publisher.publish(Configuration::builder().version(2).build());

        assert!(link.unacknowledged());
        assert_eq!(link.config().version(), 2);
    }
}
