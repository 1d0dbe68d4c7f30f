/// Per-source flow-control state machine.
///
/// ```text
///            queued             failure / close
///   ACTIVE ─────────► QUEUED ─────────────────► FAILED ──► CLOSED
///     ▲ │   ◄─────────                              │
///     │ └────────────── ready ─────────────────────►│
///     └─ created                                    ▼
/// ```
///
/// Leaving `ACTIVE` for any other state hands the held assignment back to the
/// caller so it can be returned to the free pool. `CLOSED` is terminal.

use std::fmt;
use std::time::Duration;

use crate::error::{Result, SwarmError};
use crate::range::{Range, RangeSet};

/// Stable identifier of a connection inside one coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Active,
    Queued,
    Failed,
    Closed,
}

impl ConnectionState {
    /// True while the source can still shrink the missing set.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Queued)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "ACTIVE",
            Self::Queued => "QUEUED",
            Self::Failed => "FAILED",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// What a remote told us when it put us in its queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueInfo {
    /// Our place in the remote's upload queue, if reported.
    pub position: Option<u32>,
    /// How long the remote asked us to wait before asking again.
    pub retry_after: Option<Duration>,
}

impl QueueInfo {
    pub fn new(position: Option<u32>, retry_after: Option<Duration>) -> Self {
        Self {
            position,
            retry_after,
        }
    }
}

/// Bookkeeping record for one remote source.
#[derive(Debug, Clone)]
pub struct SourceConnection {
    id: ConnectionId,
    label: String,
    state: ConnectionState,
    assignment: Option<Range>,
    available: Option<RangeSet>,
    queue: Option<QueueInfo>,
    bytes_written: u64,
    assignments: u64,
}

impl SourceConnection {
    /// New connection in `ACTIVE` with nothing assigned.
    ///
    /// `available` restricts assignments to bytes the remote holds; `None`
    /// means the remote has the whole file.
    pub fn new(id: ConnectionId, label: impl Into<String>, available: Option<RangeSet>) -> Self {
        Self {
            id,
            label: label.into(),
            state: ConnectionState::Active,
            assignment: None,
            available,
            queue: None,
            bytes_written: 0,
            assignments: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn assignment(&self) -> Option<Range> {
        self.assignment
    }

    pub fn available(&self) -> Option<&RangeSet> {
        self.available.as_ref()
    }

    pub fn queue_info(&self) -> Option<&QueueInfo> {
        self.queue.as_ref()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Number of ranges ever granted to this connection.
    pub fn assignments(&self) -> u64 {
        self.assignments
    }

    /// Active with no outstanding assignment.
    pub fn is_idle(&self) -> bool {
        self.state == ConnectionState::Active && self.assignment.is_none()
    }

    /// Remote is ready to serve. Valid from `ACTIVE` (no-op) and `QUEUED`.
    pub fn activate(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Active => Ok(()),
            ConnectionState::Queued => {
                self.state = ConnectionState::Active;
                self.queue = None;
                Ok(())
            }
            from => Err(self.invalid(from, ConnectionState::Active)),
        }
    }

    /// Remote paused us. Returns the released assignment, if any.
    pub fn enqueue(&mut self, info: QueueInfo) -> Result<Option<Range>> {
        match self.state {
            ConnectionState::Active | ConnectionState::Queued => {
                self.state = ConnectionState::Queued;
                self.queue = Some(info);
                Ok(self.assignment.take())
            }
            from => Err(self.invalid(from, ConnectionState::Queued)),
        }
    }

    /// I/O error, timeout or protocol violation. Returns the released assignment.
    pub fn fail(&mut self) -> Result<Option<Range>> {
        match self.state {
            ConnectionState::Closed => Err(self.invalid(ConnectionState::Closed, ConnectionState::Failed)),
            _ => {
                self.state = ConnectionState::Failed;
                self.queue = None;
                Ok(self.assignment.take())
            }
        }
    }

    /// Terminal close. Returns the released assignment.
    pub fn close(&mut self) -> Result<Option<Range>> {
        match self.state {
            ConnectionState::Closed => Err(self.invalid(ConnectionState::Closed, ConnectionState::Closed)),
            _ => {
                self.state = ConnectionState::Closed;
                self.queue = None;
                Ok(self.assignment.take())
            }
        }
    }

    /// Hand `range` to this connection.
    pub fn assign(&mut self, range: Range) -> Result<()> {
        if self.state != ConnectionState::Active {
            return Err(self.invalid(self.state, ConnectionState::Active));
        }
        if self.assignment.is_some() {
            return Err(SwarmError::AssignmentOutstanding(self.id));
        }
        self.assignment = Some(range);
        self.assignments += 1;
        Ok(())
    }

    /// Record that the leading `written` bytes of the assignment reached disk.
    ///
    /// Returns the remainder still assigned, `None` once the assignment is
    /// fully written.
    pub fn consume(&mut self, written: Range) -> Result<Option<Range>> {
        let Some(current) = self.assignment else {
            return Err(self.not_assigned(written));
        };
        if written.start() != current.start() || !current.covers(&written) {
            return Err(self.not_assigned(written));
        }

        self.bytes_written += written.len();
        self.assignment = if written.end() < current.end() {
            Some(Range::new(written.end(), current.end())?)
        } else {
            None
        };
        Ok(self.assignment)
    }

    fn invalid(&self, from: ConnectionState, to: ConnectionState) -> SwarmError {
        SwarmError::InvalidTransition { id: self.id, from, to }
    }

    fn not_assigned(&self, range: Range) -> SwarmError {
        SwarmError::NotAssigned {
            id: self.id,
            start: range.start(),
            end: range.end(),
        }
    }
}
