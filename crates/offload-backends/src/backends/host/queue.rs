//! In-order command queues and event bookkeeping for the host backend.

use super::executor::Launch;
use crate::backend::{BufferHandle, ContextHandle, DeviceId, EventHandle, QueueHandle};
use std::collections::VecDeque;
use std::sync::Arc;

pub(crate) enum Command {
    Write { buffer: BufferHandle, data: Arc<[u8]> },
    Read { buffer: BufferHandle },
    Launch(Launch),
}

impl Command {
    pub fn label(&self) -> &'static str {
        match self {
            Command::Write { .. } => "write",
            Command::Read { .. } => "read",
            Command::Launch(_) => "launch",
        }
    }
}

pub(crate) struct Submitted {
    pub event: EventHandle,
    pub command: Command,
}

/// Commands wait here until a synchronization point runs them in order.
pub(crate) struct CommandQueue {
    pub context: ContextHandle,
    pub device: DeviceId,
    pending: VecDeque<Submitted>,
    /// Highest event whose completed record was dropped by `finish`.
    retired: Option<EventHandle>,
}

impl CommandQueue {
    pub fn new(context: ContextHandle, device: DeviceId) -> Self {
        Self {
            context,
            device,
            pending: VecDeque::new(),
            retired: None,
        }
    }

    pub fn push(&mut self, event: EventHandle, command: Command) {
        self.pending.push_back(Submitted { event, command });
    }

    pub fn pop(&mut self) -> Option<Submitted> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn retire(&mut self, event: EventHandle) {
        self.retired = self.retired.max(Some(event));
    }

    /// Whether a completed `event` of this queue may have been dropped.
    pub fn has_retired(&self, event: EventHandle) -> bool {
        self.retired.is_some_and(|r| event <= r)
    }
}

pub(crate) enum EventStatus {
    Queued,
    Complete,
    /// A finished read whose bytes have not been collected yet.
    ReadReady(Vec<u8>),
    Failed(String),
}

pub(crate) struct EventRecord {
    pub queue: QueueHandle,
    pub status: EventStatus,
}
