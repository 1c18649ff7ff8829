//! Latest-wins hand-off between the frame source and the inference worker.
//!
//! `push` never blocks: when the buffer is full the oldest queued frame is
//! displaced and counted as dropped. `pop` blocks while the buffer is empty.
//! After `close`, consumers still drain what is queued and then see `None`.

use parking_lot::{Condvar, Mutex};
use std::{collections::VecDeque, sync::Arc};

use crate::{frame::Frame, stats::PipelineStats};

#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    Replaced { dropped_sequence: u64 },
    Closed,
}

struct BufferState {
    frames: VecDeque<Frame>,
    closed: bool,
}

pub struct FrameBuffer {
    state: Mutex<BufferState>,
    not_empty: Condvar,
    capacity: usize,
    stats: Arc<PipelineStats>,
}

impl FrameBuffer {
    pub fn new(capacity: usize, stats: Arc<PipelineStats>) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(BufferState {
                frames: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            capacity,
            stats,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, frame: Frame) -> PushOutcome {
        let mut state = self.state.lock();
        if state.closed {
            return PushOutcome::Closed;
        }

        let displaced = if state.frames.len() >= self.capacity {
            state.frames.pop_front()
        } else {
            None
        };
        state.frames.push_back(frame);
        drop(state);
        self.not_empty.notify_one();

        match displaced {
            Some(old) => {
                self.stats.frames_dropped.inc();
                tracing::trace!(sequence = old.sequence(), "frame displaced in buffer");
                PushOutcome::Replaced {
                    dropped_sequence: old.sequence(),
                }
            }
            None => PushOutcome::Queued,
        }
    }

    /// Block until a frame is available, or return `None` once closed and drained.
    pub fn pop(&self) -> Option<Frame> {
        let mut state = self.state.lock();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
