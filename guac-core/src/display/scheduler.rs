//! Ordered render tasks, frames, and the drain loop.
//!
//! Drawing operations become tasks appended to a pending list; a `flush`
//! seals the pending list into a frame. Frames complete strictly in
//! submission order, and no task of a frame runs while any task in that
//! frame is still blocked. That rule is what makes a frame atomic from the
//! viewer's perspective.
//!
//! The scheduler is generic over the context handed to task handlers so the
//! frame machinery can be exercised without a scene graph.

use std::collections::VecDeque;

use tracing::trace;

/// Identifies a scheduled task for later unblocking.
pub type TaskId = u64;

/// A task handler: runs exactly once against the owning context.
pub type TaskFn<C> = Box<dyn FnOnce(&mut C) + Send>;

/// Callback invoked when every task of a frame has executed.
pub type FrameCallback = Box<dyn FnOnce() + Send>;

// ── Task ─────────────────────────────────────────────────────────

struct Task<C> {
    id: TaskId,
    blocked: bool,
    handler: Option<TaskFn<C>>,
}

// ── Frame ────────────────────────────────────────────────────────

struct Frame<C> {
    tasks: Vec<Task<C>>,
    on_complete: Option<FrameCallback>,
}

impl<C> Frame<C> {
    /// A frame is ready once none of its tasks are blocked.
    fn is_ready(&self) -> bool {
        self.tasks.iter().all(|t| !t.blocked)
    }
}

// ── Scheduler ────────────────────────────────────────────────────

/// The pending task list plus the ordered frame queue.
pub struct Scheduler<C> {
    pending: Vec<Task<C>>,
    frames: VecDeque<Frame<C>>,
    next_id: TaskId,
}

impl<C> Scheduler<C> {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            frames: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Append a task to the pending list.
    ///
    /// A blocked task holds back the whole frame it ends up in until
    /// [`unblock`](Self::unblock) is called with the returned id.
    pub fn schedule(&mut self, blocked: bool, handler: TaskFn<C>) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.push(Task {
            id,
            blocked,
            handler: Some(handler),
        });
        id
    }

    /// Seal the pending tasks into a frame and drain whatever is ready.
    pub fn flush(&mut self, on_complete: Option<FrameCallback>, context: &mut C) {
        let tasks = std::mem::take(&mut self.pending);
        self.frames.push_back(Frame { tasks, on_complete });
        self.drain(context);
    }

    /// Clear a task's blocked flag and drain.
    ///
    /// Returns `true` if the id referred to a known task. Unknown ids (a
    /// task whose frame already ran, or never existed) are tolerated.
    pub fn unblock(&mut self, id: TaskId, context: &mut C) -> bool {
        let task = self
            .frames
            .iter_mut()
            .flat_map(|f| f.tasks.iter_mut())
            .chain(self.pending.iter_mut())
            .find(|t| t.id == id);

        match task {
            Some(task) => {
                task.blocked = false;
                self.drain(context);
                true
            }
            None => {
                trace!(task = id, "unblock for unknown task ignored");
                false
            }
        }
    }

    /// Number of frames not yet completed.
    pub fn queued_frames(&self) -> usize {
        self.frames.len()
    }

    /// Number of tasks awaiting the next flush.
    pub fn pending_tasks(&self) -> usize {
        self.pending.len()
    }

    /// Drop every queued frame and pending task without running them.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.frames.clear();
    }

    /// Run ready frames from the head of the queue, in order, stopping at
    /// the first frame that still contains a blocked task.
    fn drain(&mut self, context: &mut C) {
        while let Some(front) = self.frames.front() {
            if !front.is_ready() {
                break;
            }
            let mut frame = self.frames.pop_front().expect("front frame exists");
            for task in &mut frame.tasks {
                if let Some(handler) = task.handler.take() {
                    handler(context);
                }
            }
            if let Some(on_complete) = frame.on_complete.take() {
                on_complete();
            }
        }
    }
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────
