//! Decision frames and the backtracking stack.
//!
//! Each frame records the solver state as it was before a decision, the
//! task being decided, and the alternatives in preference order. Undoing a
//! decision restores the frame's snapshot; the state is small enough that
//! snapshotting beats replaying a trail.

use super::{Alternative, SolveState, Task};

pub(super) struct Frame {
    pub snapshot: SolveState,
    pub task: Task,
    pub alternatives: Vec<Alternative>,
    pub next: usize,
}

/// Tracks the stack of open decisions and how many alternatives have been
/// tried overall (the solver's bounded-effort budget).
#[derive(Default)]
pub(super) struct DecisionTracker {
    stack: Vec<Frame>,
    pub decisions: u64,
}

impl DecisionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Opens a frame and returns the first alternative to try.
    pub fn push(&mut self, frame: Frame) -> (SolveState, Task, Alternative) {
        debug_assert!(!frame.alternatives.is_empty());
        let state = frame.snapshot.clone();
        let task = frame.task.clone();
        let alternative = frame.alternatives[0].clone();
        self.stack.push(frame);
        self.decisions += 1;
        (state, task, alternative)
    }

    /// Abandons the current line of search: advances to the next untried
    /// alternative anywhere down the stack, restoring that frame's
    /// snapshot. `None` when the whole space is exhausted.
    pub fn backtrack(&mut self) -> Option<(SolveState, Task, Alternative)> {
        while let Some(frame) = self.stack.last_mut() {
            frame.next += 1;
            if frame.next < frame.alternatives.len() {
                let state = frame.snapshot.clone();
                let task = frame.task.clone();
                let alternative = frame.alternatives[frame.next].clone();
                self.decisions += 1;
                return Some((state, task, alternative));
            }
            self.stack.pop();
        }
        None
    }
}
