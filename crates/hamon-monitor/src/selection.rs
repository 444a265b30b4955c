use crate::session::Session;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn delta(self) -> isize {
        match self {
            Direction::Up => -1,
            Direction::Down => 1,
        }
    }
}

/// Tracks which session holds the cursor and hands it across panels when it
/// runs off the top or bottom of one.
#[derive(Debug, Default)]
pub struct SelectionController {
    active: usize,
}

impl SelectionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> usize {
        self.active
    }

    /// Moves one step in `direction`. Returns the indexes of every session
    /// whose cursor changed, in the order they were touched; each needs a
    /// redraw. There is no wraparound past the first or last session.
    pub fn step(&mut self, sessions: &[Arc<Session>], direction: Direction) -> Vec<usize> {
        let mut touched = Vec::new();
        let Some(last) = sessions.len().checked_sub(1) else {
            return touched;
        };
        self.active = self.active.min(last);

        let mut entering = false;
        loop {
            let session = &sessions[self.active];
            let outcome = if entering {
                session.enter_cursor(direction.delta())
            } else {
                session.move_cursor(direction.delta())
            };
            if outcome.changed {
                touched.push(self.active);
            }
            if outcome.selected {
                break;
            }
            let next = match direction {
                Direction::Up => self.active.checked_sub(1),
                Direction::Down => Some(self.active + 1).filter(|next| *next <= last),
            };
            match next {
                Some(next) => {
                    self.active = next;
                    entering = true;
                }
                None => break,
            }
        }

        debug!(
            event = "selection_step",
            direction = ?direction,
            active = self.active,
            touched = touched.len()
        );
        touched
    }
}
