//! Task lifecycle states and the transition graph.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
}

impl State {
    /// States reachable from this one. Self-transitions are listed where
    /// duplicate events must be tolerated.
    pub fn successors(self) -> &'static [State] {
        match self {
            State::Pending => &[State::Scheduled],
            State::Scheduled => &[State::Scheduled, State::Running, State::Failed],
            State::Running => &[State::Running, State::Completed, State::Failed],
            State::Completed | State::Failed => &[],
        }
    }

    pub fn is_terminal(self) -> bool {
        self.successors().is_empty()
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Pending => "pending",
            State::Scheduled => "scheduled",
            State::Running => "running",
            State::Completed => "completed",
            State::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The single source of truth for state mutation legality. Pure lookup:
/// pairs not in the graph are simply false.
pub fn valid_transition(from: State, to: State) -> bool {
    from.successors().contains(&to)
}
