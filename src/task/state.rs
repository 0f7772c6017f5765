use super::types::State;

/// Whether a task may move from `src` to `dst`. Self-loops on Scheduled and
/// Running are legal so an identical event can be re-asserted; Completed and
/// Failed are terminal.
pub fn valid_state_transition(src: State, dst: State) -> bool {
    match src {
        State::Pending => matches!(dst, State::Scheduled),
        State::Scheduled => matches!(dst, State::Scheduled | State::Running | State::Failed),
        State::Running => matches!(dst, State::Running | State::Completed | State::Failed),
        State::Completed | State::Failed => false,
    }
}
