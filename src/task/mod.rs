pub mod docker;
pub mod state;
pub mod types;

pub use docker::{ContainerRuntime, ContainerSummary, DockerApi, DockerError};
pub use state::valid_state_transition;
pub use types::{new_config, Config, State, Task, TaskEvent};
