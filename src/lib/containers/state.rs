use std::collections::HashMap;

use super::types::ContainerState;

pub fn valid_state_transition(src: &ContainerState, dst: &ContainerState) -> bool {
    let state_transition_map: HashMap<ContainerState, Vec<ContainerState>> = {
        let mut map = HashMap::new();
        map.insert(ContainerState::Absent, vec![ContainerState::Pending]);
        map.insert(
            ContainerState::Pending,
            vec![ContainerState::Starting, ContainerState::Stopped],
        );
        map.insert(
            ContainerState::Starting,
            vec![
                ContainerState::Starting,
                ContainerState::Running,
                ContainerState::Pending,
                ContainerState::Stopping,
                ContainerState::Failed,
            ],
        );
        map.insert(
            ContainerState::Running,
            vec![
                ContainerState::Running,
                ContainerState::Stopping,
                ContainerState::Failed,
            ],
        );
        map.insert(
            ContainerState::Stopping,
            vec![
                ContainerState::Stopping,
                ContainerState::Stopped,
                ContainerState::Failed,
            ],
        );
        map.insert(
            ContainerState::Stopped,
            vec![ContainerState::Starting, ContainerState::Stopped],
        );
        map.insert(
            ContainerState::Failed,
            vec![
                ContainerState::Starting,
                ContainerState::Stopping,
                ContainerState::Stopped,
                ContainerState::Failed,
            ],
        );
        map
    };

    if let Some(valid_states) = state_transition_map.get(src) {
        valid_states.contains(dst)
    } else {
        false
    }
}
