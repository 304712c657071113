use crate::types::{ContainerSpec, PodDescriptor};

/// Ordered build steps of a pod: init containers in declared order, then the
/// main container(s). Only the declared position matters, never observed state.
pub fn sequence(pod: &PodDescriptor) -> Vec<ContainerSpec> {
    let mut steps = pod.containers.clone();
    steps.sort_by_key(|c| (c.role, c.ordinal));
    steps
}
