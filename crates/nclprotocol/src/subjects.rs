//! Bus subject naming.
//!
//! Every subject is rooted at the compute node it concerns and named from the
//! compute node's point of view: `in` flows toward the node, `out` flows away
//! from it.

const COMPUTE_PREFIX: &str = "bacalhau.global.compute";

/// Orchestrator → compute data messages.
pub fn compute_in_msgs(node_id: &str) -> String {
    format!("{COMPUTE_PREFIX}.{node_id}.in.msgs")
}

/// Compute → orchestrator data messages.
pub fn compute_out_msgs(node_id: &str) -> String {
    format!("{COMPUTE_PREFIX}.{node_id}.out.msgs")
}

/// Compute → orchestrator control requests.
pub fn compute_out_ctrl(node_id: &str) -> String {
    format!("{COMPUTE_PREFIX}.{node_id}.out.ctrl")
}

/// Requests served by the compute node (log streams).
pub fn compute_in_requests(node_id: &str) -> String {
    format!("{COMPUTE_PREFIX}.{node_id}.in.requests")
}

/// Control requests from every compute node.
pub fn orchestrator_in_ctrl() -> String {
    format!("{COMPUTE_PREFIX}.*.out.ctrl")
}

/// Messages the orchestrator receives from a node.
pub fn orchestrator_in_msgs(node_id: &str) -> String {
    compute_out_msgs(node_id)
}

/// Messages the orchestrator sends to a node.
pub fn orchestrator_out_msgs(node_id: &str) -> String {
    compute_in_msgs(node_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::subject_matches;

    #[test]
    fn test_directions_pair_up() {
        assert_eq!(orchestrator_in_msgs("n1"), compute_out_msgs("n1"));
        assert_eq!(orchestrator_out_msgs("n1"), compute_in_msgs("n1"));
        assert_eq!(compute_in_msgs("n1"), "bacalhau.global.compute.n1.in.msgs");
    }

    #[test]
    fn test_orchestrator_ctrl_matches_every_node() {
        assert!(subject_matches(&orchestrator_in_ctrl(), &compute_out_ctrl("n1")));
        assert!(subject_matches(&orchestrator_in_ctrl(), &compute_out_ctrl("n2")));
        assert!(!subject_matches(&orchestrator_in_ctrl(), &compute_out_msgs("n1")));
    }
}
