//! Text exposition of the transport metrics.

use crate::MetricsRegistry;
use prometheus_client::encoding::text::encode;
use std::fmt;

/// Render every registered metric in the Prometheus text format.
pub fn render_metrics(registry: &MetricsRegistry) -> Result<String, fmt::Error> {
    let mut out = String::new();
    encode(&mut out, &registry.registry)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_registry_exposes_families() {
        let out = render_metrics(&MetricsRegistry::new()).unwrap();
        assert!(out.contains("# TYPE ncl_connection_state_transitions counter"));
        assert!(out.contains("ncl_connected_nodes 0"));
        assert!(out.ends_with("# EOF\n"));
    }

    #[test]
    fn test_recorded_values_show_up() {
        let registry = MetricsRegistry::new();
        registry.record_heartbeat("node-1", true);
        registry.record_heartbeat("node-1", false);
        registry.data_plane_started();

        let out = render_metrics(&registry).unwrap();
        assert!(out.contains(r#"ncl_heartbeats_total{node_id="node-1",outcome="success"} 1"#));
        assert!(out.contains(r#"ncl_heartbeats_total{node_id="node-1",outcome="failure"} 1"#));
        assert!(out.contains("ncl_connected_nodes 1"));
    }
}
