use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const REACTIONS_TOTAL: &str = "quill_reactions_total";
pub const THREAD_MUTATIONS_TOTAL: &str = "quill_thread_mutations_total";
pub const TX_ABORTED_TOTAL: &str = "quill_tx_aborted_total";

/// Install the global Prometheus recorder. Only one recorder may exist per process.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

/// A like/unlike that changed the ledger.
pub fn record_reaction(op: &'static str, target: &'static str) {
    counter!(REACTIONS_TOTAL, "op" => op, "target" => target).increment(1);
}

/// A committed create/update/delete of a post, comment or reply.
pub fn record_thread_mutation(op: &'static str) {
    counter!(THREAD_MUTATIONS_TOTAL, "op" => op).increment(1);
}

/// A transaction that was rolled back instead of committed.
pub fn record_aborted(op: &'static str) {
    counter!(TX_ABORTED_TOTAL, "op" => op).increment(1);
}
