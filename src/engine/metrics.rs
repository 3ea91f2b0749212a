use std::{
    fmt::Write,
    sync::atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;

use crate::engine::models::{Language, PoolSnapshot};

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    executions: DashMap<(Language, &'static str), u64>,
    rejected_total: AtomicU64,
    containers_created_total: AtomicU64,
    containers_evicted_total: AtomicU64,
    cleanup_failures_total: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `outcome` is `"ok"` or an `EngineError::kind` label.
    pub fn execution(&self, language: Language, outcome: &'static str) {
        *self.executions.entry((language, outcome)).or_insert(0) += 1;
    }

    /// Requests refused before a language could be resolved.
    pub fn rejected(&self) {
        self.rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn container_created(&self) {
        self.containers_created_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn containers_evicted(&self, count: usize) {
        self.containers_evicted_total
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn cleanup_failed(&self) {
        self.cleanup_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn execution_count(&self, language: Language, outcome: &'static str) -> u64 {
        self.executions
            .get(&(language, outcome))
            .map(|count| *count)
            .unwrap_or(0)
    }

    pub fn render_prometheus(&self, pools: &[PoolSnapshot]) -> String {
        let mut out = String::new();

        let mut executions: Vec<_> = self
            .executions
            .iter()
            .map(|entry| (entry.key().0, entry.key().1, *entry.value()))
            .collect();
        executions.sort();
        out.push_str("# TYPE sandbox_executions_total counter\n");
        for (language, outcome, count) in executions {
            let _ = writeln!(
                out,
                "sandbox_executions_total{{language=\"{language}\",outcome=\"{outcome}\"}} {count}"
            );
        }

        let counters = [
            ("sandbox_rejected_total", &self.rejected_total),
            ("sandbox_containers_created_total", &self.containers_created_total),
            ("sandbox_containers_evicted_total", &self.containers_evicted_total),
            ("sandbox_cleanup_failures_total", &self.cleanup_failures_total),
        ];
        for (name, value) in counters {
            let _ = writeln!(
                out,
                "# TYPE {name} counter\n{name} {}",
                value.load(Ordering::Relaxed)
            );
        }

        out.push_str("# TYPE sandbox_pool_containers gauge\n");
        for pool in pools {
            let _ = writeln!(
                out,
                "sandbox_pool_containers{{language=\"{}\",state=\"busy\"}} {}",
                pool.language, pool.busy
            );
            let _ = writeln!(
                out,
                "sandbox_pool_containers{{language=\"{}\",state=\"idle\"}} {}",
                pool.language, pool.idle
            );
        }
        out
    }
}
