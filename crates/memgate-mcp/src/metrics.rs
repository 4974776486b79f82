use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use memgate_core::{BreakerSnapshot, CircuitState};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

/// Call outcome as seen by the metrics layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Ok,
    /// Handler returned a payload whose status was not `"success"`.
    ToolError,
    /// Handler failed, timed out or panicked.
    Fault,
    /// Handler gave up after its caller cancelled.
    Cancelled,
    Rejected,
    Invalid,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ToolMetric {
    pub ok: u64,
    pub tool_errors: u64,
    pub faults: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub invalid: u64,
    pub total_latency_ms: f64,
    pub max_latency_ms: f64,
}

impl ToolMetric {
    pub const fn executed(&self) -> u64 {
        self.ok + self.tool_errors + self.faults + self.cancelled
    }
}

/// Per-tool counters, each behind its own lock. The map lock is only taken
/// for writing the first time a tool is recorded.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    tools: RwLock<HashMap<String, Arc<Mutex<ToolMetric>>>>,
}

impl MetricsRegistry {
    fn slot(&self, tool: &str) -> Arc<Mutex<ToolMetric>> {
        if let Some(existing) = self.tools.read().get(tool) {
            return existing.clone();
        }
        self.tools
            .write()
            .entry(tool.to_string())
            .or_default()
            .clone()
    }

    pub fn record(&self, tool: &str, outcome: CallOutcome, latency_ms: Option<f64>) {
        let slot = self.slot(tool);
        let mut metric = slot.lock();
        match outcome {
            CallOutcome::Ok => metric.ok = metric.ok.saturating_add(1),
            CallOutcome::ToolError => metric.tool_errors = metric.tool_errors.saturating_add(1),
            CallOutcome::Fault => metric.faults = metric.faults.saturating_add(1),
            CallOutcome::Cancelled => metric.cancelled = metric.cancelled.saturating_add(1),
            CallOutcome::Rejected => metric.rejected = metric.rejected.saturating_add(1),
            CallOutcome::Invalid => metric.invalid = metric.invalid.saturating_add(1),
        }
        if let Some(ms) = latency_ms {
            metric.total_latency_ms += ms;
            metric.max_latency_ms = metric.max_latency_ms.max(ms);
        }
    }

    pub fn get(&self, tool: &str) -> Option<ToolMetric> {
        let slot = self.tools.read().get(tool).cloned()?;
        let metric = slot.lock().clone();
        Some(metric)
    }

    /// Prometheus text exposition, tools sorted by name.
    pub fn render(&self, breakers: &[(String, BreakerSnapshot)]) -> String {
        let mut out = String::new();
        for line in [
            "# TYPE memgate_tool_calls_total counter",
            "# TYPE memgate_tool_latency_ms_sum counter",
            "# TYPE memgate_tool_latency_ms_count counter",
            "# TYPE memgate_tool_latency_ms_max gauge",
            "# TYPE memgate_circuit_state gauge",
            "# TYPE memgate_circuit_failures gauge",
        ] {
            out.push_str(line);
            out.push('\n');
        }

        let mut snapshot: Vec<(String, ToolMetric)> = self
            .tools
            .read()
            .iter()
            .map(|(name, slot)| (name.clone(), slot.lock().clone()))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, m) in &snapshot {
            let tool = prom_label_value(name);
            for (status, value) in [
                ("ok", m.ok),
                ("tool_error", m.tool_errors),
                ("fault", m.faults),
                ("cancelled", m.cancelled),
                ("rejected", m.rejected),
                ("invalid", m.invalid),
            ] {
                let _ = writeln!(
                    out,
                    "memgate_tool_calls_total{{tool=\"{tool}\",status=\"{status}\"}} {value}"
                );
            }
            let _ = writeln!(
                out,
                "memgate_tool_latency_ms_sum{{tool=\"{tool}\"}} {:.3}",
                m.total_latency_ms
            );
            let _ = writeln!(
                out,
                "memgate_tool_latency_ms_count{{tool=\"{tool}\"}} {}",
                m.executed()
            );
            let _ = writeln!(
                out,
                "memgate_tool_latency_ms_max{{tool=\"{tool}\"}} {:.3}",
                m.max_latency_ms
            );
        }

        for (name, snap) in breakers {
            let tool = prom_label_value(name);
            let _ = writeln!(
                out,
                "memgate_circuit_state{{tool=\"{tool}\"}} {}",
                state_gauge(snap.state)
            );
            let _ = writeln!(
                out,
                "memgate_circuit_failures{{tool=\"{tool}\"}} {}",
                snap.failure_count
            );
        }
        out
    }
}

const fn state_gauge(state: CircuitState) -> u8 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::HalfOpen => 1,
        CircuitState::Open => 2,
    }
}

fn prom_label_value(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', " ")
}
