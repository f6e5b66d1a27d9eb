use tracing::Span;
use uuid::Uuid;

/// 32 hex characters (128 bits), compatible with OpenTelemetry trace ids.
pub fn generate_trace_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// 16 hex characters (64 bits).
pub fn generate_span_id() -> String {
    Uuid::new_v4().as_simple().to_string()[..16].to_string()
}

/// Root span for one plan execution. Returns the span and its trace id so the
/// id can be attached to status updates and logs.
pub fn plan_span(plan_id: &str, command_id: &str) -> (Span, String) {
    let trace_id = generate_trace_id();
    let span = tracing::info_span!(
        "plan",
        trace_id = %trace_id,
        span_id = %generate_span_id(),
        plan_id = %plan_id,
        command_id = %command_id,
    );
    (span, trace_id)
}

/// Child span for one stage of a plan.
pub fn stage_span(trace_id: &str, stage_id: &str, tasks: usize) -> Span {
    tracing::info_span!(
        "stage",
        trace_id = %trace_id,
        span_id = %generate_span_id(),
        stage_id = %stage_id,
        tasks = tasks,
    )
}

/// Span around a single planning or other standalone operation.
pub fn operation_span(operation: &str) -> (Span, String) {
    let trace_id = generate_trace_id();
    let span = tracing::info_span!(
        "operation",
        trace_id = %trace_id,
        span_id = %generate_span_id(),
        operation = %operation,
    );
    (span, trace_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_format() {
        let id = generate_trace_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn span_id_format() {
        let id = generate_span_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn plan_and_stage_spans_share_trace() {
        let (span, trace_id) = plan_span("plan-1", "cmd-1");
        let _guard = span.enter();
        let stage = stage_span(&trace_id, "s1", 3);
        let _stage_guard = stage.enter();
        assert_eq!(trace_id.len(), 32);
    }
}
