//! Prometheus metrics for the session front-end.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::session::{FinishReason, GenerationSummary};

/// Counters and histograms exported on `GET /metrics`.
///
/// Each instance owns its registry, so tests can build as many as they like.
pub struct SessionMetrics {
    registry: Registry,
    loads: IntCounterVec,
    generations: IntCounterVec,
    tokens: IntCounter,
    generation_seconds: Histogram,
    benchmarks: IntCounter,
}

impl SessionMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("llm_session".into()), None)?;

        let loads = IntCounterVec::new(
            Opts::new("model_loads_total", "Model load attempts by outcome"),
            &["outcome"],
        )?;
        let generations = IntCounterVec::new(
            Opts::new("generations_total", "Finished generations by finish reason"),
            &["finish_reason"],
        )?;
        let tokens = IntCounter::new("tokens_generated_total", "Token pieces streamed to clients")?;
        let generation_seconds = Histogram::with_opts(
            HistogramOpts::new("generation_duration_seconds", "Wall time per generation")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )?;
        let benchmarks = IntCounter::new("benchmarks_total", "Benchmark runs")?;

        registry.register(Box::new(loads.clone()))?;
        registry.register(Box::new(generations.clone()))?;
        registry.register(Box::new(tokens.clone()))?;
        registry.register(Box::new(generation_seconds.clone()))?;
        registry.register(Box::new(benchmarks.clone()))?;

        Ok(Self {
            registry,
            loads,
            generations,
            tokens,
            generation_seconds,
            benchmarks,
        })
    }

    pub fn record_load(&self, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        self.loads.with_label_values(&[outcome]).inc();
    }

    pub fn record_generation(&self, summary: &GenerationSummary, seconds: f64) {
        self.generations
            .with_label_values(&[summary.finish_reason.as_str()])
            .inc();
        self.tokens.inc_by(summary.completion_tokens as u64);
        if summary.finish_reason != FinishReason::NotLoaded {
            self.generation_seconds.observe(seconds);
        }
    }

    pub fn record_benchmark(&self) {
        self.benchmarks.inc();
    }

    /// Render every metric in the Prometheus text format.
    pub fn render(&self) -> prometheus::Result<String> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_values() {
        let metrics = SessionMetrics::new().unwrap();
        metrics.record_load(true);
        metrics.record_load(false);
        metrics.record_generation(
            &GenerationSummary {
                finish_reason: FinishReason::EndOfSequence,
                prompt_tokens: 2,
                completion_tokens: 5,
            },
            0.2,
        );

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"llm_session_model_loads_total{outcome="ok"} 1"#));
        assert!(text.contains(r#"llm_session_model_loads_total{outcome="error"} 1"#));
        assert!(text.contains(r#"llm_session_generations_total{finish_reason="stop"} 1"#));
        assert!(text.contains("llm_session_tokens_generated_total 5"));
        assert!(text.contains("llm_session_generation_duration_seconds_count 1"));
    }

    #[test]
    fn test_not_loaded_skips_duration() {
        let metrics = SessionMetrics::new().unwrap();
        metrics.record_generation(
            &GenerationSummary {
                finish_reason: FinishReason::NotLoaded,
                prompt_tokens: 0,
                completion_tokens: 0,
            },
            0.0,
        );
        let text = metrics.render().unwrap();
        assert!(text.contains(r#"finish_reason="not_loaded"} 1"#));
        assert!(text.contains("llm_session_generation_duration_seconds_count 0"));
    }
}
