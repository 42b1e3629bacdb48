use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use uuid::Uuid;

/// Phases a request moves through; each gets its own latency histogram.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Phase {
    Receive,
    Build,
    Deploy,
    EndToEnd,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Receive => "receive",
            Phase::Build => "build",
            Phase::Deploy => "deploy",
            Phase::EndToEnd => "end_to_end",
        }
    }
}

/// Counted occurrences across the pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CounterEvent {
    CommandReceived,
    CommandAccepted,
    CommandRejected,
    JobCreated,
    JobSucceeded,
    JobFailed,
    ServiceCreated,
    ServiceUpdated,
    ServiceDeleted,
}

/// MetricsRecorder: counters and per-phase histograms, with optional exemplar
/// trace ids attached to observations so aggregate latency can be traced back
/// to one causal chain. Spans themselves are opened by the ingress and
/// propagated via the correlation id in tracing fields, not through here.
pub trait MetricsRecorder: Send + Sync {
    fn inc(&self, event: CounterEvent);
    fn observe_phase(&self, phase: Phase, runtime: Option<&str>, duration: Duration, exemplar: Option<Uuid>);
}

const EXEMPLARS_PER_PHASE: usize = 10;

/// Prometheus-backed recorder exposed on the ops `/metrics` endpoint.
pub struct StdMetricsRecorder {
    registry: Registry,
    commands: IntCounterVec,
    build_jobs: IntCounterVec,
    services: IntCounterVec,
    phase_durations: HistogramVec,
    exemplars: Mutex<HashMap<Phase, VecDeque<Uuid>>>,
}

impl StdMetricsRecorder {
    pub fn new() -> Self {
        let registry = Registry::new();

        let commands = IntCounterVec::new(
            Opts::new("lambda_commands_total", "Commands by outcome"),
            &["outcome"],
        )
        .expect("static metric definition");
        let build_jobs = IntCounterVec::new(
            Opts::new("lambda_build_jobs_total", "Build jobs by outcome"),
            &["outcome"],
        )
        .expect("static metric definition");
        let services = IntCounterVec::new(
            Opts::new("lambda_services_total", "Service mutations by outcome"),
            &["outcome"],
        )
        .expect("static metric definition");
        let phase_durations = HistogramVec::new(
            HistogramOpts::new("lambda_phase_duration_seconds", "Latency per pipeline phase").buckets(vec![
                0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1800.0,
            ]),
            &["phase", "runtime"],
        )
        .expect("static metric definition");

        registry.register(Box::new(commands.clone())).expect("register commands");
        registry.register(Box::new(build_jobs.clone())).expect("register jobs");
        registry.register(Box::new(services.clone())).expect("register services");
        registry
            .register(Box::new(phase_durations.clone()))
            .expect("register phases");

        StdMetricsRecorder {
            registry,
            commands,
            build_jobs,
            services,
            phase_durations,
            exemplars: Mutex::new(HashMap::new()),
        }
    }

    /// Text exposition for the ops endpoint.
    pub fn encode_text(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buffer) {
            error!("cannot encode metrics: {}", err);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Most recent exemplar trace ids for a phase, newest last.
    pub fn exemplars(&self, phase: Phase) -> Vec<Uuid> {
        let exemplars = self.exemplars.lock().expect("exemplars lock poisoned");
        exemplars.get(&phase).map(|ring| ring.iter().copied().collect()).unwrap_or_default()
    }

    #[cfg(test)]
    fn counter_value(&self, event: CounterEvent) -> u64 {
        let (vec, outcome) = self.route(event);
        vec.with_label_values(&[outcome]).get()
    }

    fn route(&self, event: CounterEvent) -> (&IntCounterVec, &'static str) {
        match event {
            CounterEvent::CommandReceived => (&self.commands, "received"),
            CounterEvent::CommandAccepted => (&self.commands, "accepted"),
            CounterEvent::CommandRejected => (&self.commands, "rejected"),
            CounterEvent::JobCreated => (&self.build_jobs, "created"),
            CounterEvent::JobSucceeded => (&self.build_jobs, "succeeded"),
            CounterEvent::JobFailed => (&self.build_jobs, "failed"),
            CounterEvent::ServiceCreated => (&self.services, "created"),
            CounterEvent::ServiceUpdated => (&self.services, "updated"),
            CounterEvent::ServiceDeleted => (&self.services, "deleted"),
        }
    }
}

impl Default for StdMetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder for StdMetricsRecorder {
    fn inc(&self, event: CounterEvent) {
        let (vec, outcome) = self.route(event);
        vec.with_label_values(&[outcome]).inc();
    }

    fn observe_phase(&self, phase: Phase, runtime: Option<&str>, duration: Duration, exemplar: Option<Uuid>) {
        self.phase_durations
            .with_label_values(&[phase.as_str(), runtime.unwrap_or("")])
            .observe(duration.as_secs_f64());

        if let Some(trace_id) = exemplar {
            let mut exemplars = self.exemplars.lock().expect("exemplars lock poisoned");
            let ring = exemplars.entry(phase).or_default();
            if ring.len() == EXEMPLARS_PER_PHASE {
                ring.pop_front();
            }
            ring.push_back(trace_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment_by_outcome() {
        let recorder = StdMetricsRecorder::new();

        recorder.inc(CounterEvent::CommandReceived);
        recorder.inc(CounterEvent::CommandReceived);
        recorder.inc(CounterEvent::CommandAccepted);
        recorder.inc(CounterEvent::JobFailed);

        assert_eq!(recorder.counter_value(CounterEvent::CommandReceived), 2);
        assert_eq!(recorder.counter_value(CounterEvent::CommandAccepted), 1);
        assert_eq!(recorder.counter_value(CounterEvent::CommandRejected), 0);
        assert_eq!(recorder.counter_value(CounterEvent::JobFailed), 1);
    }

    #[test]
    fn test_exemplar_ring_is_bounded() {
        let recorder = StdMetricsRecorder::new();

        let mut last = Uuid::nil();
        for _ in 0..(EXEMPLARS_PER_PHASE + 5) {
            last = Uuid::new_v4();
            recorder.observe_phase(Phase::Build, Some("python"), Duration::from_secs(1), Some(last));
        }

        let exemplars = recorder.exemplars(Phase::Build);
        assert_eq!(exemplars.len(), EXEMPLARS_PER_PHASE);
        assert_eq!(*exemplars.last().expect("non-empty"), last);
    }

    #[test]
    fn test_text_exposition_contains_families() {
        let recorder = StdMetricsRecorder::new();
        recorder.inc(CounterEvent::ServiceCreated);
        recorder.observe_phase(Phase::EndToEnd, None, Duration::from_millis(120), None);

        let text = recorder.encode_text();
        assert!(text.contains("lambda_services_total"));
        assert!(text.contains("lambda_phase_duration_seconds"));
    }
}
