//! Progress reporting.
//!
//! The executor drives a [`ProgressSink`] with an aggregate fraction in
//! `0..1`. Shares are assigned up front: the install span is divided
//! evenly over the components, a component's slice evenly over its
//! operations, and an operation that reports intermediate progress scales
//! it within its own slice.

/// Where progress goes. The CLI renders it with a progress bar; tests
/// record it.
pub trait ProgressSink {
    fn progress(&mut self, fraction: f64);
    fn message(&mut self, text: &str);
}

/// Discards everything.
#[derive(Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn progress(&mut self, _fraction: f64) {}
    fn message(&mut self, _text: &str) {}
}

/// Maps per-operation progress into the run-wide fraction.
pub struct Aggregator<'a> {
    sink: &'a mut dyn ProgressSink,
    /// Start of the span this aggregator covers (downloads may have used
    /// the range before it).
    base: f64,
    span: f64,
    component_span: f64,
    op_span: f64,
    completed: f64,
}

impl<'a> Aggregator<'a> {
    pub fn new(sink: &'a mut dyn ProgressSink, base: f64, span: f64, components: usize) -> Self {
        Self {
            sink,
            base,
            span,
            component_span: if components == 0 {
                0.0
            } else {
                span / components as f64
            },
            op_span: 0.0,
            completed: 0.0,
        }
    }

    pub fn begin_component(&mut self, name: &str, op_count: usize) {
        self.sink.message(name);
        self.op_span = if op_count == 0 {
            self.component_span
        } else {
            self.component_span / op_count as f64
        };
    }

    /// Intermediate progress of the running operation, `0..1` within its
    /// own share.
    pub fn operation_progress(&mut self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        self.sink
            .progress(self.base + self.completed + fraction * self.op_span);
    }

    pub fn operation_completed(&mut self) {
        self.completed = (self.completed + self.op_span).min(self.span);
        self.sink.progress(self.base + self.completed);
    }

    /// A component with no operations still advances the bar.
    pub fn component_completed(&mut self) {
        self.sink.progress(self.base + self.completed);
    }

    pub fn message(&mut self, text: &str) {
        self.sink.message(text);
    }
}

#[cfg(test)]
mod tests {
    use super::{Aggregator, ProgressSink};

    #[derive(Default)]
    struct Recorder {
        fractions: Vec<f64>,
    }

    impl ProgressSink for Recorder {
        fn progress(&mut self, fraction: f64) {
            self.fractions.push(fraction);
        }
        fn message(&mut self, _text: &str) {}
    }

    #[test]
    fn shares_divide_span_by_component_and_op() {
        let mut recorder = Recorder::default();
        let mut agg = Aggregator::new(&mut recorder, 0.0, 1.0, 2);
        agg.begin_component("a", 2);
        agg.operation_progress(0.5);
        agg.operation_completed();
        agg.operation_completed();
        agg.begin_component("b", 1);
        agg.operation_completed();

        let last = *recorder.fractions.last().unwrap();
        assert!((last - 1.0).abs() < 1e-9);
        assert!((recorder.fractions[0] - 0.125).abs() < 1e-9);
        assert!((recorder.fractions[1] - 0.25).abs() < 1e-9);
        // Monotonic.
        for pair in recorder.fractions.windows(2) {
            assert!(pair[1] >= pair[0] - 1e-9);
        }
    }

    #[test]
    fn download_phase_offsets_the_base() {
        let mut recorder = Recorder::default();
        let mut agg = Aggregator::new(&mut recorder, 1.0 / 3.0, 2.0 / 3.0, 1);
        agg.begin_component("only", 1);
        agg.operation_progress(0.0);
        assert!((recorder.fractions[0] - 1.0 / 3.0).abs() < 1e-9);
    }
}
