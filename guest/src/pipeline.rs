//! Ordered step driver.
//!
//! Each step reports [`StepOutcome`]. Recoverable outcomes are logged and
//! the pipeline carries on; the first fatal outcome stops it.

use crate::BootError;
use std::time::Instant;

#[derive(Debug)]
pub enum StepOutcome {
    Ok,
    Recoverable(String),
    Fatal(BootError),
}

impl StepOutcome {
    /// Any error is fatal.
    pub fn fatal_on<T>(result: Result<T, BootError>) -> Self {
        match result {
            Ok(_) => StepOutcome::Ok,
            Err(e) => StepOutcome::Fatal(e),
        }
    }

    /// Any error is logged and tolerated.
    pub fn recoverable_on<T>(result: Result<T, BootError>) -> Self {
        match result {
            Ok(_) => StepOutcome::Ok,
            Err(e) => StepOutcome::Recoverable(e.to_string()),
        }
    }
}

type StepFn<'a> = Box<dyn FnOnce() -> StepOutcome + 'a>;

/// Steps that finished degraded, in execution order.
#[derive(Debug, Default)]
pub struct PipelineReport {
    pub degraded: Vec<(String, String)>,
}

pub struct Pipeline<'a> {
    stage: &'static str,
    steps: Vec<(&'static str, StepFn<'a>)>,
}

impl<'a> Pipeline<'a> {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, name: &'static str, f: impl FnOnce() -> StepOutcome + 'a) -> Self {
        self.steps.push((name, Box::new(f)));
        self
    }

    pub fn run(self) -> Result<PipelineReport, BootError> {
        let mut report = PipelineReport::default();
        let stage = self.stage;

        for (name, step) in self.steps {
            tracing::info!(stage, step = name, "starting");
            let started = Instant::now();

            match step() {
                StepOutcome::Ok => {
                    tracing::info!(stage, step = name, elapsed_ms = started.elapsed().as_millis() as u64, "done");
                }
                StepOutcome::Recoverable(reason) => {
                    tracing::warn!(stage, step = name, "degraded, continuing: {}", reason);
                    report.degraded.push((name.to_string(), reason));
                }
                StepOutcome::Fatal(err) => {
                    tracing::error!(stage, step = name, "fatal: {}", err);
                    return Err(BootError::Step {
                        step: name.to_string(),
                        source: Box::new(err),
                    });
                }
            }
        }

        Ok(report)
    }
}
