//! YAML benchmark definitions.
//!
//! The YAML surface is a thin, declarative skin over the builder API: it
//! names phases, their arrival models, dependencies and windows, and spells
//! scenarios as lists of tagged steps. Parsing yields a fully validated
//! [`Benchmark`]; every structural problem is reported here, before anything
//! runs.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::benchmark::Benchmark;
use crate::errors::BenchmarkError;
use crate::phase::{ArrivalSpec, Phase};
use crate::scenario::{Registry, Scenario, Sequence, Step};
use crate::steps::{
    AddSharedCounterStep, AddToIntStep, AwaitIntStep, AwaitSharedCounterStep, DelayStep,
    DelayTime, FailStep, HttpRequestStep, IntCondition, IntSource, NewSequenceStep,
    PollSharedQueueStep, PushSharedQueueStep, SetIntStep, SetSharedCounterStep, StopStep,
};
use crate::utils::parse_duration_string;

/// Errors raised while loading or converting a YAML benchmark.
#[derive(Error, Debug)]
pub enum YamlConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error(transparent)]
    Definition(#[from] BenchmarkError),
}

/// Duration field accepting either bare milliseconds or a suffixed string
/// ("250ms", "10s", "5m").
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum YamlDuration {
    Millis(u64),
    Text(String),
}

impl YamlDuration {
    pub fn to_ms(&self) -> Result<u64, YamlConfigError> {
        match self {
            YamlDuration::Millis(ms) => Ok(*ms),
            YamlDuration::Text(text) => parse_duration_string(text)
                .map(|d| d.as_millis() as u64)
                .map_err(|e| YamlConfigError::Validation(format!("Invalid duration '{text}': {e}"))),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct YamlAgent {
    pub name: String,
}

/// Arrival model selection, tagged by `model`.
#[derive(Debug, Deserialize)]
#[serde(tag = "model", rename_all = "camelCase")]
pub enum YamlArrival {
    #[serde(rename_all = "camelCase")]
    AtOnce { users: u64 },

    #[serde(rename_all = "camelCase")]
    Always { users: u64 },

    #[serde(rename_all = "camelCase")]
    ConstantPerSec { users_per_sec: u64, max_sessions: u64 },

    #[serde(rename_all = "camelCase")]
    RampPerSec {
        initial_users_per_sec: u64,
        target_users_per_sec: u64,
        max_sessions: u64,
    },

    #[serde(rename_all = "camelCase")]
    Sequentially { repeats: u64 },
}

impl YamlArrival {
    fn to_spec(&self) -> ArrivalSpec {
        match *self {
            YamlArrival::AtOnce { users } => ArrivalSpec::AtOnce { users },
            YamlArrival::Always { users } => ArrivalSpec::Always { users },
            YamlArrival::ConstantPerSec {
                users_per_sec,
                max_sessions,
            } => ArrivalSpec::ConstantPerSec {
                users_per_sec,
                max_sessions,
            },
            YamlArrival::RampPerSec {
                initial_users_per_sec,
                target_users_per_sec,
                max_sessions,
            } => ArrivalSpec::RampPerSec {
                initial_users_per_sec,
                target_users_per_sec,
                max_sessions,
            },
            YamlArrival::Sequentially { repeats } => ArrivalSpec::Sequentially { repeats },
        }
    }
}

/// Comparison clause used by the await steps. Exactly one bound may be set;
/// none means "just wait until the value is set".
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YamlIntCondition {
    pub equal_to: Option<i64>,
    pub not_equal_to: Option<i64>,
    pub greater_than: Option<i64>,
    pub greater_or_equal_to: Option<i64>,
    pub less_than: Option<i64>,
    pub less_or_equal_to: Option<i64>,
}

impl YamlIntCondition {
    fn to_condition(&self) -> Result<Option<IntCondition>, YamlConfigError> {
        let candidates = [
            self.equal_to.map(IntCondition::EqualTo),
            self.not_equal_to.map(IntCondition::NotEqualTo),
            self.greater_than.map(IntCondition::GreaterThan),
            self.greater_or_equal_to.map(IntCondition::GreaterOrEqualTo),
            self.less_than.map(IntCondition::LessThan),
            self.less_or_equal_to.map(IntCondition::LessOrEqualTo),
        ];
        let mut set = candidates.into_iter().flatten();
        let first = set.next();
        if set.next().is_some() {
            return Err(YamlConfigError::Validation(
                "at most one comparison may be set on a condition".to_string(),
            ));
        }
        Ok(first)
    }
}

/// Await clause on a session variable.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YamlAwaitInt {
    pub var: String,

    #[serde(flatten)]
    pub condition: YamlIntCondition,
}

/// Await clause on a shared counter.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YamlAwaitSharedCounter {
    pub key: String,

    #[serde(flatten)]
    pub condition: YamlIntCondition,
}

/// One step, externally tagged by its kind.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum YamlStep {
    #[serde(rename_all = "camelCase")]
    Delay {
        duration: Option<YamlDuration>,
        min: Option<YamlDuration>,
        max: Option<YamlDuration>,
    },

    #[serde(rename_all = "camelCase")]
    HttpRequest {
        method: String,
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        body: Option<String>,
        status_var: String,
    },

    AwaitInt(YamlAwaitInt),

    #[serde(rename_all = "camelCase")]
    SetInt {
        var: String,
        value: Option<i64>,
        from_var: Option<String>,
        from_counter: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    AddToInt { var: String, delta: i64 },

    #[serde(rename_all = "camelCase")]
    SetSharedCounter {
        key: String,
        value: Option<i64>,
        from_var: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    AddSharedCounter { key: String, delta: i64 },

    AwaitSharedCounter(YamlAwaitSharedCounter),

    #[serde(rename_all = "camelCase")]
    PushSharedQueue { key: String, from_var: String },

    #[serde(rename_all = "camelCase")]
    PollSharedQueue { key: String, into_var: String },

    #[serde(rename_all = "camelCase")]
    NewSequence { template: String },

    Fail { message: String },

    Stop,
}

impl YamlStep {
    fn build(&self, registry: &mut Registry) -> Result<Arc<dyn Step>, YamlConfigError> {
        match self {
            YamlStep::Delay { duration, min, max } => {
                let delay = match (duration, min, max) {
                    (Some(fixed), None, None) => {
                        DelayTime::Fixed(std::time::Duration::from_millis(fixed.to_ms()?))
                    }
                    (None, Some(min), Some(max)) => DelayTime::Random {
                        min: std::time::Duration::from_millis(min.to_ms()?),
                        max: std::time::Duration::from_millis(max.to_ms()?),
                    },
                    _ => {
                        return Err(YamlConfigError::Validation(
                            "delay needs either 'duration' or both 'min' and 'max'".to_string(),
                        ))
                    }
                };
                Ok(Arc::new(DelayStep::new(registry, delay)))
            }
            YamlStep::HttpRequest {
                method,
                url,
                headers,
                body,
                status_var,
            } => {
                let mut step = HttpRequestStep::new(registry, method, url, status_var);
                for (name, value) in headers {
                    step = step.with_header(name, value);
                }
                if let Some(body) = body {
                    step = step.with_body(body);
                }
                Ok(Arc::new(step))
            }
            YamlStep::AwaitInt(await_int) => Ok(Arc::new(AwaitIntStep::new(
                registry.var(&await_int.var),
                await_int.condition.to_condition()?,
            ))),
            YamlStep::SetInt {
                var,
                value,
                from_var,
                from_counter,
            } => {
                let source = int_source(registry, *value, from_var, from_counter)?;
                Ok(Arc::new(SetIntStep::new(registry.var(var), source)))
            }
            YamlStep::AddToInt { var, delta } => {
                Ok(Arc::new(AddToIntStep::new(registry.var(var), *delta)))
            }
            YamlStep::SetSharedCounter {
                key,
                value,
                from_var,
            } => {
                let source = int_source(registry, *value, from_var, &None)?;
                Ok(Arc::new(SetSharedCounterStep::new(registry, key, source)))
            }
            YamlStep::AddSharedCounter { key, delta } => {
                Ok(Arc::new(AddSharedCounterStep::new(registry, key, *delta)))
            }
            YamlStep::AwaitSharedCounter(await_counter) => {
                let condition = await_counter.condition.to_condition()?.ok_or_else(|| {
                    YamlConfigError::Validation(
                        "awaitSharedCounter requires a comparison".to_string(),
                    )
                })?;
                Ok(Arc::new(AwaitSharedCounterStep::new(
                    registry,
                    &await_counter.key,
                    condition,
                )))
            }
            YamlStep::PushSharedQueue { key, from_var } => {
                let from = registry.var(from_var);
                Ok(Arc::new(PushSharedQueueStep::new(registry, key, from)))
            }
            YamlStep::PollSharedQueue { key, into_var } => {
                let into = registry.var(into_var);
                Ok(Arc::new(PollSharedQueueStep::new(registry, key, into)))
            }
            YamlStep::NewSequence { template } => Ok(Arc::new(NewSequenceStep::new(template))),
            YamlStep::Fail { message } => Ok(Arc::new(FailStep::new(message))),
            YamlStep::Stop => Ok(Arc::new(StopStep)),
        }
    }
}

fn int_source(
    registry: &mut Registry,
    value: Option<i64>,
    from_var: &Option<String>,
    from_counter: &Option<String>,
) -> Result<IntSource, YamlConfigError> {
    match (value, from_var, from_counter) {
        (Some(value), None, None) => Ok(IntSource::Value(value)),
        (None, Some(var), None) => Ok(IntSource::FromVar(registry.var(var))),
        (None, None, Some(counter)) => {
            Ok(IntSource::FromCounter(registry.shared_counter(counter)))
        }
        _ => Err(YamlConfigError::Validation(
            "exactly one of 'value', 'fromVar', 'fromCounter' must be set".to_string(),
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct YamlSequence {
    pub name: String,
    pub steps: Vec<YamlStep>,
}

impl YamlSequence {
    fn build(&self, registry: &mut Registry) -> Result<Sequence, YamlConfigError> {
        let steps = self
            .steps
            .iter()
            .map(|s| s.build(registry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Sequence::new(&self.name, steps))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YamlScenario {
    pub initial_sequences: Vec<YamlSequence>,

    #[serde(default)]
    pub templates: Vec<YamlSequence>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YamlPhase {
    pub name: String,
    pub arrival: YamlArrival,
    pub scenario: YamlScenario,
    pub duration: Option<YamlDuration>,
    pub max_duration: Option<YamlDuration>,
    pub start_time: Option<YamlDuration>,

    #[serde(default)]
    pub start_after: Vec<String>,

    #[serde(default)]
    pub start_after_strict: Vec<String>,

    #[serde(default)]
    pub terminate_after_strict: Vec<String>,
}

impl YamlPhase {
    fn build(&self, registry: &mut Registry) -> Result<Phase, YamlConfigError> {
        let initial = self
            .scenario
            .initial_sequences
            .iter()
            .map(|s| s.build(registry))
            .collect::<Result<Vec<_>, _>>()?;
        let mut scenario = Scenario::new(&self.name, initial);
        for template in &self.scenario.templates {
            scenario = scenario.with_template(template.build(registry)?);
        }

        let mut phase = Phase::new(&self.name, Arc::new(scenario), self.arrival.to_spec());
        if let Some(duration) = &self.duration {
            phase = phase.with_duration(duration.to_ms()?);
        }
        if let Some(max_duration) = &self.max_duration {
            phase = phase.with_max_duration(max_duration.to_ms()?);
        }
        if let Some(start_time) = &self.start_time {
            phase = phase.with_start_time(start_time.to_ms()?);
        }
        phase.start_after = self.start_after.clone();
        phase.start_after_strict = self.start_after_strict.clone();
        phase.terminate_after_strict = self.terminate_after_strict.clone();
        Ok(phase)
    }
}

/// Root of a YAML benchmark file.
#[derive(Debug, Deserialize)]
pub struct YamlBenchmark {
    pub name: String,

    #[serde(default)]
    pub agents: Vec<YamlAgent>,

    pub phases: Vec<YamlPhase>,
}

impl YamlBenchmark {
    pub fn from_str(contents: &str) -> Result<Self, YamlConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, YamlConfigError> {
        Self::from_str(&std::fs::read_to_string(path)?)
    }

    /// Convert into a validated [`Benchmark`].
    pub fn into_benchmark(self) -> Result<Benchmark, YamlConfigError> {
        let mut registry = Registry::new();
        let mut builder = Benchmark::builder(&self.name);
        for agent in &self.agents {
            builder = builder.agent(&agent.name);
        }
        for phase in &self.phases {
            builder = builder.phase(phase.build(&mut registry)?);
        }
        Ok(builder.build(registry)?)
    }
}

/// Load and validate a benchmark from YAML text.
pub fn load_benchmark(contents: &str) -> Result<Benchmark, YamlConfigError> {
    YamlBenchmark::from_str(contents)?.into_benchmark()
}
