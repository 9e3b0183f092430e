use std::{collections::HashSet, fmt};

use serde::{Deserialize, Serialize};

use crate::{AddressMapper, ValidationError};

/// The four firing patterns a cue can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CueKind {
    #[serde(rename = "SINGLE SHOT")]
    SingleShot,
    #[serde(rename = "DOUBLE SHOT")]
    DoubleShot,
    #[serde(rename = "SINGLE RUN")]
    SingleRun,
    #[serde(rename = "DOUBLE RUN")]
    DoubleRun,
}

impl CueKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::SingleShot => "SINGLE SHOT",
            Self::DoubleShot => "DOUBLE SHOT",
            Self::SingleRun => "SINGLE RUN",
            Self::DoubleRun => "DOUBLE RUN",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_uppercase().as_str() {
            "SINGLE SHOT" => Some(Self::SingleShot),
            "DOUBLE SHOT" => Some(Self::DoubleShot),
            "SINGLE RUN" => Some(Self::SingleRun),
            "DOUBLE RUN" => Some(Self::DoubleRun),
            _ => None,
        }
    }

    pub fn is_run(&self) -> bool {
        matches!(self, Self::SingleRun | Self::DoubleRun)
    }
}

impl fmt::Display for CueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Inclusive, ascending range of output numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRange {
    start: u32,
    end: u32,
}

impl OutputRange {
    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn len(&self) -> usize {
        (u64::from(self.end) - u64::from(self.start) + 1) as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> {
        self.start..=self.end
    }

    pub fn nth(&self, index: usize) -> Option<u32> {
        (index < self.len()).then(|| self.start + index as u32)
    }
}

/// What a cue fires, per kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CueAction {
    SingleShot { output: u32 },
    DoubleShot { first: u32, second: u32 },
    SingleRun { range: OutputRange },
    DoubleRun { first: OutputRange, second: OutputRange },
}

impl CueAction {
    pub fn kind(&self) -> CueKind {
        match self {
            Self::SingleShot { .. } => CueKind::SingleShot,
            Self::DoubleShot { .. } => CueKind::DoubleShot,
            Self::SingleRun { .. } => CueKind::SingleRun,
            Self::DoubleRun { .. } => CueKind::DoubleRun,
        }
    }

    /// Shot outputs and run endpoints, without expanding the runs.
    pub fn endpoints(&self) -> Vec<u32> {
        match self {
            Self::SingleShot { output } => vec![*output],
            Self::DoubleShot { first, second } => vec![*first, *second],
            Self::SingleRun { range } => vec![range.start, range.end],
            Self::DoubleRun { first, second } => {
                vec![first.start, first.end, second.start, second.end]
            }
        }
    }
}

/// One instant inside a cue at which a set of outputs is energized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CueTick {
    /// Offset from the cue's own target time.
    pub offset_ms: u64,
    pub outputs: Vec<u32>,
}

/// A timed firing instruction. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cue {
    id: String,
    target_time_ms: u64,
    inter_output_delay_ms: u32,
    pulse_duration_ms: u32,
    action: CueAction,
}

impl Cue {
    pub fn new(
        id: impl Into<String>,
        target_time_ms: u64,
        action: CueAction,
    ) -> Result<Self, ValidationError> {
        let id = id.into();
        let ranges: Vec<&OutputRange> = match &action {
            CueAction::SingleRun { range } => vec![range],
            CueAction::DoubleRun { first, second } => vec![first, second],
            _ => Vec::new(),
        };
        if let Some(range) = ranges.iter().find(|range| range.start > range.end) {
            return Err(ValidationError::ReversedRange {
                cue: id,
                start: range.start,
                end: range.end,
            });
        }

        Ok(Self {
            id,
            target_time_ms,
            inter_output_delay_ms: 0,
            pulse_duration_ms: 0,
            action,
        })
    }

    pub fn single_shot(id: impl Into<String>, target_time_ms: u64, output: u32) -> Self {
        Self {
            id: id.into(),
            target_time_ms,
            inter_output_delay_ms: 0,
            pulse_duration_ms: 0,
            action: CueAction::SingleShot { output },
        }
    }

    pub fn double_shot(id: impl Into<String>, target_time_ms: u64, first: u32, second: u32) -> Self {
        Self {
            id: id.into(),
            target_time_ms,
            inter_output_delay_ms: 0,
            pulse_duration_ms: 0,
            action: CueAction::DoubleShot { first, second },
        }
    }

    pub fn single_run(
        id: impl Into<String>,
        target_time_ms: u64,
        start: u32,
        end: u32,
        delay_ms: u32,
    ) -> Result<Self, ValidationError> {
        Ok(Self::new(
            id,
            target_time_ms,
            CueAction::SingleRun {
                range: OutputRange { start, end },
            },
        )?
        .with_delay(delay_ms))
    }

    pub fn double_run(
        id: impl Into<String>,
        target_time_ms: u64,
        first: (u32, u32),
        second: (u32, u32),
        delay_ms: u32,
    ) -> Result<Self, ValidationError> {
        Ok(Self::new(
            id,
            target_time_ms,
            CueAction::DoubleRun {
                first: OutputRange {
                    start: first.0,
                    end: first.1,
                },
                second: OutputRange {
                    start: second.0,
                    end: second.1,
                },
            },
        )?
        .with_delay(delay_ms))
    }

    pub fn with_delay(mut self, delay_ms: u32) -> Self {
        self.inter_output_delay_ms = delay_ms;
        self
    }

    pub fn with_pulse(mut self, pulse_ms: u32) -> Self {
        self.pulse_duration_ms = pulse_ms;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> CueKind {
        self.action.kind()
    }

    pub fn action(&self) -> &CueAction {
        &self.action
    }

    pub fn target_time_ms(&self) -> u64 {
        self.target_time_ms
    }

    pub fn inter_output_delay_ms(&self) -> u32 {
        self.inter_output_delay_ms
    }

    pub fn pulse_duration_ms(&self) -> u32 {
        self.pulse_duration_ms
    }

    /// Firing schedule relative to the cue's target time.
    ///
    /// Runs advance one output per tick; a double run advances both ranges
    /// in lock-step and keeps going with whichever range is longer.
    pub fn ticks(&self) -> Vec<CueTick> {
        let delay = u64::from(self.inter_output_delay_ms);
        match &self.action {
            CueAction::SingleShot { output } => vec![CueTick {
                offset_ms: 0,
                outputs: vec![*output],
            }],
            CueAction::DoubleShot { first, second } => vec![CueTick {
                offset_ms: 0,
                outputs: vec![*first, *second],
            }],
            CueAction::SingleRun { range } => range
                .iter()
                .enumerate()
                .map(|(i, output)| CueTick {
                    offset_ms: i as u64 * delay,
                    outputs: vec![output],
                })
                .collect(),
            CueAction::DoubleRun { first, second } => (0..first.len().max(second.len()))
                .map(|i| CueTick {
                    offset_ms: i as u64 * delay,
                    outputs: first.nth(i).into_iter().chain(second.nth(i)).collect(),
                })
                .collect(),
        }
    }

    /// Every output in firing order.
    pub fn outputs(&self) -> Vec<u32> {
        self.ticks()
            .into_iter()
            .flat_map(|tick| tick.outputs)
            .collect()
    }

    /// Largest number of outputs energized at the same instant.
    pub fn simultaneous_outputs(&self) -> usize {
        let ticks = self.ticks();
        let mut peak = 0;
        let mut index = 0;
        while index < ticks.len() {
            let offset = ticks[index].offset_ms;
            let count: usize = ticks[index..]
                .iter()
                .take_while(|tick| tick.offset_ms == offset)
                .map(|tick| tick.outputs.len())
                .sum();
            let span = ticks[index..]
                .iter()
                .take_while(|tick| tick.offset_ms == offset)
                .count();
            peak = peak.max(count);
            index += span;
        }
        peak
    }

    /// Time from the first to the last tick.
    pub fn span_ms(&self) -> u64 {
        self.ticks().last().map(|tick| tick.offset_ms).unwrap_or(0)
    }
}

/// Structural and safety checks shared by show loading and test fires.
#[derive(Debug, Clone, Copy)]
pub struct CueValidator {
    mapper: AddressMapper,
    max_simultaneous: usize,
}

impl CueValidator {
    pub fn new(mapper: AddressMapper, max_simultaneous: usize) -> Self {
        Self {
            mapper,
            max_simultaneous,
        }
    }

    pub fn validate(&self, cue: &Cue) -> Result<(), ValidationError> {
        // bounded ranges before anything expands them into ticks
        for output in cue.action.endpoints() {
            self.check_bounds(cue, output)?;
        }

        let outputs = cue.outputs();
        let mut seen = HashSet::with_capacity(outputs.len());
        for output in outputs {
            self.check_bounds(cue, output)?;
            if !seen.insert(output) {
                return Err(ValidationError::DuplicateOutput {
                    cue: cue.id.clone(),
                    output,
                });
            }
        }

        let count = cue.simultaneous_outputs();
        if count > self.max_simultaneous {
            return Err(ValidationError::TooManySimultaneous {
                cue: cue.id.clone(),
                count,
                limit: self.max_simultaneous,
            });
        }
        Ok(())
    }

    fn check_bounds(&self, cue: &Cue, output: u32) -> Result<(), ValidationError> {
        if self.mapper.contains(output) {
            Ok(())
        } else {
            Err(ValidationError::OutputOutOfRange {
                cue: cue.id.clone(),
                output,
                total: self.mapper.total_outputs(),
            })
        }
    }
}

/// One cue as it appears in a show file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCue {
    #[serde(default, alias = "cue_id", alias = "cue_number")]
    pub id: Option<serde_json::Value>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub time: Option<u64>,
    pub output: Option<u32>,
    pub output1: Option<u32>,
    pub output2: Option<u32>,
    pub start_output: Option<u32>,
    pub end_output: Option<u32>,
    pub start_output1: Option<u32>,
    pub end_output1: Option<u32>,
    pub start_output2: Option<u32>,
    pub end_output2: Option<u32>,
    pub delay: Option<u32>,
    pub duration: Option<u32>,
}

impl RawCue {
    /// Builds a [`Cue`], using the 1-based `position` as id when none is given.
    pub fn into_cue(self, position: usize, default_pulse_ms: u32) -> Result<Cue, ValidationError> {
        let id = match &self.id {
            Some(serde_json::Value::String(id)) => id.clone(),
            Some(serde_json::Value::Null) | None => position.to_string(),
            Some(other) => other.to_string(),
        };

        let label = self.kind.clone().ok_or_else(|| ValidationError::MissingField {
            cue: id.clone(),
            kind: "cue".to_string(),
            field: "type",
        })?;
        let kind = CueKind::parse(&label).ok_or_else(|| ValidationError::UnknownKind {
            cue: id.clone(),
            kind: label,
        })?;

        let require = |value: Option<u32>, field: &'static str| {
            value.ok_or_else(|| ValidationError::MissingField {
                cue: id.clone(),
                kind: kind.label().to_string(),
                field,
            })
        };

        let time = self.time.ok_or_else(|| ValidationError::MissingField {
            cue: id.clone(),
            kind: kind.label().to_string(),
            field: "time",
        })?;
        let action = match kind {
            CueKind::SingleShot => CueAction::SingleShot {
                output: require(self.output, "output")?,
            },
            CueKind::DoubleShot => CueAction::DoubleShot {
                first: require(self.output1, "output1")?,
                second: require(self.output2, "output2")?,
            },
            CueKind::SingleRun => CueAction::SingleRun {
                range: OutputRange {
                    start: require(self.start_output, "start_output")?,
                    end: require(self.end_output, "end_output")?,
                },
            },
            CueKind::DoubleRun => CueAction::DoubleRun {
                first: OutputRange {
                    start: require(self.start_output1, "start_output1")?,
                    end: require(self.end_output1, "end_output1")?,
                },
                second: OutputRange {
                    start: require(self.start_output2, "start_output2")?,
                    end: require(self.end_output2, "end_output2")?,
                },
            },
        };
        let delay = if kind.is_run() {
            require(self.delay, "delay")?
        } else {
            0
        };

        Ok(Cue::new(id, time, action)?
            .with_delay(delay)
            .with_pulse(self.duration.unwrap_or(default_pulse_ms)))
    }
}
