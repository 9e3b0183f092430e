use std::path::Path;

use serde::Deserialize;

use crate::{
    cue::{CueValidator, RawCue},
    Cue, Result, ShowError, ValidationError,
};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ShowDocument {
    List(Vec<RawCue>),
    Wrapped { cues: Vec<RawCue> },
}

/// A validated show, ordered by target time.
#[derive(Debug, Clone, Default)]
pub struct CuePlan {
    cues: Vec<Cue>,
}

impl CuePlan {
    /// Validates `cues` as a whole show.
    ///
    /// Any invalid cue rejects the entire plan. Cues past `max_cues` are
    /// dropped with a warning.
    pub fn new(
        mut cues: Vec<Cue>,
        validator: &CueValidator,
        max_cues: usize,
    ) -> std::result::Result<Self, ValidationError> {
        if cues.is_empty() {
            return Err(ValidationError::EmptyShow);
        }
        if cues.len() > max_cues {
            tracing::warn!(
                cues = cues.len(),
                max_cues,
                "show exceeds the cue limit, truncating"
            );
            cues.truncate(max_cues);
        }

        let mut previous_ms = 0;
        for (index, cue) in cues.iter().enumerate() {
            validator
                .validate(cue)
                .map_err(|source| ValidationError::InShow {
                    index,
                    source: Box::new(source),
                })?;
            if cue.target_time_ms() < previous_ms {
                return Err(ValidationError::Unsorted {
                    cue: cue.id().to_string(),
                    time_ms: cue.target_time_ms(),
                    previous_ms,
                });
            }
            previous_ms = cue.target_time_ms();
        }

        Ok(Self { cues })
    }

    /// Parses a show document (a bare array or `{"cues": [...]}`), sorting
    /// the cues by time before validation.
    pub fn parse_show(
        json: &str,
        validator: &CueValidator,
        max_cues: usize,
        default_pulse_ms: u32,
    ) -> Result<Self> {
        let document: ShowDocument = serde_json::from_str(json)
            .map_err(|err| ValidationError::Document(err.to_string()))?;
        let raw = match document {
            ShowDocument::List(cues) | ShowDocument::Wrapped { cues } => cues,
        };

        let mut cues = raw
            .into_iter()
            .enumerate()
            .map(|(index, cue)| {
                cue.into_cue(index + 1, default_pulse_ms)
                    .map_err(|source| ValidationError::InShow {
                        index,
                        source: Box::new(source),
                    })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        cues.sort_by_key(Cue::target_time_ms);

        Ok(Self::new(cues, validator, max_cues)?)
    }

    pub fn from_file(
        path: impl AsRef<Path>,
        validator: &CueValidator,
        max_cues: usize,
        default_pulse_ms: u32,
    ) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            ShowError::msg(format!("failed to read show file {}: {err}", path.display()))
        })?;
        Self::parse_show(&text, validator, max_cues, default_pulse_ms)
    }

    pub fn cues(&self) -> &[Cue] {
        &self.cues
    }

    pub fn get(&self, index: usize) -> Option<&Cue> {
        self.cues.get(index)
    }

    pub fn len(&self) -> usize {
        self.cues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cues.is_empty()
    }

    /// Offset of the last tick of the show.
    pub fn duration_ms(&self) -> u64 {
        self.cues
            .iter()
            .map(|cue| cue.target_time_ms() + cue.span_ms())
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::AddressMapper;

    fn validator() -> CueValidator {
        CueValidator::new(AddressMapper::default(), 4)
    }

    #[test]
    fn sorts_parsed_shows_by_time() {
        let json = r#"{"cues": [
            {"type": "SINGLE SHOT", "time": 900, "output": 3},
            {"type": "DOUBLE SHOT", "time": 100, "output1": 1, "output2": 2},
            {"type": "SINGLE RUN", "time": 400, "start_output": 10, "end_output": 12, "delay": 100}
        ]}"#;

        let plan = CuePlan::parse_show(json, &validator(), 1000, 500).unwrap();
        let times: Vec<u64> = plan.cues().iter().map(Cue::target_time_ms).collect();
        assert_eq!(times, vec![100, 400, 900]);
        assert_eq!(plan.get(0).unwrap().id(), "2");
        assert_eq!(plan.duration_ms(), 900);
    }

    #[test]
    fn accepts_bare_arrays_from_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"type": "SINGLE SHOT", "time": 0, "output": 1000}}]"#).unwrap();

        let plan = CuePlan::from_file(file.path(), &validator(), 1000, 500).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.cues()[0].pulse_duration_ms(), 500);
    }

    #[test]
    fn one_bad_cue_rejects_the_show() {
        let json = r#"[
            {"type": "SINGLE SHOT", "time": 0, "output": 1},
            {"type": "SINGLE SHOT", "time": 10, "output": 4000}
        ]"#;

        let err = CuePlan::parse_show(json, &validator(), 1000, 500).unwrap_err();
        match err {
            ShowError::Validation(ValidationError::InShow { index, source }) => {
                assert_eq!(index, 1);
                assert!(matches!(*source, ValidationError::OutputOutOfRange { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn oversized_run_ranges_reject_the_show() {
        let json = r#"[{"type": "DOUBLE RUN", "time": 0, "delay": 10,
            "start_output1": 0, "end_output1": 4294967295,
            "start_output2": 1, "end_output2": 1}]"#;
        let err = CuePlan::parse_show(json, &validator(), 1000, 500).unwrap_err();
        assert!(matches!(
            err,
            ShowError::Validation(ValidationError::InShow { index: 0, .. })
        ));

        let json = r#"[{"type": "SINGLE RUN", "time": 0, "delay": 10,
            "start_output": 1, "end_output": 5000000}]"#;
        // the endpoint is reported, not the first expanded output past the rig
        let err = CuePlan::parse_show(json, &validator(), 1000, 500).unwrap_err();
        match err {
            ShowError::Validation(ValidationError::InShow { source, .. }) => assert!(matches!(
                *source,
                ValidationError::OutputOutOfRange { output: 5_000_000, .. }
            )),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_unsorted_and_empty_lists() {
        let cues = vec![Cue::single_shot("a", 500, 1), Cue::single_shot("b", 100, 2)];
        assert!(matches!(
            CuePlan::new(cues, &validator(), 1000),
            Err(ValidationError::Unsorted { time_ms: 100, previous_ms: 500, .. })
        ));
        assert_eq!(
            CuePlan::new(Vec::new(), &validator(), 1000).unwrap_err(),
            ValidationError::EmptyShow
        );
    }

    #[test]
    fn truncates_to_the_cue_limit() {
        let cues = (0..5)
            .map(|i| Cue::single_shot(i.to_string(), i * 10, i as u32 + 1))
            .collect();
        let plan = CuePlan::new(cues, &validator(), 3).unwrap();
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn malformed_documents_are_validation_errors() {
        let err = CuePlan::parse_show(r#"{"show": 1}"#, &validator(), 1000, 500).unwrap_err();
        assert!(matches!(
            err,
            ShowError::Validation(ValidationError::Document(_))
        ));
    }
}
