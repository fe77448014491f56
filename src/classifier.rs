use crate::config::ClassifierConfig;
use crate::converters::i16_to_f32;
use crate::error::{MonitorError, MonitorResult};
use chrono::{DateTime, Local};
use log::{error, info, warn};
use serde_derive::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const CRYING_CLASS_INDICES: [usize; 3] = [20, 21, 22];
pub const SPEECH_CLASS_INDICES: [usize; 4] = [0, 1, 2, 3];
pub const ALARM_CLASS_INDICES: [usize; 5] = [393, 394, 395, 396, 397];
pub const SILENCE_CEILING: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoundCategory {
    Unknown,
    Crying,
    Speech,
    Alarm,
    Silence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoundEvent {
    pub category: SoundCategory,
    pub confidence: f32,
    pub label: String,
    pub timestamp: DateTime<Local>,
}

impl SoundEvent {
    pub fn new(category: SoundCategory, confidence: f32, label: impl Into<String>) -> Self {
        SoundEvent {
            category,
            confidence,
            label: label.into(),
            timestamp: Local::now(),
        }
    }

    pub fn unknown(label: impl Into<String>) -> Self {
        SoundEvent::new(SoundCategory::Unknown, 0.0, label)
    }

    pub fn is_crying(&self) -> bool {
        self.category == SoundCategory::Crying
    }
}

/// Turns about one second of mono audio into a [`SoundEvent`]. Called at roughly 1 Hz from
/// the alarm monitor thread.
pub trait SoundClassifier: Send {
    fn load(&mut self) -> MonitorResult<()>;

    fn is_loaded(&self) -> bool;

    fn classify(&mut self, samples: &[i16]) -> MonitorResult<SoundEvent>;

    fn is_crying(&mut self, samples: &[i16]) -> MonitorResult<(bool, f32)> {
        let event = self.classify(samples)?;
        Ok((event.is_crying(), event.confidence))
    }
}

/// Per-class score producer, e.g. an audio-event network with one output per class.
pub trait ScoreModel: Send {
    fn load(&mut self) -> MonitorResult<()>;

    /// Number of normalised samples the model takes per call.
    fn input_len(&self) -> usize;

    fn scores(&mut self, input: &[f32]) -> MonitorResult<Vec<f32>>;
}

/// Normalises to [-1, 1) and zero-pads or truncates to `expected_len`.
pub fn prepare_input(samples: &[i16], expected_len: usize) -> Vec<f32> {
    let mut input: Vec<f32> = samples.iter().take(expected_len).map(i16_to_f32).collect();
    input.resize(expected_len, 0.0);
    input
}

/// Reads display names from a class-map CSV (`index,mid,display_name`), header skipped.
pub fn load_class_names(path: &Path) -> MonitorResult<Vec<String>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .skip(1)
        .filter_map(|line| split_csv_line(line).into_iter().nth(2))
        .collect())
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = vec![];
    let mut field = String::new();
    let mut quoted = false;
    for c in line.trim().chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}

/// Maps raw class scores to a category.
#[derive(Debug, Clone)]
pub struct ScoreCategorizer {
    threshold: f32,
    crying: Vec<usize>,
    speech: Vec<usize>,
    alarm: Vec<usize>,
    class_names: Vec<String>,
}

impl ScoreCategorizer {
    pub fn new(threshold: f32) -> Self {
        ScoreCategorizer {
            threshold,
            crying: CRYING_CLASS_INDICES.to_vec(),
            speech: SPEECH_CLASS_INDICES.to_vec(),
            alarm: ALARM_CLASS_INDICES.to_vec(),
            class_names: vec![],
        }
    }

    pub fn from_config(config: &ClassifierConfig) -> Self {
        ScoreCategorizer::new(config.threshold)
    }

    pub fn with_class_names(mut self, class_names: Vec<String>) -> Self {
        self.class_names = class_names;
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    fn class_name(&self, index: usize) -> String {
        self.class_names
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", index))
    }

    /// Crying wins when it clears the threshold and is at least as strong as speech and alarm;
    /// speech likewise beats alarm. Otherwise a weak top score means silence.
    pub fn categorize(&self, scores: &[f32]) -> SoundEvent {
        let max_of = |indices: &[usize]| {
            indices
                .iter()
                .filter_map(|&i| scores.get(i))
                .fold(0.0f32, |acc, &s| acc.max(s))
        };
        let max_crying = max_of(&self.crying);
        let max_speech = max_of(&self.speech);
        let max_alarm = max_of(&self.alarm);

        let (top_index, top_score) = match scores
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best: Option<(usize, f32)>, (i, s)| match best {
                Some((_, b)) if b >= s => best,
                _ => Some((i, s)),
            }) {
            Some(top) => top,
            None => return SoundEvent::unknown("no_scores"),
        };
        let top_name = self.class_name(top_index);

        if max_crying >= self.threshold && max_crying >= max_speech.max(max_alarm) {
            SoundEvent::new(SoundCategory::Crying, max_crying, top_name)
        } else if max_speech >= self.threshold && max_speech >= max_alarm {
            SoundEvent::new(SoundCategory::Speech, max_speech, top_name)
        } else if max_alarm >= self.threshold {
            SoundEvent::new(SoundCategory::Alarm, max_alarm, top_name)
        } else if top_score < SILENCE_CEILING {
            SoundEvent::new(SoundCategory::Silence, 1.0 - top_score, "silence")
        } else {
            SoundEvent::new(SoundCategory::Unknown, top_score, top_name)
        }
    }
}

/// [`SoundClassifier`] over a [`ScoreModel`]. Model failures degrade to `unknown` events.
pub struct ScoredClassifier<M: ScoreModel> {
    model: M,
    categorizer: ScoreCategorizer,
    loaded: bool,
}

impl<M: ScoreModel> ScoredClassifier<M> {
    pub fn new(model: M, categorizer: ScoreCategorizer) -> Self {
        ScoredClassifier {
            model,
            categorizer,
            loaded: false,
        }
    }

    pub fn categorizer(&self) -> &ScoreCategorizer {
        &self.categorizer
    }
}

impl<M: ScoreModel> SoundClassifier for ScoredClassifier<M> {
    fn load(&mut self) -> MonitorResult<()> {
        match self.model.load() {
            Ok(()) => {
                self.loaded = true;
                info!("Sound classification model loaded");
                Ok(())
            }
            Err(e) => {
                warn!("Sound classification disabled: {}", e);
                self.loaded = false;
                Err(MonitorError::Classifier(e.to_string()))
            }
        }
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn classify(&mut self, samples: &[i16]) -> MonitorResult<SoundEvent> {
        if !self.loaded {
            return Ok(SoundEvent::unknown("model_not_loaded"));
        }
        let input = prepare_input(samples, self.model.input_len());
        match self.model.scores(&input) {
            Ok(scores) => Ok(self.categorizer.categorize(&scores)),
            Err(e) => {
                error!("Classification error: {}", e);
                Ok(SoundEvent::unknown("error"))
            }
        }
    }
}
