//! Feedback/learning loop.
//!
//! Every interaction yields rule-based quality metrics folded into rolling
//! values by exponential moving average, plus short "improvement" strings
//! mined from metric thresholds and structured feedback phrases.  History
//! is capped FIFO and persisted best-effort after every entry — a failed
//! write logs a warning and never fails the interaction.

use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use sentra_bus::{EventBus, Topic};
use sentra_vault::EncryptedFile;

/// Metrics below this are called out with an improvement suggestion.
const IMPROVEMENT_FLOOR: f32 = 0.7;

/// Response length band considered efficient (chars).
const EFFICIENT_MIN: usize = 40;
const EFFICIENT_MAX: usize = 2_000;

const ERROR_TOKENS: &[&str] = &["error", "failed", "exception", "unavailable", "traceback"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub success_rate: f32,
    pub accuracy: f32,
    pub relevance: f32,
    pub efficiency: f32,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            success_rate: 1.0,
            accuracy: 1.0,
            relevance: 1.0,
            efficiency: 1.0,
        }
    }
}

impl Metrics {
    fn ema(self, sample: Metrics, alpha: f32) -> Metrics {
        let fold = |old: f32, new: f32| old * (1.0 - alpha) + new * alpha;
        Metrics {
            success_rate: fold(self.success_rate, sample.success_rate),
            accuracy: fold(self.accuracy, sample.accuracy),
            relevance: fold(self.relevance, sample.relevance),
            efficiency: fold(self.efficiency, sample.efficiency),
        }
    }
}

/// What one interaction looked like, as seen by the learning loop.
#[derive(Debug, Clone)]
pub struct InteractionSample {
    pub input: String,
    pub response: String,
    pub feedback: Option<String>,
    /// The pipeline reported a failure for this interaction.
    pub had_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningEntry {
    pub ts: i64,
    pub input: String,
    pub result_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub metrics: Metrics,
    pub improvements: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HistoryImage {
    rolling: Option<Metrics>,
    entries: Vec<LearningEntry>,
}

/// Where history lands on disk.  Encrypted when the master key is present;
/// plaintext only for explicitly keyless setups.
enum HistorySink {
    Encrypted(EncryptedFile),
    Plain(PathBuf),
    None,
}

pub struct LearningLoop {
    state: Mutex<LearningState>,
    sink: HistorySink,
    bus: EventBus,
    learning_rate: f32,
    max_entries: usize,
}

struct LearningState {
    rolling: Metrics,
    entries: VecDeque<LearningEntry>,
}

/// Rule-based per-interaction scoring.
pub fn score_interaction(sample: &InteractionSample) -> Metrics {
    let response_lower = sample.response.to_lowercase();
    let has_error_token = ERROR_TOKENS.iter().any(|t| response_lower.contains(t));

    let success_rate = if sample.had_error { 0.0 } else { 1.0 };
    let accuracy = if sample.had_error || has_error_token {
        0.2
    } else if sample
        .feedback
        .as_deref()
        .map(|f| f.to_lowercase().contains("inaccurate") || f.to_lowercase().contains("wrong"))
        .unwrap_or(false)
    {
        0.3
    } else {
        1.0
    };

    // Vocabulary overlap between question and answer as a relevance proxy.
    let relevance = {
        let input_terms: Vec<String> = sample
            .input
            .split(|ch: char| !ch.is_alphanumeric())
            .filter(|t| t.len() >= 4)
            .map(|t| t.to_lowercase())
            .collect();
        if input_terms.is_empty() {
            1.0
        } else {
            let hits = input_terms
                .iter()
                .filter(|t| response_lower.contains(t.as_str()))
                .count();
            (hits as f32 / input_terms.len() as f32).clamp(0.0, 1.0)
        }
    };

    let efficiency = {
        let len = sample.response.len();
        if (EFFICIENT_MIN..=EFFICIENT_MAX).contains(&len) {
            1.0
        } else if len > EFFICIENT_MAX {
            0.5
        } else {
            0.3
        }
    };

    Metrics {
        success_rate,
        accuracy,
        relevance,
        efficiency,
    }
}

/// Improvement strings from metric thresholds and feedback phrases.
pub fn extract_improvements(metrics: &Metrics, feedback: Option<&str>) -> Vec<String> {
    let mut improvements = Vec::new();

    if metrics.success_rate < IMPROVEMENT_FLOOR {
        improvements.push("reduce failed interactions".to_string());
    }
    if metrics.accuracy < IMPROVEMENT_FLOOR {
        improvements.push("ground answers in retrieved sources".to_string());
    }
    if metrics.relevance < IMPROVEMENT_FLOOR {
        improvements.push("address the question asked, not adjacent topics".to_string());
    }
    if metrics.efficiency < IMPROVEMENT_FLOOR {
        improvements.push("match response length to the question".to_string());
    }

    if let Some(feedback) = feedback {
        let lower = feedback.to_lowercase();
        for (phrase, suggestion) in [
            ("inaccurate", "verify facts before answering"),
            ("wrong", "verify facts before answering"),
            ("too long", "tighten responses"),
            ("too short", "expand responses with concrete detail"),
            ("unclear", "structure answers with concrete steps"),
            ("irrelevant", "address the question asked, not adjacent topics"),
        ] {
            if lower.contains(phrase) {
                let suggestion = suggestion.to_string();
                if !improvements.contains(&suggestion) {
                    improvements.push(suggestion);
                }
            }
        }
    }

    improvements
}

impl LearningLoop {
    /// Encrypted history (master key present).
    pub fn new_encrypted(
        path: impl Into<PathBuf>,
        key: [u8; 32],
        bus: EventBus,
        learning_rate: f32,
        max_entries: usize,
    ) -> Self {
        Self::build(
            HistorySink::Encrypted(EncryptedFile::new(path, key)),
            bus,
            learning_rate,
            max_entries,
        )
    }

    /// Plaintext history for keyless setups.
    pub fn new_plain(
        path: impl Into<PathBuf>,
        bus: EventBus,
        learning_rate: f32,
        max_entries: usize,
    ) -> Self {
        Self::build(HistorySink::Plain(path.into()), bus, learning_rate, max_entries)
    }

    /// In-memory only (tests, ephemeral sessions).
    pub fn ephemeral(bus: EventBus, learning_rate: f32, max_entries: usize) -> Self {
        Self::build(HistorySink::None, bus, learning_rate, max_entries)
    }

    fn build(sink: HistorySink, bus: EventBus, learning_rate: f32, max_entries: usize) -> Self {
        Self {
            state: Mutex::new(LearningState {
                rolling: Metrics::default(),
                entries: VecDeque::new(),
            }),
            sink,
            bus,
            learning_rate,
            max_entries: max_entries.max(1),
        }
    }

    /// Load persisted history, if any.  Corrupt encrypted history is an
    /// error (same contract as every other store); a missing file is not.
    pub async fn load(&self) -> Result<(), sentra_vault::VaultError> {
        let image: Option<HistoryImage> = match &self.sink {
            HistorySink::Encrypted(file) => file.load().await?,
            HistorySink::Plain(path) => {
                if path.exists() {
                    let raw = tokio::fs::read_to_string(path).await?;
                    Some(serde_json::from_str(&raw)?)
                } else {
                    None
                }
            }
            HistorySink::None => None,
        };

        if let Some(image) = image {
            let mut state = self.state.lock().await;
            state.rolling = image.rolling.unwrap_or_default();
            state.entries = image.entries.into();
            debug!(entries = state.entries.len(), "learning history loaded");
        }
        Ok(())
    }

    /// Score an interaction, fold it into the rolling metrics, append a
    /// history entry, and persist best-effort.
    pub async fn record(&self, sample: InteractionSample) -> LearningEntry {
        let scored = score_interaction(&sample);

        let entry = {
            let mut state = self.state.lock().await;
            state.rolling = state.rolling.ema(scored, self.learning_rate);

            let entry = LearningEntry {
                ts: Utc::now().timestamp_millis(),
                input: sample.input.clone(),
                result_summary: summarize(&sample.response),
                feedback: sample.feedback.clone(),
                metrics: scored,
                improvements: extract_improvements(&scored, sample.feedback.as_deref()),
            };

            state.entries.push_back(entry.clone());
            while state.entries.len() > self.max_entries {
                state.entries.pop_front();
            }
            entry
        };

        self.bus.publish(
            Topic::LearningEntry,
            serde_json::json!({
                "input_len": entry.input.len(),
                "improvements": entry.improvements,
            }),
        );
        if entry.feedback.is_some() {
            self.bus.publish(
                Topic::LearningFeedback,
                serde_json::json!({ "feedback": entry.feedback }),
            );
        }

        if let Err(err) = self.persist().await {
            warn!(%err, "learning history write failed (best-effort, continuing)");
        }
        entry
    }

    pub async fn rolling_metrics(&self) -> Metrics {
        self.state.lock().await.rolling
    }

    pub async fn history(&self, limit: usize) -> Vec<LearningEntry> {
        let state = self.state.lock().await;
        state.entries.iter().rev().take(limit).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn persist(&self) -> Result<(), sentra_vault::VaultError> {
        let image = {
            let state = self.state.lock().await;
            HistoryImage {
                rolling: Some(state.rolling),
                entries: state.entries.iter().cloned().collect(),
            }
        };

        match &self.sink {
            HistorySink::Encrypted(file) => file.save(&image).await,
            HistorySink::Plain(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let rendered = serde_json::to_vec_pretty(&image)?;
                tokio::fs::write(path, rendered).await?;
                Ok(())
            }
            HistorySink::None => Ok(()),
        }
    }
}

fn summarize(response: &str) -> String {
    let trimmed = response.trim();
    if trimmed.len() <= 160 {
        trimmed.to_string()
    } else {
        let mut end = 160;
        while end > 0 && !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean_sample(input: &str, response: &str) -> InteractionSample {
        InteractionSample {
            input: input.to_string(),
            response: response.to_string(),
            feedback: None,
            had_error: false,
        }
    }

    #[test]
    fn error_tokens_tank_accuracy() {
        let sample = clean_sample("scan hosts", "Error: connection refused while scanning hosts");
        let metrics = score_interaction(&sample);
        assert!(metrics.accuracy <= 0.2);
        // The pipeline itself succeeded, so success_rate stays up.
        assert_eq!(metrics.success_rate, 1.0);
    }

    #[test]
    fn had_error_zeroes_success() {
        let mut sample = clean_sample("q", "whatever");
        sample.had_error = true;
        assert_eq!(score_interaction(&sample).success_rate, 0.0);
    }

    #[test]
    fn efficiency_buckets_by_length() {
        let short = clean_sample("question about things", "ok");
        assert!(score_interaction(&short).efficiency < 0.5);

        let good = clean_sample(
            "question about things",
            "A thorough but bounded answer about the question topic, long enough to be useful.",
        );
        assert_eq!(score_interaction(&good).efficiency, 1.0);

        let bloated = clean_sample("question", &"x".repeat(5_000));
        assert_eq!(score_interaction(&bloated).efficiency, 0.5);
    }

    #[test]
    fn relevance_tracks_vocabulary_overlap() {
        let relevant = clean_sample(
            "explain phishing campaigns",
            "Phishing campaigns rely on spoofed senders and urgent pretexts.",
        );
        assert!(score_interaction(&relevant).relevance > 0.5);

        let off_topic = clean_sample(
            "explain phishing campaigns",
            "Kernel scheduling uses run queues.",
        );
        assert!(score_interaction(&off_topic).relevance < 0.5);
    }

    #[test]
    fn ema_moves_toward_sample_at_learning_rate() {
        let rolling = Metrics::default();
        let sample = Metrics {
            success_rate: 0.0,
            accuracy: 0.0,
            relevance: 0.0,
            efficiency: 0.0,
        };
        let updated = rolling.ema(sample, 0.1);
        assert!((updated.success_rate - 0.9).abs() < 1e-6);
        assert!((updated.accuracy - 0.9).abs() < 1e-6);
    }

    #[test]
    fn improvements_fire_below_threshold_and_on_phrases() {
        let weak = Metrics {
            success_rate: 0.5,
            accuracy: 0.9,
            relevance: 0.6,
            efficiency: 0.9,
        };
        let improvements = extract_improvements(&weak, Some("too long and unclear"));
        assert!(improvements.iter().any(|i| i.contains("failed interactions")));
        assert!(improvements.iter().any(|i| i.contains("question asked")));
        assert!(improvements.iter().any(|i| i.contains("tighten")));
        assert!(improvements.iter().any(|i| i.contains("concrete steps")));
    }

    #[test]
    fn healthy_metrics_yield_no_improvements() {
        assert!(extract_improvements(&Metrics::default(), None).is_empty());
    }

    #[tokio::test]
    async fn history_caps_fifo() {
        let learning = LearningLoop::ephemeral(EventBus::new(), 0.1, 3);
        for i in 0..5 {
            learning
                .record(clean_sample(&format!("q{i}"), "a reasonable answer about the topic asked"))
                .await;
        }

        assert_eq!(learning.len().await, 3);
        let recent = learning.history(10).await;
        assert_eq!(recent[0].input, "q4", "newest first");
        assert_eq!(recent[2].input, "q2", "oldest surviving entry");
    }

    #[tokio::test]
    async fn record_publishes_learning_events() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let bus = EventBus::new();
        let entries = Arc::new(AtomicUsize::new(0));
        let entries_clone = Arc::clone(&entries);
        bus.subscribe(Topic::LearningEntry, move |_| {
            entries_clone.fetch_add(1, Ordering::SeqCst);
        });
        let feedbacks = Arc::new(AtomicUsize::new(0));
        let feedbacks_clone = Arc::clone(&feedbacks);
        bus.subscribe(Topic::LearningFeedback, move |_| {
            feedbacks_clone.fetch_add(1, Ordering::SeqCst);
        });

        let learning = LearningLoop::ephemeral(bus, 0.1, 100);
        learning.record(clean_sample("q", "a long enough answer about q and details")).await;
        let mut with_feedback = clean_sample("q2", "another long enough answer about q2 details");
        with_feedback.feedback = Some("inaccurate".to_string());
        learning.record(with_feedback).await;

        assert_eq!(entries.load(Ordering::SeqCst), 2);
        assert_eq!(feedbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn encrypted_history_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learning/learning-history.json");
        let key = [9u8; 32];

        {
            let learning =
                LearningLoop::new_encrypted(&path, key, EventBus::new(), 0.1, 100);
            learning
                .record(clean_sample("persisted question", "a persisted answer with enough detail"))
                .await;
        }

        let reloaded = LearningLoop::new_encrypted(&path, key, EventBus::new(), 0.1, 100);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.len().await, 1);
        assert_eq!(reloaded.history(1).await[0].input, "persisted question");

        // The file on disk must be an envelope, not plaintext JSON.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("authTag"));
        assert!(!raw.contains("persisted question"));
    }

    #[tokio::test]
    async fn plain_history_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learning-history.json");

        {
            let learning = LearningLoop::new_plain(&path, EventBus::new(), 0.1, 100);
            learning
                .record(clean_sample("plain question", "a plain answer with enough words in it"))
                .await;
        }

        let reloaded = LearningLoop::new_plain(&path, EventBus::new(), 0.1, 100);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.len().await, 1);
    }
}
