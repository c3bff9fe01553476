//! Per-topic mastery statistics from submitted quiz results.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::{MasteryRecord, QuizResult, TopicKey};

/// Qualitative level derived from accuracy at read time. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MasteryLevel {
    Weak,
    Practice,
    Good,
    Mastered,
}

impl MasteryLevel {
    pub fn classify(accuracy: u32) -> Self {
        match accuracy {
            a if a > 80 => MasteryLevel::Mastered,
            a if a > 60 => MasteryLevel::Good,
            a if a > 30 => MasteryLevel::Practice,
            _ => MasteryLevel::Weak,
        }
    }
}

/// A mastery record with its derived level, as returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct MasteryView {
    #[serde(flatten)]
    pub record: MasteryRecord,
    pub level: MasteryLevel,
}

pub fn view(mastery: &BTreeMap<String, MasteryRecord>) -> BTreeMap<String, MasteryView> {
    mastery
        .iter()
        .map(|(topic, record)| {
            (
                topic.clone(),
                MasteryView {
                    record: record.clone(),
                    level: MasteryLevel::classify(record.accuracy),
                },
            )
        })
        .collect()
}

/// Fold one result into `mastery`.
///
/// Each topic of the breakdown (except `all`) gets its share of the time
/// spent, in proportion to how many of the result's questions it covered.
/// Derived fields are recomputed from the cumulative counters, so replaying
/// the same results always lands on the same statistics.
pub fn record_result(mastery: &mut BTreeMap<String, MasteryRecord>, result: &QuizResult) {
    let stamp = result.timestamp.unwrap_or_else(Utc::now);

    for (topic, tally) in &result.breakdown {
        let key = TopicKey::new(topic);
        if key.is_all() {
            continue;
        }

        let record = mastery.entry(key.as_str().to_string()).or_default();
        record.attempted += tally.total;
        record.correct += tally.correct.min(tally.total);

        if result.total > 0 && result.time_spent > 0.0 {
            record.total_time +=
                result.time_spent * f64::from(tally.total) / f64::from(result.total);
        }

        if record.attempted > 0 {
            record.accuracy =
                (f64::from(record.correct) / f64::from(record.attempted) * 100.0).round() as u32;
        }
        if record.total_time > 0.0 {
            record.avg_speed =
                round1(f64::from(record.attempted) / record.total_time * 60.0);
            record.best_speed = record.best_speed.max(record.avg_speed);
        }
        record.last_attempt = Some(stamp);
    }
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}
