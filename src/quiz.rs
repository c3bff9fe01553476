//! Topic-scoped quiz pools.
//!
//! Each `(project, topic)` owns a pool of generated questions that only
//! grows. A request for `count` questions is served from the pool when it is
//! large enough; otherwise exactly the missing number is generated, parsed
//! out of the model's (possibly noisy) reply, merged into the persisted
//! pool, and the quiz is sampled from the union.
//!
//! The aggregate topic `all` never has a persisted pool: every request for
//! it generates the full count within that request.
//!
//! Only the JSON format is pooled. The text format streams the model's
//! reply straight through.

use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::Value;
use tracing::{info, warn};

use crate::cache::ContentStore;
use crate::config::RetrievalConfig;
use crate::context::{ContextAssembler, ContextRequest};
use crate::error::{Result, StudyError};
use crate::generation::{GenerationGate, TextStream};
use crate::models::{ProjectsFile, QuizQuestion, StoredPool, TopicKey};
use crate::prompts::{self, QuizFormat};

/// What a quiz request produces.
pub enum QuizReply {
    Questions(Vec<QuizQuestion>),
    /// Unpooled free-text quiz, streamed as generated.
    Text(TextStream),
}

#[derive(Clone)]
pub struct QuizPoolManager {
    store: ContentStore,
    context: ContextAssembler,
    gate: GenerationGate,
    retrieval: RetrievalConfig,
}

impl QuizPoolManager {
    pub fn new(
        store: ContentStore,
        context: ContextAssembler,
        gate: GenerationGate,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            context,
            gate,
            retrieval,
        }
    }

    /// Serve `count` questions on `topic` for `project`.
    ///
    /// Dropping the returned future while it waits on the generator
    /// abandons the generation; nothing partial reaches the pool.
    pub async fn get_quiz(
        &self,
        project: &str,
        topic: &str,
        count: usize,
        format: QuizFormat,
    ) -> Result<QuizReply> {
        if count == 0 {
            return Err(StudyError::InvalidInput(
                "question count must be at least 1".to_string(),
            ));
        }

        let store = self.store.load()?;
        let project_data = store
            .project(project)
            .ok_or_else(|| StudyError::ProjectNotFound(project.to_string()))?;
        let key = TopicKey::new(topic);
        let notes = project_data.cache.notes.get(key.as_str()).cloned();

        if format == QuizFormat::Text {
            let permit = self.gate.try_acquire()?;
            let context = self.topic_context(topic, &key, notes.as_deref()).await?;
            let request = prompts::quiz(&context, key.as_str(), count, QuizFormat::Text);
            let fragments = permit.start(request).await?;
            return Ok(QuizReply::Text(fragments.forward(|_| {})));
        }

        let pool: Vec<QuizQuestion> = if key.is_all() {
            Vec::new()
        } else {
            project_data
                .cache
                .quizzes
                .get(key.as_str())
                .map(|p| p.questions().to_vec())
                .unwrap_or_default()
        };

        if pool.len() >= count {
            info!(project, topic = %key, pool = pool.len(), count, "serving quiz from pool");
            return Ok(QuizReply::Questions(sample_quiz(
                &pool,
                count,
                &mut rand::thread_rng(),
            )));
        }

        let deficit = pool_deficit(pool.len(), count);
        let permit = self.gate.try_acquire()?;
        info!(project, topic = %key, pool = pool.len(), deficit, "generating quiz questions");

        let context = self.topic_context(topic, &key, notes.as_deref()).await?;
        let request = prompts::quiz(&context, key.as_str(), deficit, QuizFormat::Json);
        let text = permit.start(request).await?.collect().await?;

        let fresh = extract_questions(&text);
        if fresh.is_empty() {
            warn!(
                project,
                topic = %key,
                "no question array in generated quiz; using existing pool"
            );
            return Ok(QuizReply::Questions(sample_quiz(
                &pool,
                count,
                &mut rand::thread_rng(),
            )));
        }
        info!(project, topic = %key, parsed = fresh.len(), "parsed generated questions");

        let union = if key.is_all() {
            let mut union = pool;
            union.extend(fresh);
            union
        } else {
            let merged = self
                .store
                .update(|s| merge_into_pool(s, project, &key, fresh.clone()))?;
            match merged {
                Some(merged) => merged,
                None => {
                    warn!(project, "project vanished before merge; quiz not pooled");
                    let mut union = pool;
                    union.extend(fresh);
                    union
                }
            }
        };

        Ok(QuizReply::Questions(sample_quiz(
            &union,
            count,
            &mut rand::thread_rng(),
        )))
    }

    async fn topic_context(&self, topic: &str, key: &TopicKey, notes: Option<&str>) -> Result<String> {
        let query = if key.is_all() { "" } else { topic.trim() };
        let context = self
            .context
            .assemble(&ContextRequest {
                query,
                limit: self.retrieval.limit,
                max_chars: self.retrieval.max_chars,
                k: self.retrieval.k,
            })
            .await?;
        if context.trim().is_empty() {
            warn!(topic = %key, "no document context for quiz; model falls back to its own knowledge");
        }
        Ok(prompts::with_notes(&context, notes))
    }
}

/// How many questions must be generated to serve `count` from a pool of
/// `pool_len`.
pub fn pool_deficit(pool_len: usize, count: usize) -> usize {
    count.saturating_sub(pool_len)
}

/// Append `fresh` to the persisted pool for `key` and return the whole
/// pool. Returns `None` if the project does not exist.
pub fn merge_into_pool(
    store: &mut ProjectsFile,
    project: &str,
    key: &TopicKey,
    fresh: Vec<QuizQuestion>,
) -> Option<Vec<QuizQuestion>> {
    let project = store.project_mut(project)?;
    let mut pool = project
        .cache
        .quizzes
        .remove(key.as_str())
        .map(StoredPool::into_questions)
        .unwrap_or_default();
    pool.extend(fresh);
    project
        .cache
        .quizzes
        .insert(key.as_str().to_string(), StoredPool::Questions(pool.clone()));
    Some(pool)
}

/// Pick `min(count, pool.len())` distinct questions uniformly without
/// replacement and shuffle each one's options.
pub fn sample_quiz<R: Rng + ?Sized>(
    pool: &[QuizQuestion],
    count: usize,
    rng: &mut R,
) -> Vec<QuizQuestion> {
    let picked: Vec<QuizQuestion> = pool
        .choose_multiple(rng, count.min(pool.len()))
        .cloned()
        .collect();
    picked
        .into_iter()
        .map(|mut q| {
            q.options.shuffle(rng);
            q
        })
        .collect()
}

/// Find the first JSON array in `text` that yields at least one valid
/// question.
///
/// Every `[` is tried as the start of an array, so leading chatter, code
/// fences and trailing commentary are skipped. Arrays that parse but hold
/// no usable question objects (e.g. an `options` list reached after a
/// truncated outer array) are passed over.
pub fn extract_questions(text: &str) -> Vec<QuizQuestion> {
    for (start, _) in text.match_indices('[') {
        let mut values = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        let Some(Ok(Value::Array(items))) = values.next() else {
            continue;
        };
        let questions: Vec<QuizQuestion> = items.into_iter().filter_map(to_question).collect();
        if !questions.is_empty() {
            return questions;
        }
    }
    Vec::new()
}

/// Validate one generated object. Requires a question and exactly four
/// distinct non-empty options. A missing or unmatched answer falls back to
/// the first option, which the prompt asks the model to make correct.
fn to_question(value: Value) -> Option<QuizQuestion> {
    let question = value.get("question")?.as_str()?.trim().to_string();
    if question.is_empty() {
        return None;
    }

    let options: Vec<String> = value
        .get("options")?
        .as_array()?
        .iter()
        .map(|o| o.as_str().map(|s| s.trim().to_string()))
        .collect::<Option<_>>()?;
    if options.len() != 4 || options.iter().any(String::is_empty) {
        return None;
    }
    for (i, a) in options.iter().enumerate() {
        if options[i + 1..].contains(a) {
            return None;
        }
    }

    let given = value
        .get("answer")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("");
    let answer = options
        .iter()
        .find(|o| o.as_str() == given)
        .or_else(|| options.iter().find(|o| o.eq_ignore_ascii_case(given)))
        .unwrap_or(&options[0])
        .clone();

    Some(QuizQuestion {
        question,
        options,
        answer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Project;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn q(text: &str) -> QuizQuestion {
        QuizQuestion {
            question: text.to_string(),
            options: vec!["right".into(), "w1".into(), "w2".into(), "w3".into()],
            answer: "right".into(),
        }
    }

    #[test]
    fn test_deficit() {
        assert_eq!(pool_deficit(3, 5), 2);
        assert_eq!(pool_deficit(0, 5), 5);
        assert_eq!(pool_deficit(7, 5), 0);
    }

    #[test]
    fn test_sample_is_distinct_and_answer_kept() {
        let pool: Vec<QuizQuestion> = (0..10).map(|i| q(&format!("Q{i}"))).collect();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let quiz = sample_quiz(&pool, 5, &mut rng);
            assert_eq!(quiz.len(), 5);
            let unique: HashSet<&str> = quiz.iter().map(|q| q.question.as_str()).collect();
            assert_eq!(unique.len(), 5);
            for question in &quiz {
                assert!(question.is_well_formed());
            }
        }
    }

    #[test]
    fn test_sample_caps_at_pool_size() {
        let pool = vec![q("a"), q("b")];
        assert_eq!(sample_quiz(&pool, 5, &mut rand::thread_rng()).len(), 2);
        assert!(sample_quiz(&[], 3, &mut rand::thread_rng()).is_empty());
    }

    #[test]
    fn test_options_get_shuffled() {
        let pool = vec![q("only")];
        let mut rng = StdRng::seed_from_u64(1);
        let firsts: HashSet<String> = (0..40)
            .map(|_| sample_quiz(&pool, 1, &mut rng)[0].options[0].clone())
            .collect();
        assert!(firsts.len() > 1);
    }

    #[test]
    fn test_extract_from_noisy_output() {
        let text = r#"Sure! Here is your quiz:
```json
[
  {"question": "What is ATP?", "options": ["Energy carrier", "A protein", "A lipid", "DNA"], "answer": "Energy carrier"},
  {"question": "Where is DNA?", "options": ["Nucleus", "Ribosome", "Membrane", "Golgi"], "answer": "Nucleus"}
]
```
Good luck!"#;
        let questions = extract_questions(text);
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[1].answer, "Nucleus");
    }

    #[test]
    fn test_extract_repairs_answer_and_drops_bad_items() {
        let text = r#"[
          {"question": "A?", "options": ["x", "y", "z", "w"]},
          {"question": "B?", "options": ["x", "y"], "answer": "x"},
          {"question": "C?", "options": ["p", "p", "q", "r"], "answer": "p"},
          {"question": "D?", "options": ["Yes", "No", "Maybe", "Never"], "answer": "yes"}
        ]"#;
        let questions = extract_questions(text);
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].answer, "x");
        assert_eq!(questions[1].answer, "Yes");
        assert!(questions.iter().all(QuizQuestion::is_well_formed));
    }

    #[test]
    fn test_extract_nothing_from_garbage() {
        assert!(extract_questions("I cannot produce a quiz right now.").is_empty());
        assert!(extract_questions("[1, 2, 3]").is_empty());
        assert!(extract_questions("[{\"question\": \"cut off").is_empty());
        assert!(extract_questions("[]").is_empty());
    }

    #[test]
    fn test_merge_replaces_legacy_and_appends() {
        let mut store = ProjectsFile::default();
        let mut project = Project::default();
        project
            .cache
            .quizzes
            .insert("cells".into(), StoredPool::Legacy("old text".into()));
        store.projects.insert("bio".into(), project);

        let key = TopicKey::new("Cells");
        let merged = merge_into_pool(&mut store, "bio", &key, vec![q("a"), q("b")]).unwrap();
        assert_eq!(merged.len(), 2);
        let merged = merge_into_pool(&mut store, "bio", &key, vec![q("a")]).unwrap();
        assert_eq!(merged.len(), 3, "pools keep duplicates");
        assert!(merge_into_pool(&mut store, "nope", &key, vec![q("c")]).is_none());
    }
}
