//! Instruction prompts for each generation task.
//!
//! Every builder returns a ready [`CompletionRequest`] in the
//! `[INST] ... [/INST]` instruction format with the task's token budget.
//! Document context is always fenced in `<DOCUMENT_CONTENT>` tags.

use crate::generation::CompletionRequest;

/// Stop sequences for instruction-tuned local models.
pub const STOP: [&str; 2] = ["</s>", "[INST]"];

pub const ANSWER_TOKENS: u32 = 800;
pub const CONTEXTUAL_TOKENS: u32 = 1000;
pub const FLASHCARD_TOKENS: u32 = 1200;
pub const QUIZ_TOKENS: u32 = 2000;
pub const TOPIC_TOKENS: u32 = 300;
pub const NOTES_TOKENS: u32 = 1500;
pub const SUMMARY_TOKENS: u32 = 1500;

/// Replies used when the index holds no content.
pub const EMPTY_ANSWER: &str =
    "I can't answer this because the database is empty. Please use /add or /load first.";
pub const EMPTY_TOPICS: &str = "[]";
pub const EMPTY_NOTES: &str = "No documents found in the database covering this topic.";
pub const EMPTY_SUMMARY: &str =
    "No documents found in the database. Please use /add or /load first.";

/// Output shape requested from the quiz generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuizFormat {
    /// JSON array of `{question, options, answer}`. The only pooled format.
    #[default]
    Json,
    /// Free text, returned as-is.
    Text,
}

impl QuizFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Some(QuizFormat::Json),
            "text" => Some(QuizFormat::Text),
            _ => None,
        }
    }
}

fn request(prompt: String, max_tokens: u32) -> CompletionRequest {
    CompletionRequest {
        prompt,
        max_tokens,
        stop: STOP.iter().map(|s| s.to_string()).collect(),
        temperature: None,
    }
}

/// Prefix document context with cached notes for the topic.
pub fn with_notes(context: &str, notes: Option<&str>) -> String {
    match notes {
        Some(notes) if !notes.trim().is_empty() => format!(
            "NOTES/EXTRACTED CONTEXT:\n{}\n\nDOCUMENT CONTENT:\n{}",
            notes, context
        ),
        _ => context.to_string(),
    }
}

fn topic_focus(topic: &str, what: &str) -> String {
    if topic == crate::models::TopicKey::ALL {
        "Cover every topic present in the content.".to_string()
    } else {
        format!(
            "Stay strictly on the topic '{}'. Every {} must be relevant to it.",
            topic, what
        )
    }
}

pub fn answer(context: &str, question: &str) -> CompletionRequest {
    let prompt = format!(
        "[INST] You are a warm, encouraging study tutor. Answer the student's question \
using the document content below.

RULES:
- Begin the answer straight away, without an introductory sentence.
- Do not apologize and do not describe yourself.
- If the student asks for jokes or games, remind them briefly that it is study time.
- Follow any formatting the student asks for.

<DOCUMENT_CONTENT>
{context}
</DOCUMENT_CONTENT>

Question: {question}
[/INST]"
    );
    request(prompt, ANSWER_TOKENS)
}

pub fn contextual(selected_text: &str, question: &str) -> CompletionRequest {
    let prompt = format!(
        "[INST] You are a tutor. The student highlighted this passage in their material:

<SELECTED_TEXT>
{selected_text}
</SELECTED_TEXT>

Their question about it:
\"{question}\"

Answer clearly and concisely from the passage. Do not refer to \"the selected text\"; \
just answer in a friendly tone. Markdown is welcome. [/INST]"
    );
    request(prompt, CONTEXTUAL_TOKENS)
}

pub fn flashcards(context: &str, topic: &str, count: usize) -> CompletionRequest {
    let focus = topic_focus(topic, "flashcard");
    let prompt = format!(
        "[INST] You are an educator. Write exactly {count} flashcards, each testing one \
distinct fact from the document content below.
{focus}

RULES:
- Prefer facts from the document content.
- If the content is empty or only an outline, use your own knowledge of the topic so \
that there are still exactly {count} flashcards.
- Never refuse and never apologize.

Use exactly this layout for every card:
Q: <question>
A: <answer>

<DOCUMENT_CONTENT>
{context}
</DOCUMENT_CONTENT>
[/INST]"
    );
    request(prompt, FLASHCARD_TOKENS)
}

pub fn quiz(context: &str, topic: &str, count: usize, format: QuizFormat) -> CompletionRequest {
    let focus = topic_focus(topic, "question");
    let layout = match format {
        QuizFormat::Json => {
            "Reply with ONLY a JSON array shaped like this. \"options\" holds exactly 4 \
plain strings with no A/B/C/D prefixes. Put the correct answer first in \"options\" and \
repeat its exact text in \"answer\".

[
  {
    \"question\": \"...\",
    \"options\": [\"Correct answer\", \"Wrong answer\", \"Wrong answer\", \"Wrong answer\"],
    \"answer\": \"Correct answer\"
  }
]"
        }
        QuizFormat::Text => {
            "Lay out each question as below, without A/B/C/D prefixes. The first bullet \
is always the correct answer.

Q<n>: <question>
- <correct answer>
- <wrong answer>
- <wrong answer>
- <wrong answer>"
        }
    };
    let prompt = format!(
        "[INST] You write multiple-choice quizzes. Write exactly {count} questions.
{focus}

RULES:
- Ask conceptual, technical or analytical questions only.
- Never ask about books, authors, page numbers, syllabus layout or administration.
- Base the questions on the document content when it is useful. If it is empty or too \
thin for {count} questions, rely on your own knowledge instead.
- Never refuse and never return an empty list.

{layout}

<DOCUMENT_CONTENT>
{context}
</DOCUMENT_CONTENT>
[/INST]"
    );
    request(prompt, QUIZ_TOKENS)
}

pub fn topics(context: &str) -> CompletionRequest {
    let prompt = format!(
        "[INST] Read the document content below and list its 5 to 10 most important \
topics. Reply with ONLY a JSON array of strings, for example [\"Topic A\", \"Topic B\"].

<DOCUMENT_CONTENT>
{context}
</DOCUMENT_CONTENT>
[/INST]"
    );
    request(prompt, TOPIC_TOKENS)
}

const MARKDOWN_RULES: &str = "FORMAT:
- GitHub Flavored Markdown. Start directly with a # title; do not wrap the reply in a code fence.
- # for the title, ## for sections, ### for subsections.
- Code blocks only for actual code or raw data.
- Tables for structured data, - for bullets, **bold** for key terms.
- Use ONLY the document content. Do not add outside information.";

pub fn notes(context: &str, topic: &str) -> CompletionRequest {
    let prompt = format!(
        "[INST] You are a tutor. Write detailed study notes about '{topic}' from the \
document content below.

{MARKDOWN_RULES}

<DOCUMENT_CONTENT>
{context}
</DOCUMENT_CONTENT>
[/INST]"
    );
    request(prompt, NOTES_TOKENS)
}

pub fn summary(context: &str) -> CompletionRequest {
    let prompt = format!(
        "[INST] Summarize all of the document content below into a structured overview \
of the material.

{MARKDOWN_RULES}

<DOCUMENT_CONTENT>
{context}
</DOCUMENT_CONTENT>
[/INST]"
    );
    request(prompt, SUMMARY_TOKENS)
}
