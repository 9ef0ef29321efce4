//! Build a merged assistant message from multiple per-target replies.

use serde::{Deserialize, Serialize};

/// Separator between concatenated replies.
pub const REPLY_SEPARATOR: &str = "\n\n---\n\n";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    #[default]
    Concatenate,
    /// Placeholder strategies: the merged text is handed to a target model
    /// for summarization/comparison by the caller, so they only differ in
    /// framing here.
    Summarize,
    Compare,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub label: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedMessage {
    pub text: String,
    pub strategy: MergeStrategy,
}

fn numbered(replies: &[Reply]) -> Vec<String> {
    replies
        .iter()
        .enumerate()
        .map(|(i, reply)| match &reply.label {
            Some(label) => format!("[#{} {}]\n{}", i + 1, label, reply.text),
            None => format!("[#{}]\n{}", i + 1, reply.text),
        })
        .collect()
}

/// Merge labeled replies under the given strategy.
pub fn build_merged_message(strategy: MergeStrategy, replies: &[Reply]) -> MergedMessage {
    let text = match strategy {
        MergeStrategy::Concatenate => numbered(replies).join(REPLY_SEPARATOR),
        MergeStrategy::Summarize | MergeStrategy::Compare => numbered(replies).join("\n\n"),
    };
    MergedMessage { text, strategy }
}

/// Plain concatenation of final answers, in the order given.
pub fn join_answers(answers: &[String]) -> String {
    answers.join(REPLY_SEPARATOR)
}
