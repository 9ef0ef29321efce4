//! Client-side stream reducer.
//!
//! Demultiplexes tagged channel events back into per-target answer buffers,
//! drives each target's status state machine, and owns the session copy the
//! UI renders. Terminal statuses are absorbing: once a (run, target) pair is
//! done, errored, or canceled, later events for it are ignored, so replayed
//! terminal events can never duplicate history records.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregation::{self, MergeStrategy, Reply};
use crate::channel::{ChannelEvent, FanoutTag, PortRequest, StreamUpdate};
use crate::fanout::{FanoutMode, FanoutRequest, TargetSpec};
use crate::session::{ConversationRecord, RecordMeta, Session, Target};

/// Per-(run, target) stream status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Queued,
    Running,
    Done,
    Error,
    Canceled,
}

impl TargetStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TargetStatus::Done | TargetStatus::Error | TargetStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Question,
    Answer,
    Error,
}

/// One rendered entry: a question, or an answer buffer for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationItem {
    pub kind: ItemKind,
    pub content: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<RecordMeta>,
}

impl ConversationItem {
    fn new(kind: ItemKind, content: String, done: bool, meta: Option<RecordMeta>) -> Self {
        Self {
            kind,
            content,
            done,
            meta,
        }
    }
}

/// The state machine behind one conversation view.
pub struct StreamReducer {
    session: Session,
    items: Vec<ConversationItem>,
    statuses: HashMap<String, TargetStatus>,
    active_run: Option<String>,
    active_targets: Vec<String>,
    ready: bool,
}

impl StreamReducer {
    /// Seed the view from the session's persisted history.
    pub fn new(session: Session) -> Self {
        let mut items = Vec::new();
        for record in &session.conversation_records {
            if let Some(question) = &record.question {
                items.push(ConversationItem::new(
                    ItemKind::Question,
                    question.clone(),
                    true,
                    None,
                ));
            }
            if !record.answer.is_empty() {
                items.push(ConversationItem::new(
                    ItemKind::Answer,
                    record.answer.clone(),
                    true,
                    record.meta.clone(),
                ));
            }
        }
        Self {
            session,
            items,
            statuses: HashMap::new(),
            active_run: None,
            active_targets: Vec::new(),
            ready: true,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn items(&self) -> &[ConversationItem] {
        &self.items
    }

    pub fn status(&self, target_id: &str) -> Option<TargetStatus> {
        self.statuses.get(target_id).copied()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn active_run(&self) -> Option<&str> {
        self.active_run.as_deref()
    }

    /// Start a legacy single-target turn: question item plus one pending
    /// answer buffer. Returns the request to post.
    pub fn begin_turn(&mut self, question: &str) -> PortRequest {
        self.items.push(ConversationItem::new(
            ItemKind::Question,
            question.to_string(),
            true,
            None,
        ));
        self.items
            .push(ConversationItem::new(ItemKind::Answer, String::new(), false, None));
        self.session.question = Some(question.to_string());
        self.session.is_retry = false;
        self.ready = false;
        PortRequest::Ask {
            session: self.session.clone(),
        }
    }

    /// Start a fanout turn across the session's selected targets: question
    /// item, one placeholder buffer per target, and the run's primary
    /// history record. Returns the request to post.
    pub fn begin_fanout_turn(&mut self, question: &str) -> PortRequest {
        let run_id = Uuid::new_v4().to_string();
        self.items.push(ConversationItem::new(
            ItemKind::Question,
            question.to_string(),
            true,
            None,
        ));
        for target in &self.session.targets {
            self.items.push(ConversationItem::new(
                ItemKind::Answer,
                String::new(),
                false,
                Some(RecordMeta {
                    run_id: Some(run_id.clone()),
                    source_target_id: Some(target.id.clone()),
                    merged_from_target_ids: None,
                }),
            ));
        }
        self.statuses = self
            .session
            .targets
            .iter()
            .map(|target| (target.id.clone(), TargetStatus::Queued))
            .collect();
        self.active_run = Some(run_id.clone());
        self.active_targets = self.session.targets.iter().map(|t| t.id.clone()).collect();
        self.session.question = Some(question.to_string());
        self.session.is_retry = false;
        self.session.last_run_id = Some(run_id.clone());
        self.session.conversation_records.push(ConversationRecord::new(
            Some(question.to_string()),
            String::new(),
            Some(RecordMeta {
                run_id: Some(run_id.clone()),
                ..Default::default()
            }),
        ));
        self.ready = false;

        PortRequest::Fanout {
            fanout: FanoutRequest {
                run_id: Some(run_id),
                fanout_mode: Some(self.session.fanout),
                targets: self
                    .session
                    .targets
                    .iter()
                    .map(|target| TargetSpec {
                        id: target.id.clone(),
                        api_mode: target.api_mode.clone(),
                        model_name: Some(target.model_name.clone()),
                    })
                    .collect(),
            },
            session: self.session.clone(),
        }
    }

    /// Apply one channel event.
    pub fn apply(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::FanoutStart { fanout } => {
                self.active_run = Some(fanout.run_id.clone());
                self.active_targets = fanout.target_ids.clone();
                for target_id in &fanout.target_ids {
                    self.buffer_index(&fanout.run_id, target_id);
                    // dispatch already began server-side by the time this
                    // marker is observed, so queued advances immediately
                    let entry = self
                        .statuses
                        .entry(target_id.clone())
                        .or_insert(TargetStatus::Queued);
                    if *entry == TargetStatus::Queued {
                        *entry = TargetStatus::Running;
                    }
                }
            }
            ChannelEvent::Update {
                update,
                fanout: Some(tag),
            } => self.apply_tagged(update, tag),
            ChannelEvent::Update {
                update,
                fanout: None,
            } => self.apply_untagged(update),
            ChannelEvent::FanoutDone { .. } => {
                self.ready = true;
            }
        }
    }

    fn apply_tagged(&mut self, update: StreamUpdate, tag: FanoutTag) {
        if self.active_run.as_deref() != Some(tag.run_id.as_str()) {
            return;
        }
        let status = self.statuses.get(&tag.target_id).copied();
        // terminal states absorb: canceled targets opted out, done/error
        // targets must not re-append history on replays
        if status.is_some_and(TargetStatus::is_terminal) {
            return;
        }

        if let Some(session) = &update.session {
            let fragment = session.extract_provider_state();
            self.session.merge_target_state(&tag.target_id, fragment);
        }

        if let Some(error) = &update.error {
            let index = self.buffer_index(&tag.run_id, &tag.target_id);
            self.items[index].kind = ItemKind::Error;
            self.items[index].content = translate_error(error);
            self.items[index].done = true;
            self.statuses
                .insert(tag.target_id.clone(), TargetStatus::Error);
            if self.run_settled() {
                self.ready = true;
            }
            return;
        }

        if let Some(answer) = &update.answer {
            let index = self.buffer_index(&tag.run_id, &tag.target_id);
            self.items[index].content = answer.clone();
            if !update.done {
                self.statuses
                    .insert(tag.target_id.clone(), TargetStatus::Running);
            }
        }

        if update.done {
            let index = self.buffer_index(&tag.run_id, &tag.target_id);
            self.items[index].done = true;
            let final_answer = self.items[index].content.clone();
            self.statuses
                .insert(tag.target_id.clone(), TargetStatus::Done);
            self.session.conversation_records.push(ConversationRecord::new(
                None,
                final_answer,
                Some(RecordMeta {
                    run_id: Some(tag.run_id.clone()),
                    source_target_id: Some(tag.target_id.clone()),
                    merged_from_target_ids: None,
                }),
            ));
            if self.run_settled() {
                self.ready = true;
            }
        }
    }

    fn apply_untagged(&mut self, update: StreamUpdate) {
        if let Some(answer) = &update.answer {
            if let Some(index) = self.last_buffer_index() {
                self.items[index].kind = ItemKind::Answer;
                self.items[index].content = answer.clone();
            }
        }

        if let Some(session) = update.session {
            let mut session = *session;
            if update.done {
                session.is_retry = false;
            }
            self.session = session;
        }

        if update.done {
            if let Some(index) = self.last_buffer_index() {
                self.items[index].done = true;
            }
            self.ready = true;
        }

        if let Some(error) = &update.error {
            let text = translate_error(error);
            match self.last_buffer_index() {
                // a still-pending or empty buffer takes the error text;
                // anything already answered gets a fresh error item
                Some(index)
                    if !self.items[index].done
                        || self.items[index].content.is_empty()
                        || self.items[index].kind == ItemKind::Error =>
                {
                    self.items[index].kind = ItemKind::Error;
                    self.items[index].content = text;
                    self.items[index].done = true;
                }
                _ => {
                    self.items
                        .push(ConversationItem::new(ItemKind::Error, text, true, None));
                }
            }
            self.ready = true;
        }
    }

    /// Suppress further events for one target. The in-flight invocation is
    /// not interrupted; its remaining events are dropped here.
    pub fn cancel_target(&mut self, target_id: &str) {
        let status = self.statuses.get(target_id).copied();
        if status.is_some_and(TargetStatus::is_terminal) {
            return;
        }
        self.statuses
            .insert(target_id.to_string(), TargetStatus::Canceled);
    }

    /// Cancel every selected target and detach from the active run.
    pub fn cancel_all(&mut self) {
        for target in &self.session.targets {
            self.statuses
                .insert(target.id.clone(), TargetStatus::Canceled);
        }
        self.active_run = None;
    }

    /// Once every target of the active run is terminal, concatenate the
    /// finished answers in target-list order into one synthetic record.
    pub fn merge_run(&mut self) -> Option<&ConversationRecord> {
        self.merge_with(None)
    }

    /// Like [`merge_run`], but labels each reply with its model name under
    /// the given strategy.
    ///
    /// [`merge_run`]: StreamReducer::merge_run
    pub fn merge_run_labeled(&mut self, strategy: MergeStrategy) -> Option<&ConversationRecord> {
        self.merge_with(Some(strategy))
    }

    fn merge_with(&mut self, strategy: Option<MergeStrategy>) -> Option<&ConversationRecord> {
        let run_id = self.active_run.clone()?;
        let all_terminal = self
            .active_targets
            .iter()
            .all(|id| self.status(id).is_some_and(TargetStatus::is_terminal));
        if !all_terminal {
            return None;
        }

        let ordered = self.ordered_target_ids();
        let mut answers = Vec::new();
        let mut labels = Vec::new();
        for target_id in &ordered {
            let found = self.items.iter().find(|item| {
                item.kind == ItemKind::Answer
                    && item.done
                    && item.meta.as_ref().is_some_and(|meta| {
                        meta.run_id.as_deref() == Some(run_id.as_str())
                            && meta.source_target_id.as_deref() == Some(target_id.as_str())
                    })
            });
            if let Some(item) = found {
                answers.push(item.content.clone());
                labels.push(self.model_label(target_id));
            }
        }
        if answers.is_empty() {
            return None;
        }

        let merged = match strategy {
            Some(strategy) => {
                let replies: Vec<Reply> = answers
                    .iter()
                    .zip(labels.iter())
                    .map(|(text, label)| Reply {
                        label: Some(label.clone()),
                        text: text.clone(),
                    })
                    .collect();
                aggregation::build_merged_message(strategy, &replies).text
            }
            None => aggregation::join_answers(&answers),
        };

        let meta = RecordMeta {
            run_id: Some(run_id.clone()),
            source_target_id: None,
            merged_from_target_ids: Some(ordered),
        };
        self.items.push(ConversationItem::new(
            ItemKind::Answer,
            merged.clone(),
            true,
            Some(meta.clone()),
        ));
        self.session.conversation_records.push(ConversationRecord::new(
            self.session.question.clone(),
            merged,
            Some(meta),
        ));
        self.session.conversation_records.last()
    }

    /// Re-dispatch one target as a fresh single-target run, keeping its
    /// continuation state so the target's own thread carries on. Sibling
    /// targets are untouched.
    pub fn retry_target(&mut self, target_id: &str) -> Option<PortRequest> {
        let question = self.latest_question()?;
        let run_id = Uuid::new_v4().to_string();

        self.items.push(ConversationItem::new(
            ItemKind::Answer,
            String::new(),
            false,
            Some(RecordMeta {
                run_id: Some(run_id.clone()),
                source_target_id: Some(target_id.to_string()),
                merged_from_target_ids: None,
            }),
        ));
        self.statuses
            .insert(target_id.to_string(), TargetStatus::Running);
        self.active_run = Some(run_id.clone());
        self.active_targets = vec![target_id.to_string()];

        let target = self
            .session
            .targets
            .iter()
            .find(|target| target.id == target_id)
            .cloned()
            .unwrap_or_else(|| Target::from_model_name(target_id));

        self.session.question = Some(question);
        self.session.is_retry = true;
        self.session.last_run_id = Some(run_id.clone());
        self.ready = false;

        Some(PortRequest::Fanout {
            fanout: FanoutRequest {
                run_id: Some(run_id),
                fanout_mode: Some(FanoutMode::Parallel),
                targets: vec![TargetSpec {
                    id: target.id.clone(),
                    api_mode: target.api_mode.clone(),
                    model_name: Some(target.model_name.clone()),
                }],
            },
            session: self.session.clone(),
        })
    }

    /// Legacy retry of the whole turn: drop the failed record, mark the
    /// session as a retry, and return the stop + resend pair to post.
    pub fn retry_last(&mut self) -> Option<(PortRequest, PortRequest)> {
        let question = self.latest_question()?;
        let should_pop = match self.session.conversation_records.last() {
            Some(last) => {
                let repeated = self
                    .items
                    .len()
                    .checked_sub(2)
                    .map(|i| &self.items[i])
                    .is_some_and(|item| Some(item.content.as_str()) == last.question.as_deref());
                repeated && self.items.last().is_some_and(|item| item.done)
            }
            None => false,
        };
        if should_pop {
            self.session.conversation_records.pop();
        }
        if let Some(index) = self.last_buffer_index() {
            self.items[index].kind = ItemKind::Answer;
            self.items[index].content.clear();
            self.items[index].done = false;
        }
        self.session.question = Some(question);
        self.session.is_retry = true;
        self.ready = false;
        Some((
            PortRequest::Stop { stop: true },
            PortRequest::Ask {
                session: self.session.clone(),
            },
        ))
    }

    /// Clear the conversation: history, target state, run bookkeeping, and
    /// view state reset together.
    pub fn clear(&mut self) {
        self.session.clear();
        self.items.clear();
        self.statuses.clear();
        self.active_run = None;
        self.active_targets.clear();
        self.ready = true;
    }

    fn latest_question(&self) -> Option<String> {
        if let Some(question) = &self.session.question {
            return Some(question.clone());
        }
        if let Some(question) = self
            .session
            .conversation_records
            .iter()
            .rev()
            .find_map(|record| record.question.clone())
        {
            return Some(question);
        }
        self.items
            .iter()
            .rev()
            .find(|item| item.kind == ItemKind::Question)
            .map(|item| item.content.clone())
    }

    fn run_settled(&self) -> bool {
        !self.active_targets.is_empty()
            && self.active_targets.iter().all(|id| {
                matches!(
                    self.status(id),
                    Some(TargetStatus::Done) | Some(TargetStatus::Error)
                )
            })
    }

    /// Target ids of the active run, ordered by the selection list.
    fn ordered_target_ids(&self) -> Vec<String> {
        let mut ordered: Vec<String> = self
            .session
            .targets
            .iter()
            .map(|target| target.id.clone())
            .filter(|id| self.active_targets.contains(id))
            .collect();
        for id in &self.active_targets {
            if !ordered.contains(id) {
                ordered.push(id.clone());
            }
        }
        ordered
    }

    fn model_label(&self, target_id: &str) -> String {
        self.session
            .targets
            .iter()
            .find(|target| target.id == target_id)
            .map(|target| target.model_name.clone())
            .unwrap_or_else(|| target_id.to_string())
    }

    /// Find or create the answer buffer for one (run, target) pair.
    fn buffer_index(&mut self, run_id: &str, target_id: &str) -> usize {
        let found = self.items.iter().rposition(|item| {
            item.kind != ItemKind::Question
                && item.meta.as_ref().is_some_and(|meta| {
                    meta.run_id.as_deref() == Some(run_id)
                        && meta.source_target_id.as_deref() == Some(target_id)
                })
        });
        match found {
            Some(index) => index,
            None => {
                self.items.push(ConversationItem::new(
                    ItemKind::Answer,
                    String::new(),
                    false,
                    Some(RecordMeta {
                        run_id: Some(run_id.to_string()),
                        source_target_id: Some(target_id.to_string()),
                        merged_from_target_ids: None,
                    }),
                ));
                self.items.len() - 1
            }
        }
    }

    /// Index of the single active buffer for the legacy flow.
    fn last_buffer_index(&self) -> Option<usize> {
        self.items
            .iter()
            .rposition(|item| item.kind != ItemKind::Question)
    }
}

/// Expand the two sentinel error codes into user-facing guidance; pretty-
/// print anything that looks like serialized structured data; pass the rest
/// through untouched.
pub fn translate_error(error: &str) -> String {
    match error {
        "UNAUTHORIZED" => "UNAUTHORIZED\nPlease log in to the provider first, then send your \
                           question again.\n\nConsider configuring an API key instead of a web \
                           session."
            .to_string(),
        "CLOUDFLARE" => "Provider security check required\nPlease open the provider's site to \
                         pass the check, then send your question again.\n\nConsider configuring \
                         an API key instead of a web session."
            .to_string(),
        other => {
            if other.trim_start().starts_with('{') {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(other) {
                    if let Ok(pretty) = serde_json::to_string_pretty(&value) {
                        return pretty;
                    }
                }
            }
            other.to_string()
        }
    }
}
