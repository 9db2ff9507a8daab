//! Append-only conversation merging.
//!
//! Held messages are never removed or reordered by a merge. The only way a
//! message leaves a [`ConversationLog`] is the size cap, which retires the
//! oldest entries and remembers their ids so a later fetch cannot bring them
//! back.

use std::collections::{HashSet, VecDeque};

use cloud_agent_api::Message;

/// Merges a freshly fetched sequence into the held one.
///
/// An empty held sequence is replaced by `fetched` wholesale. Otherwise only
/// messages whose ids are not held yet are appended, in fetched order.
#[must_use]
pub fn merge_messages(held: &[Message], fetched: &[Message]) -> Vec<Message> {
    let mut seen: HashSet<&str> = held.iter().map(|message| message.id.as_str()).collect();
    let mut merged = held.to_vec();
    for message in fetched {
        if seen.insert(message.id.as_str()) {
            merged.push(message.clone());
        }
    }
    merged
}

#[derive(Debug, Clone)]
pub struct ConversationLog {
    messages: VecDeque<Message>,
    /// Ids of every message held now or retired by the cap.
    known: HashSet<String>,
    cap: usize,
}

impl ConversationLog {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            known: HashSet::new(),
            cap: cap.max(1),
        }
    }

    /// Starts over from `messages`, forgetting retired ids.
    pub fn reset(&mut self, messages: &[Message]) {
        self.messages.clear();
        self.known.clear();
        self.merge(messages);
    }

    /// Returns the number of messages appended.
    pub fn merge(&mut self, fetched: &[Message]) -> usize {
        let mut appended = 0;
        for message in fetched {
            if self.known.insert(message.id.clone()) {
                self.messages.push_back(message.clone());
                appended += 1;
            }
        }
        self.enforce_cap();
        appended
    }

    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Ids of held user messages whose trimmed text equals `text`.
    #[must_use]
    pub fn user_message_ids_with_text(&self, text: &str) -> HashSet<String> {
        let text = text.trim();
        self.messages
            .iter()
            .filter(|message| message.is_user() && message.text.trim() == text)
            .map(|message| message.id.clone())
            .collect()
    }

    fn enforce_cap(&mut self) {
        let excess = self.messages.len().saturating_sub(self.cap);
        if excess > 0 {
            tracing::debug!(retired = excess, cap = self.cap, "retiring oldest messages");
            self.messages.drain(..excess);
        }
    }
}

/// An optimistic follow-up waiting for its authoritative echo.
///
/// Same-text user messages already held at submission time do not count as
/// the echo, so repeating an earlier prompt still shows the placeholder until
/// the new message arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFollowUp {
    pub text: String,
    preexisting: HashSet<String>,
}

impl PendingFollowUp {
    #[must_use]
    pub fn new(text: impl Into<String>, log: &ConversationLog) -> Self {
        let text = text.into();
        let preexisting = log.user_message_ids_with_text(&text);
        Self { text, preexisting }
    }

    #[must_use]
    pub fn is_resolved_by(&self, log: &ConversationLog) -> bool {
        log.user_message_ids_with_text(&self.text)
            .iter()
            .any(|id| !self.preexisting.contains(id))
    }
}
