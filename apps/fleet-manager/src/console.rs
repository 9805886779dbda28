//! Console pipeline: cursor dedup, classification, chunking, batching, and the
//! outbound queues the chat bridge drains.
//!
//! Everything here is synchronous. The poller in [`crate::streaming`] fetches
//! entries and hands them to [`ConsolePipeline::process`]; the only state shared
//! with the consumer is [`OutboundQueues`], whose locks are held for one push or
//! pop and never across a network call.

use std::collections::VecDeque;

use panel_client::models::ConsoleEntry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::variants::ModuleBehavior;

pub const CHUNK_DELIMITER: char = ';';
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Last console timestamp delivered for one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleCursor {
    pub last_seen_ms: Option<i64>,
    /// False until the first entry after a (re)start has been consumed.
    #[serde(skip)]
    pub primed: bool,
}

impl ConsoleCursor {
    pub fn resume_from(last_seen_ms: Option<i64>) -> Self {
        Self {
            last_seen_ms,
            primed: false,
        }
    }

    fn advance(&mut self, timestamp_ms: i64) {
        self.last_seen_ms = Some(match self.last_seen_ms {
            Some(current) => current.max(timestamp_ms),
            None => timestamp_ms,
        });
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub duplicates: usize,
    pub filtered: usize,
    pub chat: usize,
    pub dropped: usize,
    pub emitted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOutput {
    pub plain_batches: Vec<String>,
    pub chat_entries: Vec<ConsoleEntry>,
    pub stats: CycleStats,
}

#[derive(Debug, Clone)]
pub struct ConsolePipeline {
    budget: usize,
    mirror_chat: bool,
}

impl ConsolePipeline {
    pub fn new(budget: usize, mirror_chat: bool) -> Self {
        Self {
            budget: budget.max(1),
            mirror_chat,
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Runs one poll cycle's entries through dedup, classification, chunking and
    /// batching. Entries at or before the cursor as it stood when the cycle began
    /// are dropped; the very first entry after a (re)start only seeds the cursor.
    pub fn process(
        &self,
        cursor: &mut ConsoleCursor,
        entries: &[ConsoleEntry],
        behavior: &dyn ModuleBehavior,
    ) -> CycleOutput {
        let mut out = CycleOutput::default();
        let floor = cursor.last_seen_ms;
        let mut lines = Vec::new();

        for entry in entries {
            if !cursor.primed {
                cursor.primed = true;
                cursor.advance(entry.timestamp_ms);
                out.stats.duplicates += 1;
                continue;
            }
            if floor.map(|f| entry.timestamp_ms <= f).unwrap_or(false) {
                out.stats.duplicates += 1;
                continue;
            }
            cursor.advance(entry.timestamp_ms);

            if behavior.is_chat_entry(entry) {
                out.stats.chat += 1;
                out.chat_entries.push(entry.clone());
                if !self.mirror_chat {
                    continue;
                }
            }
            if behavior.should_filter(entry) {
                out.stats.filtered += 1;
                continue;
            }
            match chunk_line(&entry.contents, self.budget, CHUNK_DELIMITER) {
                Some(fragments) => {
                    out.stats.emitted += 1;
                    lines.extend(fragments);
                }
                None => out.stats.dropped += 1,
            }
        }

        out.plain_batches = batch_lines(lines, self.budget);
        out
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Splits an over-budget line at the rightmost delimiter that keeps the head
/// within `budget` characters, repeatedly. Delimiters used as split points are
/// removed. Returns `None` when the line cannot be split without a hard cut.
pub fn chunk_line(line: &str, budget: usize, delimiter: char) -> Option<Vec<String>> {
    if char_len(line) <= budget {
        return Some(vec![line.to_string()]);
    }
    if !line.contains(delimiter) {
        return None;
    }

    let mut fragments = Vec::new();
    let mut rest = line;
    while char_len(rest) > budget {
        // a delimiter at char index `budget` still leaves a `budget`-long head
        let window_end = rest
            .char_indices()
            .nth(budget + 1)
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());
        let split = rest[..window_end].rfind(delimiter)?;
        let head = &rest[..split];
        if !head.is_empty() {
            fragments.push(head.to_string());
        }
        rest = &rest[split + delimiter.len_utf8()..];
    }
    if !rest.is_empty() {
        fragments.push(rest.to_string());
    }
    Some(fragments)
}

/// Joins lines with newlines into batches no longer than `budget` characters.
/// Lines are expected to be within budget already; one that is not gets a
/// batch of its own.
pub fn batch_lines<I>(lines: I, budget: usize) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut batches = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in lines {
        let len = char_len(&line);
        if !current.is_empty() && current_len + 1 + len > budget {
            batches.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(&line);
        current_len += len;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Per-instance outbound queues. One producer (the poller), one consumer.
///
/// Each queue holds at most `capacity` items; when the consumer falls behind,
/// the oldest items are evicted to make room.
pub struct OutboundQueues {
    capacity: usize,
    plain: Mutex<VecDeque<String>>,
    chat: Mutex<VecDeque<ConsoleEntry>>,
}

impl Default for OutboundQueues {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }
}

impl OutboundQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            plain: Mutex::new(VecDeque::new()),
            chat: Mutex::new(VecDeque::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns how many queued batches were evicted to fit the new ones.
    pub fn push_plain(&self, batches: Vec<String>) -> usize {
        if batches.is_empty() {
            return 0;
        }
        push_bounded(&mut self.plain.lock(), batches, self.capacity)
    }

    /// Returns how many queued entries were evicted to fit the new ones.
    pub fn push_chat(&self, entries: Vec<ConsoleEntry>) -> usize {
        if entries.is_empty() {
            return 0;
        }
        push_bounded(&mut self.chat.lock(), entries, self.capacity)
    }

    pub fn pop_plain(&self) -> Option<String> {
        self.plain.lock().pop_front()
    }

    pub fn pop_chat(&self) -> Option<ConsoleEntry> {
        self.chat.lock().pop_front()
    }

    pub fn plain_len(&self) -> usize {
        self.plain.lock().len()
    }

    pub fn chat_len(&self) -> usize {
        self.chat.lock().len()
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, items: Vec<T>, capacity: usize) -> usize {
    let mut evicted = 0;
    for item in items {
        if queue.len() == capacity {
            queue.pop_front();
            evicted += 1;
        }
        queue.push_back(item);
    }
    evicted
}
