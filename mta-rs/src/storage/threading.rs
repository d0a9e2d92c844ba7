//! Thread reconstruction over the flat message log
//!
//! Everything here is a pure function of the log: [`normalize`] repairs
//! parent links and assigns `thread_id`, [`build_index`] buckets messages
//! into per-identity inboxes. The store calls both after every mutation.

use super::message::Message;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Upper bound on `reply_to` hops followed for one message
pub const MAX_THREAD_DEPTH: usize = 10_000;

/// Messages sharing one `thread_id`, as seen by one identity
#[derive(Debug, Clone, Serialize)]
pub struct Thread {
    pub root: Message,
    /// Ordered by `created_at`
    pub messages: Vec<Message>,
    pub latest: Message,
    pub has_unread: bool,
}

/// Per-identity view: `thread_id -> Thread` plus the cached unread count
#[derive(Debug, Clone, Default, Serialize)]
pub struct Inbox {
    pub threads: HashMap<String, Thread>,
    pub unread_count: usize,
}

impl Inbox {
    /// Threads with the most recent activity first
    pub fn threads_by_recency(&self) -> Vec<&Thread> {
        let mut threads: Vec<&Thread> = self.threads.values().collect();
        threads.sort_by(|a, b| {
            b.latest
                .created_at
                .cmp(&a.latest.created_at)
                .then_with(|| b.latest.id.cmp(&a.latest.id))
        });
        threads
    }
}

/// What [`normalize`] had to repair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeReport {
    pub orphans: usize,
    pub cycles_broken: usize,
}

/// Walk `reply_to` links upward from `id` and return the thread root id
///
/// Stops at a message without parent, at a parent missing from `by_id`
/// (dangling reference), on a revisited id, or after [`MAX_THREAD_DEPTH`] hops.
pub fn resolve_thread_id(id: &str, by_id: &HashMap<&str, &Message>) -> String {
    let mut current = id;
    let mut visited: HashSet<&str> = HashSet::new();

    for _ in 0..MAX_THREAD_DEPTH {
        visited.insert(current);

        let Some(message) = by_id.get(current) else {
            return current.to_string();
        };

        if message.reply_to.is_empty() {
            return current.to_string();
        }

        let parent = message.reply_to.as_str();
        if !by_id.contains_key(parent) || visited.contains(parent) {
            return current.to_string();
        }

        current = parent;
    }

    current.to_string()
}

/// Repair parent links in place and assign every `thread_id`
///
/// - a `reply_to` naming a missing message (or itself) is cleared: the
///   message becomes an orphaned root
/// - a `reply_to` cycle is broken at its earliest message (by `created_at`,
///   then `id`), which becomes the root
pub fn normalize(messages: &mut [Message]) -> NormalizeReport {
    let mut report = NormalizeReport::default();

    let ids: HashSet<String> = messages.iter().map(|m| m.id.clone()).collect();
    for message in messages.iter_mut() {
        if message.reply_to.is_empty() {
            continue;
        }
        if message.reply_to == message.id || !ids.contains(&message.reply_to) {
            warn!(
                "Message {} replies to unknown message {}, treating it as a thread root",
                message.id, message.reply_to
            );
            message.reply_to.clear();
            report.orphans += 1;
        }
    }

    report.cycles_broken = break_cycles(messages);

    let thread_ids: Vec<String> = {
        let by_id: HashMap<&str, &Message> =
            messages.iter().map(|m| (m.id.as_str(), m)).collect();
        messages
            .iter()
            .map(|m| resolve_thread_id(&m.id, &by_id))
            .collect()
    };

    for (message, thread_id) in messages.iter_mut().zip(thread_ids) {
        message.thread_id = thread_id;
    }

    report
}

fn break_cycles(messages: &mut [Message]) -> usize {
    let index: HashMap<String, usize> = messages
        .iter()
        .enumerate()
        .map(|(i, m)| (m.id.clone(), i))
        .collect();

    // 0 = unvisited, 1 = on the current path, 2 = known to reach a root
    let mut state = vec![0u8; messages.len()];
    let mut broken = 0;

    for start in 0..messages.len() {
        if state[start] != 0 {
            continue;
        }

        let mut path: Vec<usize> = Vec::new();
        let mut current = start;

        loop {
            match state[current] {
                2 => break,
                1 => {
                    // `current` closes a loop: the cycle is path[pos..]
                    let pos = path.iter().position(|&i| i == current).unwrap_or(0);
                    let cycle = &path[pos..];
                    let earliest = cycle
                        .iter()
                        .copied()
                        .min_by(|&a, &b| {
                            messages[a]
                                .created_at
                                .cmp(&messages[b].created_at)
                                .then_with(|| messages[a].id.cmp(&messages[b].id))
                        })
                        .unwrap_or(current);

                    warn!(
                        "Reply cycle of {} message(s) detected, {} becomes the thread root",
                        cycle.len(),
                        messages[earliest].id
                    );
                    messages[earliest].reply_to.clear();
                    broken += 1;
                    break;
                }
                _ => {}
            }

            state[current] = 1;
            path.push(current);

            let parent = &messages[current].reply_to;
            if parent.is_empty() {
                break;
            }
            match index.get(parent) {
                Some(&next) => current = next,
                None => break,
            }
        }

        for i in path {
            state[i] = 2;
        }
    }

    broken
}

/// Bucket the (normalized) log into per-identity inboxes
pub fn build_index(messages: &[Message]) -> HashMap<String, Inbox> {
    let by_id: HashMap<&str, &Message> = messages.iter().map(|m| (m.id.as_str(), m)).collect();

    // identity -> thread_id -> messages
    let mut buckets: HashMap<&str, HashMap<&str, Vec<&Message>>> = HashMap::new();
    for message in messages {
        let thread_id = if message.thread_id.is_empty() {
            message.id.as_str()
        } else {
            message.thread_id.as_str()
        };

        buckets
            .entry(message.from_id.as_str())
            .or_default()
            .entry(thread_id)
            .or_default()
            .push(message);

        if message.to_id != message.from_id {
            buckets
                .entry(message.to_id.as_str())
                .or_default()
                .entry(thread_id)
                .or_default()
                .push(message);
        }
    }

    buckets
        .into_iter()
        .map(|(identity, threads)| {
            let mut inbox = Inbox::default();

            for (thread_id, mut members) in threads {
                members.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

                let unread = members
                    .iter()
                    .filter(|m| m.to_id == identity && !m.read)
                    .count();
                inbox.unread_count += unread;

                let root = by_id
                    .get(thread_id)
                    .copied()
                    .unwrap_or(members[0])
                    .clone();
                let latest = members[members.len() - 1].clone();

                inbox.threads.insert(
                    thread_id.to_string(),
                    Thread {
                        root,
                        messages: members.into_iter().cloned().collect(),
                        latest,
                        has_unread: unread > 0,
                    },
                );
            }

            (identity.to_string(), inbox)
        })
        .collect()
}
