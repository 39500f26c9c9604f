//! History grouping - folds bursts of similar micropayments into one row
//!
//! Pure functions over [`TransactionRecord`]s. A run of same-direction
//! transactions close in time, sharing a recipient or a near-identical
//! description, becomes a [`TransactionGroup`] once it reaches
//! `min_group_size`. Output is newest first.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::config::GroupingOptions;
use crate::provider::{Direction, TransactionRecord};

const RECIPIENT_PREFIX_CHARS: usize = 20;
const SUMMARY_NAME_CHARS: usize = 30;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionGroup {
    /// `group-{start}-{end}-{count}`
    pub id: String,
    pub direction: Direction,
    pub transactions: Vec<TransactionRecord>,
    pub count: usize,
    pub total_amount: u64,
    pub recipient: String,
    pub description: String,
    pub start_time: i64,
    pub end_time: i64,
    /// UI state; groups start collapsed
    pub expanded: bool,
}

impl TransactionGroup {
    /// `None` for an empty run.
    pub fn new(transactions: Vec<TransactionRecord>) -> Option<Self> {
        let first = transactions.first()?;
        let direction = first.direction;
        let recipient = extract_recipient(first);
        let description = first.description.clone();
        let start_time = transactions.iter().map(|t| t.timestamp).min().unwrap_or_default();
        let end_time = transactions.iter().map(|t| t.timestamp).max().unwrap_or_default();
        let total_amount = transactions.iter().map(|t| t.amount).sum();
        let count = transactions.len();
        Some(Self {
            id: format!("group-{start_time}-{end_time}-{count}"),
            direction,
            transactions,
            count,
            total_amount,
            recipient,
            description,
            start_time,
            end_time,
            expanded: false,
        })
    }

    pub fn toggle_expanded(&mut self) {
        self.expanded = !self.expanded;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HistoryEntry {
    Single(TransactionRecord),
    Group(TransactionGroup),
}

impl HistoryEntry {
    /// Sort key for display: a group's last payment, else the transaction's own time.
    pub fn effective_time(&self) -> i64 {
        match self {
            HistoryEntry::Single(tx) => tx.timestamp,
            HistoryEntry::Group(group) => group.end_time,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, HistoryEntry::Group(_))
    }
}

pub fn group_transactions(transactions: &[TransactionRecord], options: &GroupingOptions) -> Vec<HistoryEntry> {
    if !options.enabled || transactions.is_empty() {
        let mut entries: Vec<HistoryEntry> = transactions.iter().cloned().map(HistoryEntry::Single).collect();
        entries.sort_by_key(|e| Reverse(e.effective_time()));
        return entries;
    }

    let mut sorted = transactions.to_vec();
    sorted.sort_by_key(|t| t.timestamp);

    let mut entries = Vec::new();
    let mut run: Vec<TransactionRecord> = Vec::new();
    for tx in sorted {
        let extends = run.last().is_some_and(|last| {
            run.len() < options.max_group_size && should_group(last, &tx, options)
        });
        if !extends {
            flush(&mut run, &mut entries, options.min_group_size);
        }
        run.push(tx);
    }
    flush(&mut run, &mut entries, options.min_group_size);

    entries.sort_by_key(|e| Reverse(e.effective_time()));
    entries
}

fn flush(run: &mut Vec<TransactionRecord>, out: &mut Vec<HistoryEntry>, min_group_size: usize) {
    let members = std::mem::take(run);
    if members.len() >= min_group_size.max(1) {
        if let Some(group) = TransactionGroup::new(members) {
            out.push(HistoryEntry::Group(group));
        }
    } else {
        out.extend(members.into_iter().map(HistoryEntry::Single));
    }
}

pub fn should_group(a: &TransactionRecord, b: &TransactionRecord, options: &GroupingOptions) -> bool {
    if a.direction != b.direction {
        return false;
    }
    if (b.timestamp - a.timestamp).abs() > options.time_window_seconds {
        return false;
    }

    let (ra, rb) = (extract_recipient(a), extract_recipient(b));
    if !ra.is_empty() && ra == rb {
        return true;
    }

    !a.description.is_empty()
        && !b.description.is_empty()
        && calculate_similarity(&a.description, &b.description) >= options.description_similarity
}

/// Jaccard overlap of words longer than two characters, after normalization.
pub fn calculate_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let (na, nb) = (normalize(a), normalize(b));
    if na == nb {
        return 1.0;
    }

    let words = |s: &str| -> HashSet<String> {
        s.split_whitespace().filter(|w| w.chars().count() > 2).map(str::to_string).collect()
    };
    let (wa, wb) = (words(&na), words(&nb));
    if wa.is_empty() || wb.is_empty() {
        return 0.0;
    }
    let shared = wa.intersection(&wb).count();
    let union = wa.union(&wb).count();
    shared as f64 / union as f64
}

fn normalize(s: &str) -> String {
    s.to_lowercase()
        .trim()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect()
}

/// Edit distance over chars. Not used by [`group_transactions`]; available for stricter matching.
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            curr[j] = if a[i - 1] == b[j - 1] {
                prev[j - 1]
            } else {
                1 + prev[j].min(curr[j - 1]).min(prev[j - 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

fn npub_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"npub1[a-zA-Z0-9]{58}").ok()).as_ref()
}

/// First non-empty of: sender npub, npub in the description, payment request
/// prefix, payment hash prefix, trimmed description.
pub fn extract_recipient(tx: &TransactionRecord) -> String {
    if let Some(npub) = tx.sender_npub.as_deref().filter(|s| !s.is_empty()) {
        return npub.to_string();
    }
    if let Some(found) = npub_pattern().and_then(|re| re.find(&tx.description)) {
        return found.as_str().to_string();
    }
    let prefix = |s: &str| s.chars().take(RECIPIENT_PREFIX_CHARS).collect::<String>();
    if let Some(pr) = tx.payment_request.as_deref().filter(|s| !s.is_empty()) {
        return prefix(pr);
    }
    if let Some(hash) = tx.payment_hash.as_deref().filter(|s| !s.is_empty()) {
        return prefix(hash);
    }
    tx.description.trim().to_string()
}

/// "3 payments to coffee shop". Hash-like recipients fall back to the description.
pub fn group_summary(group: &TransactionGroup) -> String {
    let action = match group.direction {
        Direction::Receive => "from",
        Direction::Send => "to",
    };
    let mut name = group.recipient.clone();
    if name.chars().count() > RECIPIENT_PREFIX_CHARS {
        name = group.description.clone();
    }
    if name.chars().count() > SUMMARY_NAME_CHARS {
        name = format!("{}...", name.chars().take(SUMMARY_NAME_CHARS - 3).collect::<String>());
    }
    if name.is_empty() {
        name = "unknown".into();
    }
    let plural = if group.count == 1 { "" } else { "s" };
    format!("{} payment{plural} {action} {name}", group.count)
}
