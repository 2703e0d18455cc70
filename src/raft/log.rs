use serde::{Deserialize, Serialize};

/// A single entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term in which the entry was created.
    pub term: u64,
    /// Position of the entry in the log, starting at 0.
    pub index: u64,
    /// Opaque command bytes handed to the state machine on commit.
    pub command: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        Self {
            term,
            index,
            command,
        }
    }
}

/// Ordered sequence of log entries.
///
/// Log matching: if two logs contain an entry with the same index and term,
/// the logs are identical in all entries up through that entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn size(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.last()
    }

    pub fn get(&self, position: u64) -> Option<&LogEntry> {
        self.entries.get(position as usize)
    }

    /// Highest position holding an entry with exactly this index and term.
    pub fn position_of(&self, index: u64, term: u64) -> Option<u64> {
        self.entries
            .iter()
            .rposition(|e| e.index == index && e.term == term)
            .map(|p| p as u64)
    }

    pub fn append(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    pub fn extend(&mut self, entries: Vec<LogEntry>) {
        self.entries.extend(entries);
    }

    /// Keep entries up to and including `position`, drop the rest.
    pub fn truncate_after(&mut self, position: u64) {
        self.entries.truncate(position as usize + 1);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Clone of every entry at `position` and beyond.
    pub fn entries_from(&self, position: u64) -> Vec<LogEntry> {
        if position as usize >= self.entries.len() {
            return Vec::new();
        }
        self.entries[position as usize..].to_vec()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_log() -> Log {
        let mut log = Log::new();
        log.append(LogEntry::new(1, 0, b"a".to_vec()));
        log.append(LogEntry::new(1, 1, b"b".to_vec()));
        log.append(LogEntry::new(2, 2, b"c".to_vec()));
        log
    }

    #[test]
    fn size_and_last() {
        let log = sample_log();
        assert_eq!(log.size(), 3);
        assert_eq!(log.last().unwrap().index, 2);
        assert_eq!(log.last().unwrap().term, 2);

        assert!(Log::new().is_empty());
        assert!(Log::new().last().is_none());
    }

    #[test]
    fn position_of_requires_matching_term() {
        let log = sample_log();
        assert_eq!(log.position_of(1, 1), Some(1));
        assert_eq!(log.position_of(1, 2), None);
        assert_eq!(log.position_of(5, 1), None);
    }

    #[test]
    fn truncate_after_keeps_inclusive_prefix() {
        let mut log = sample_log();
        log.truncate_after(1);
        assert_eq!(log.size(), 2);
        assert_eq!(log.last().unwrap().index, 1);

        // Truncating past the end is a no-op.
        log.truncate_after(10);
        assert_eq!(log.size(), 2);
    }

    #[test]
    fn entries_from_clones_suffix() {
        let log = sample_log();
        let tail = log.entries_from(1);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].index, 1);
        assert_eq!(tail[1].index, 2);

        assert!(log.entries_from(3).is_empty());
        assert_eq!(log.entries_from(0).len(), 3);
    }

    #[test]
    fn structural_equality() {
        let a = LogEntry::new(1, 0, b"x".to_vec());
        let b = LogEntry::new(1, 0, b"x".to_vec());
        let c = LogEntry::new(2, 0, b"x".to_vec());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
