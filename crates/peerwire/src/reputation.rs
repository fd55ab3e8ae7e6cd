use lru::LruCache;
use parking_lot::Mutex;
use peerwire_common::DisconnectReason;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tracing::debug;

/// Scoring thresholds and adjustments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReputationConfig {
    /// Score a peer starts with.
    pub initial_score: i32,
    /// Ceiling for useful-response credit.
    pub max_score: i32,
    /// Timeouts of one request kind that trigger a disconnect.
    pub timeout_threshold: u32,
    /// Useless responses within `useless_window` that trigger a disconnect.
    pub useless_threshold: usize,
    /// Sliding window for useless responses.
    pub useless_window: Duration,
    /// Penalty or credit applied below a threshold.
    pub small_adjustment: i32,
    /// Penalty applied when a threshold is reached.
    pub large_adjustment: i32,
    /// Identities remembered at once; the least recently seen is forgotten.
    pub capacity: usize,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            initial_score: 100,
            max_score: 150,
            timeout_threshold: 5,
            useless_threshold: 5,
            useless_window: Duration::from_secs(60),
            small_adjustment: 1,
            large_adjustment: 10,
            capacity: 4096,
        }
    }
}

impl ReputationConfig {
    /// Check the thresholds are usable.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_score > self.max_score {
            return Err("initial_score must not exceed max_score".into());
        }
        if self.timeout_threshold == 0 {
            return Err("timeout_threshold must be > 0".into());
        }
        if self.useless_threshold == 0 {
            return Err("useless_threshold must be > 0".into());
        }
        if self.useless_window.is_zero() {
            return Err("useless_window must be > 0".into());
        }
        if self.capacity == 0 {
            return Err("capacity must be > 0".into());
        }
        Ok(())
    }
}

/// Per-peer score and disconnect policy.
///
/// The score is advisory; only the two `record_*` calls that return a
/// verdict should drive disconnects.
#[derive(Debug, Clone)]
pub struct PeerReputation {
    config: ReputationConfig,
    score: i32,
    timeout_counts: HashMap<u32, u32>,
    useless_responses: VecDeque<Instant>,
}

impl PeerReputation {
    /// Creates a reputation at the configured initial score.
    #[must_use]
    pub fn new(config: ReputationConfig) -> Self {
        Self {
            score: config.initial_score,
            config,
            timeout_counts: HashMap::new(),
            useless_responses: VecDeque::new(),
        }
    }

    /// Records a timed-out request of the given kind.
    ///
    /// Returns [`DisconnectReason::Timeout`] once the kind's count reaches the
    /// threshold, and on every timeout after that until the count is reset.
    pub fn record_request_timeout(&mut self, kind: u32) -> Option<DisconnectReason> {
        let count = self.timeout_counts.entry(kind).or_insert(0);
        *count = count.saturating_add(1);
        let count = *count;

        if count >= self.config.timeout_threshold {
            debug!(kind, count, "repeated request timeouts, disconnect");
            self.score = self.score.saturating_sub(self.config.large_adjustment);
            Some(DisconnectReason::Timeout)
        } else {
            self.score = self.score.saturating_sub(self.config.small_adjustment);
            None
        }
    }

    /// Clears the timeout count of one request kind.
    pub fn reset_timeout_count(&mut self, kind: u32) {
        self.timeout_counts.remove(&kind);
    }

    /// Records a useless response observed at `now`.
    ///
    /// Entries older than the window are evicted first; if the window then
    /// holds `useless_threshold` entries the verdict is
    /// [`DisconnectReason::UselessPeer`].
    pub fn record_useless_response(&mut self, now: Instant) -> Option<DisconnectReason> {
        self.useless_responses.push_back(now);
        while let Some(&oldest) = self.useless_responses.front() {
            if now.saturating_duration_since(oldest) > self.config.useless_window {
                self.useless_responses.pop_front();
            } else {
                break;
            }
        }

        if self.useless_responses.len() >= self.config.useless_threshold {
            debug!(
                count = self.useless_responses.len(),
                "useless response threshold exceeded, disconnect"
            );
            self.score = self.score.saturating_sub(self.config.large_adjustment);
            Some(DisconnectReason::UselessPeer)
        } else {
            self.score = self.score.saturating_sub(self.config.small_adjustment);
            None
        }
    }

    /// Credits a useful response, never above the maximum.
    pub fn record_useful_response(&mut self) {
        self.score = self
            .score
            .saturating_add(self.config.small_adjustment)
            .min(self.config.max_score);
    }

    /// Current advisory score.
    #[must_use]
    pub const fn score(&self) -> i32 {
        self.score
    }

    /// Timeout count for one request kind.
    #[must_use]
    pub fn timeout_count(&self, kind: u32) -> u32 {
        self.timeout_counts.get(&kind).copied().unwrap_or(0)
    }

    /// Timeout counts of every kind seen since the last reset.
    #[must_use]
    pub const fn timeout_counts(&self) -> &HashMap<u32, u32> {
        &self.timeout_counts
    }
}

impl Default for PeerReputation {
    fn default() -> Self {
        Self::new(ReputationConfig::default())
    }
}

impl std::fmt::Display for PeerReputation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "score {}, timeouts {:?}, useless {}",
            self.score,
            self.timeout_counts,
            self.useless_responses.len()
        )
    }
}

/// Reputations of recently seen peers, keyed by identity.
///
/// Outlives individual connections so a reconnecting peer keeps its record.
/// Bounded by [`ReputationConfig::capacity`].
pub struct ReputationBook {
    config: ReputationConfig,
    entries: Mutex<LruCache<String, PeerReputation>>,
}

impl ReputationBook {
    /// Creates an empty book.
    #[must_use]
    pub fn new(config: ReputationConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Starts tracking `identity` at the initial score, or marks an existing
    /// record as recently seen.
    pub fn track(&self, identity: &str) {
        let mut entries = self.entries.lock();
        if entries.get(identity).is_none() {
            entries.put(identity.to_owned(), PeerReputation::new(self.config.clone()));
        }
    }

    /// Applies `f` to the record of `identity`, if tracked.
    pub fn update<T>(
        &self,
        identity: &str,
        f: impl FnOnce(&mut PeerReputation) -> T,
    ) -> Option<T> {
        self.entries.lock().get_mut(identity).map(f)
    }

    /// Score of `identity`, if tracked.
    #[must_use]
    pub fn score(&self, identity: &str) -> Option<i32> {
        self.entries.lock().peek(identity).map(PeerReputation::score)
    }

    /// Number of tracked identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if no identity is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl std::fmt::Debug for ReputationBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReputationBook")
            .field("len", &self.len())
            .field("capacity", &self.config.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_below_threshold_gives_no_verdict() {
        let mut rep = PeerReputation::default();
        for _ in 0..4 {
            assert_eq!(rep.record_request_timeout(7), None);
        }
        assert_eq!(rep.score(), 96);
        assert_eq!(rep.timeout_count(7), 4);
    }

    #[test]
    fn test_timeout_at_threshold_gives_timeout_verdict() {
        let mut rep = PeerReputation::default();
        for _ in 0..4 {
            rep.record_request_timeout(7);
        }
        assert_eq!(
            rep.record_request_timeout(7),
            Some(DisconnectReason::Timeout)
        );
        assert_eq!(rep.score(), 86);
    }

    #[test]
    fn test_timeout_counts_are_per_kind() {
        let mut rep = PeerReputation::default();
        for _ in 0..4 {
            assert_eq!(rep.record_request_timeout(1), None);
            assert_eq!(rep.record_request_timeout(2), None);
        }
        assert_eq!(rep.timeout_counts().len(), 2);
    }

    #[test]
    fn test_reset_timeout_count_restarts_counting() {
        let mut rep = PeerReputation::default();
        for _ in 0..4 {
            rep.record_request_timeout(3);
        }
        rep.reset_timeout_count(3);
        assert_eq!(rep.timeout_count(3), 0);
        assert_eq!(rep.record_request_timeout(3), None);
    }

    #[test]
    fn test_useless_responses_within_window_give_verdict() {
        let mut rep = PeerReputation::default();
        let start = Instant::now();
        for i in 0..4 {
            let at = start + Duration::from_secs(i);
            assert_eq!(rep.record_useless_response(at), None);
        }
        assert_eq!(
            rep.record_useless_response(start + Duration::from_secs(4)),
            Some(DisconnectReason::UselessPeer)
        );
    }

    #[test]
    fn test_useless_responses_outside_window_are_evicted() {
        let mut rep = PeerReputation::default();
        let start = Instant::now();
        for i in 0..4 {
            rep.record_useless_response(start + Duration::from_secs(i));
        }
        // All four earlier entries are more than a minute old by now.
        let later = start + Duration::from_secs(125);
        assert_eq!(rep.record_useless_response(later), None);
    }

    #[test]
    fn test_useful_response_is_capped_at_max() {
        let mut rep = PeerReputation::new(ReputationConfig {
            initial_score: 149,
            ..ReputationConfig::default()
        });
        rep.record_useful_response();
        rep.record_useful_response();
        assert_eq!(rep.score(), 150);
    }

    #[test]
    fn test_book_forgets_least_recently_seen_identity() {
        let book = ReputationBook::new(ReputationConfig {
            capacity: 2,
            ..ReputationConfig::default()
        });
        book.track("a");
        book.track("b");
        book.track("a");
        book.track("c");

        assert_eq!(book.len(), 2);
        assert_eq!(book.score("b"), None);
        assert_eq!(book.score("a"), Some(100));
        assert_eq!(book.score("c"), Some(100));
    }

    #[test]
    fn test_book_stays_bounded_under_identity_churn() {
        let book = ReputationBook::new(ReputationConfig {
            capacity: 16,
            ..ReputationConfig::default()
        });
        for i in 0..10_000 {
            book.track(&format!("fresh-{i}"));
        }
        assert_eq!(book.len(), 16);
    }

    #[test]
    fn test_book_keeps_record_across_track_calls() {
        let book = ReputationBook::new(ReputationConfig::default());
        book.track("peer");
        assert_eq!(book.update("peer", |r| r.record_request_timeout(1)), Some(None));
        book.track("peer");
        assert_eq!(book.score("peer"), Some(99));
        assert_eq!(book.update("ghost", |r| r.score()), None);
    }

    #[test]
    fn test_config_validation() {
        assert!(ReputationConfig::default().validate().is_ok());
        let bad = ReputationConfig {
            initial_score: 200,
            ..ReputationConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = ReputationConfig {
            timeout_threshold: 0,
            ..ReputationConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = ReputationConfig {
            capacity: 0,
            ..ReputationConfig::default()
        };
        assert!(bad.validate().unwrap_err().contains("capacity"));
    }
}
