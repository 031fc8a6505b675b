//! Subscription matcher (spec §4.C): a per-client ordered list of
//! header-pattern conditions, kept with modifying conditions first so a
//! linear scan's first match is always the highest-priority modifier if
//! one matches at all.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mds_core::marshal::{get_string, put_string, read_version_tag};
use mds_core::{CoreError, Marshal};
use mds_proto::HeaderList;

/// A single subscription/interception condition (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    /// `""`, `"Name"`, or `"Name: value"`.
    pub pattern: String,
    /// Higher values are delivered first.
    pub priority: i64,
    /// Whether this subscriber may rewrite the message during dispatch.
    pub modifying: bool,
}

impl Marshal for Condition {
    const VERSION: u32 = 1;

    fn marshal_size(&self) -> usize {
        4 + 4 + self.pattern.len() + 8 + 1
    }

    fn marshal(&self, buffer: &mut BytesMut) {
        buffer.put_u32(Self::VERSION);
        put_string(buffer, &self.pattern);
        buffer.put_i64(self.priority);
        buffer.put_u8(u8::from(self.modifying));
    }

    fn unmarshal(buffer: &mut Bytes) -> mds_core::marshal::Result<Self> {
        read_version_tag(buffer, Self::VERSION)?;
        let pattern = get_string(buffer, "condition pattern")?;
        if buffer.remaining() < 9 {
            return Err(CoreError::Truncated { context: "condition" });
        }
        let priority = buffer.get_i64();
        let modifying = buffer.get_u8() != 0;
        Ok(Self { pattern, priority, modifying })
    }
}

/// Per-client subscription state.
///
/// Invariant upheld by every mutating method: all `modifying` conditions
/// precede all non-modifying conditions in `conditions`.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionMatcher {
    conditions: Vec<Condition>,
}

impl SubscriptionMatcher {
    /// An empty matcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a matcher from a previously marshalled condition list
    /// (spec §4.F); the invariant already held when marshalled.
    #[must_use]
    pub fn from_conditions(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }

    /// Current conditions, modifying-first, for inspection (signal "info"
    /// dump, tests).
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Add a new condition or overwrite the priority/modifying flag of an
    /// existing one with the same pattern.
    ///
    /// If the resulting condition is modifying and any non-modifying
    /// conditions precede it, it is moved ahead of the first one to
    /// restore the modifying-first invariant.
    pub fn add_or_update(&mut self, pattern: impl Into<String>, priority: i64, modifying: bool) {
        let pattern = pattern.into();
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.pattern == pattern) {
            existing.priority = priority;
            existing.modifying = modifying;
        } else {
            self.conditions.push(Condition { pattern, priority, modifying });
        }
        self.restore_modifying_first_invariant();
    }

    /// Remove the condition with the given pattern, if any.
    pub fn remove(&mut self, pattern: &str) {
        self.conditions.retain(|c| c.pattern != pattern);
    }

    /// Find the first condition (in modifying-first order) whose pattern
    /// matches `headers`.
    ///
    /// By the modifying-first invariant, the returned match is modifying
    /// if any modifying condition at all matches this header set.
    #[must_use]
    pub fn query(&self, headers: &HeaderList) -> Option<(i64, bool)> {
        self.conditions
            .iter()
            .find(|c| headers.matches_pattern(&c.pattern))
            .map(|c| (c.priority, c.modifying))
    }

    fn restore_modifying_first_invariant(&mut self) {
        let Some(last_modifying) = self.conditions.iter().rposition(|c| c.modifying) else {
            return;
        };
        let Some(first_non_modifying) = self.conditions.iter().position(|c| !c.modifying) else {
            return;
        };
        if first_non_modifying < last_modifying {
            // A non-modifying condition precedes a modifying one; swap the
            // offending pair into place one step at a time until sorted.
            // Small-N bubble pass: subscription lists are O(1)-O(10) per
            // spec §9, so this is not a hot path worth a stable sort.
            let moved = self.conditions.remove(last_modifying);
            self.conditions.insert(first_non_modifying, moved);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn headers_with(name: &str, value: &str) -> HeaderList {
        let mut headers = HeaderList::new();
        headers.push(name, value).unwrap();
        headers
    }

    #[test]
    fn add_then_query_matches() {
        let mut matcher = SubscriptionMatcher::new();
        matcher.add_or_update("Command: ping", 0, false);
        let headers = headers_with("Command", "ping");
        assert_eq!(matcher.query(&headers), Some((0, false)));
    }

    #[test]
    fn update_overwrites_existing_pattern() {
        let mut matcher = SubscriptionMatcher::new();
        matcher.add_or_update("Command", 0, false);
        matcher.add_or_update("Command", 5, false);
        assert_eq!(matcher.conditions().len(), 1);
        assert_eq!(matcher.conditions()[0].priority, 5);
    }

    #[test]
    fn modifying_condition_moves_ahead_of_non_modifying() {
        let mut matcher = SubscriptionMatcher::new();
        matcher.add_or_update("A", 0, false);
        matcher.add_or_update("B", 0, false);
        matcher.add_or_update("C", 10, true);

        assert!(matcher.conditions()[0].modifying);
        assert_eq!(matcher.conditions()[0].pattern, "C");
    }

    #[test]
    fn query_prefers_modifying_match_when_both_match() {
        let mut matcher = SubscriptionMatcher::new();
        matcher.add_or_update("", 0, false);
        matcher.add_or_update("", 10, true);
        let headers = headers_with("Anything", "x");
        assert_eq!(matcher.query(&headers), Some((10, true)));
    }

    #[test]
    fn remove_drops_matching_pattern() {
        let mut matcher = SubscriptionMatcher::new();
        matcher.add_or_update("Command: ping", 0, false);
        matcher.remove("Command: ping");
        assert!(matcher.conditions().is_empty());
    }

    #[test]
    fn empty_pattern_matches_everything() {
        let mut matcher = SubscriptionMatcher::new();
        matcher.add_or_update("", 0, false);
        let headers = headers_with("Whatever", "value");
        assert_eq!(matcher.query(&headers), Some((0, false)));
    }
}
