//! Sorted set: member map + score-ordered skiplist in lock-step.
//!
//! The dictionary gives O(1) membership and score lookup; the skiplist
//! gives ordered access by rank and by score range. Every `(member,
//! score)` present in one is present in the other.

use hashbrown::HashMap;

use crate::border::ScoreBorder;
pub use crate::skiplist::Element;
use crate::skiplist::SkipList;

/// Score-ordered set of unique members.
#[derive(Debug, Default)]
pub struct SortedSet {
    scores: HashMap<Vec<u8>, f64>,
    list: SkipList,
}

impl SortedSet {
    /// Creates an empty sorted set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the member count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Returns whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Adds a member or re-scores an existing one.
    ///
    /// Returns `true` when the member was newly inserted. Re-inserting
    /// with an unchanged score is a no-op; a changed score atomically
    /// re-links the member without changing its identity.
    pub fn add(&mut self, member: Vec<u8>, score: f64) -> bool {
        match self.scores.get(&member).copied() {
            Some(existing) => {
                if existing != score {
                    let _ = self.list.delete(&member, existing);
                    self.list.insert(member.clone(), score);
                    let _ = self.scores.insert(member, score);
                }
                false
            }
            None => {
                self.list.insert(member.clone(), score);
                let _ = self.scores.insert(member, score);
                true
            }
        }
    }

    /// Returns the member's score.
    #[must_use]
    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.scores.get(member).copied()
    }

    /// Removes a member. Returns whether it was present.
    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                let _ = self.list.delete(member, score);
                true
            }
            None => false,
        }
    }

    /// 0-based rank of a member; ascending unless `desc`.
    #[must_use]
    pub fn rank(&self, member: &[u8], desc: bool) -> Option<usize> {
        let score = self.score(member)?;
        let ascending = self.list.rank(member, score);
        if ascending == 0 {
            return None;
        }
        if desc {
            Some(self.list.len() - ascending)
        } else {
            Some(ascending - 1)
        }
    }

    /// Elements with 0-based rank in `[start, stop)`; `desc` reverses the
    /// direction the ranks are counted from.
    #[must_use]
    pub fn range_by_rank(&self, start: usize, stop: usize, desc: bool) -> Vec<Element> {
        if start >= stop {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(stop - start);
        self.list
            .for_each_by_rank(start, stop - start, desc, |member, score| {
                out.push(Element {
                    member: member.to_vec(),
                    score,
                });
                true
            });
        out
    }

    /// Counts elements whose score the borders admit.
    #[must_use]
    pub fn count_by_score(&self, min: &ScoreBorder, max: &ScoreBorder) -> usize {
        self.list.count_in_range(min, max)
    }

    /// Elements admitted by `[min, max]` after `offset`, at most `limit`
    /// (`None` = unbounded), descending when `desc`.
    #[must_use]
    pub fn range_by_score(
        &self,
        min: &ScoreBorder,
        max: &ScoreBorder,
        offset: usize,
        limit: Option<usize>,
        desc: bool,
    ) -> Vec<Element> {
        let mut out = Vec::new();
        self.list
            .for_each_in_range(min, max, offset, limit, desc, |member, score| {
                out.push(Element {
                    member: member.to_vec(),
                    score,
                });
                true
            });
        out
    }

    /// Removes and returns up to `count` lowest-scoring elements.
    pub fn pop_min(&mut self, count: usize) -> Vec<Element> {
        let removed = self
            .list
            .delete_range_by_score(&ScoreBorder::NegInf, &ScoreBorder::PosInf, Some(count));
        for element in &removed {
            let _ = self.scores.remove(&element.member);
        }
        removed
    }

    /// Removes and returns up to `count` highest-scoring elements,
    /// highest first.
    pub fn pop_max(&mut self, count: usize) -> Vec<Element> {
        let len = self.list.len();
        let take = count.min(len);
        if take == 0 {
            return Vec::new();
        }
        let mut removed = self.list.delete_range_by_rank(len - take + 1, len);
        for element in &removed {
            let _ = self.scores.remove(&element.member);
        }
        removed.reverse();
        removed
    }

    /// Removes every element admitted by `[min, max]`; returns the count.
    pub fn remove_range_by_score(&mut self, min: &ScoreBorder, max: &ScoreBorder) -> usize {
        let removed = self.list.delete_range_by_score(min, max, None);
        for element in &removed {
            let _ = self.scores.remove(&element.member);
        }
        removed.len()
    }

    /// Removes elements with 0-based rank in `[start, stop)`; returns the
    /// count.
    pub fn remove_range_by_rank(&mut self, start: usize, stop: usize) -> usize {
        if start >= stop {
            return 0;
        }
        let removed = self.list.delete_range_by_rank(start + 1, stop);
        for element in &removed {
            let _ = self.scores.remove(&element.member);
        }
        removed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::SortedSet;
    use crate::border::ScoreBorder;
    use googletest::prelude::*;
    use rstest::rstest;

    fn members(elements: &[super::Element]) -> Vec<String> {
        elements
            .iter()
            .map(|element| String::from_utf8_lossy(&element.member).into_owned())
            .collect()
    }

    fn build(pairs: &[(&str, f64)]) -> SortedSet {
        let mut set = SortedSet::new();
        for (member, score) in pairs {
            let _ = set.add(member.as_bytes().to_vec(), *score);
        }
        set
    }

    #[rstest]
    fn ties_break_by_member_lex_order() {
        let set = build(&[("b", 1.0), ("a", 1.0), ("c", 2.0)]);
        let range = set.range_by_rank(0, 3, false);
        assert_that!(members(&range), eq(&vec!["a".to_owned(), "b".to_owned(), "c".to_owned()]));
    }

    #[rstest]
    fn add_rescore_keeps_maps_in_lock_step() {
        let mut set = build(&[("a", 1.0), ("b", 2.0)]);
        assert_that!(set.add(b"a".to_vec(), 5.0), eq(false));
        assert_that!(set.len(), eq(2_usize));
        assert_that!(set.score(b"a"), some(eq(5.0_f64)));
        assert_that!(set.rank(b"a", false), some(eq(1_usize)));
        assert_that!(set.add(b"a".to_vec(), 5.0), eq(false));
        assert_that!(set.len(), eq(2_usize));
    }

    #[rstest]
    fn rank_supports_both_directions() {
        let set = build(&[("a", 1.0), ("b", 2.0), ("c", 3.0)]);
        assert_that!(set.rank(b"a", false), some(eq(0_usize)));
        assert_that!(set.rank(b"a", true), some(eq(2_usize)));
        assert_that!(set.rank(b"missing", false), none());
    }

    #[rstest]
    fn range_by_score_respects_offset_limit_desc() {
        let set = build(&[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)]);
        let range = set.range_by_score(
            &ScoreBorder::NegInf,
            &ScoreBorder::PosInf,
            1,
            Some(2),
            true,
        );
        assert_that!(members(&range), eq(&vec!["c".to_owned(), "b".to_owned()]));
    }

    #[rstest]
    fn pop_min_and_max_remove_extremes() {
        let mut set = build(&[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)]);
        let low = set.pop_min(2);
        assert_that!(members(&low), eq(&vec!["a".to_owned(), "b".to_owned()]));
        let high = set.pop_max(5);
        assert_that!(members(&high), eq(&vec!["d".to_owned(), "c".to_owned()]));
        assert_that!(set.is_empty(), eq(true));
        assert_that!(set.score(b"a"), none());
    }

    #[rstest]
    fn remove_ranges_clean_the_member_map() {
        let mut set = build(&[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)]);
        let min = ScoreBorder::inclusive(2.0);
        let max = ScoreBorder::inclusive(3.0);
        assert_that!(set.remove_range_by_score(&min, &max), eq(2_usize));
        assert_that!(set.score(b"b"), none());
        assert_that!(set.remove_range_by_rank(0, 1), eq(1_usize));
        assert_that!(set.score(b"a"), none());
        assert_that!(set.len(), eq(1_usize));
    }

    #[rstest]
    fn infinite_scores_are_stored_and_ordered() {
        let set = build(&[("low", f64::NEG_INFINITY), ("mid", 0.0), ("high", f64::INFINITY)]);
        let range = set.range_by_rank(0, 3, false);
        assert_that!(
            members(&range),
            eq(&vec!["low".to_owned(), "mid".to_owned(), "high".to_owned()])
        );
    }
}
