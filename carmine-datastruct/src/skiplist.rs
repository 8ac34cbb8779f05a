//! Probabilistic skiplist ordered by `(score, member)`.
//!
//! Nodes live in an index-addressed arena (slot 0 is the header), with
//! forward pointer + span per level and a backward pointer on level 0.
//! Maximum 32 levels, promotion probability 1/4. Spans make rank queries
//! O(log n). Equal scores are ordered by member bytes, so iteration order
//! is total.

use rand::Rng;

use crate::border::ScoreBorder;

pub(crate) const MAX_LEVEL: usize = 32;

/// One stored `(member, score)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    /// Member bytes; unique within one list.
    pub member: Vec<u8>,
    /// IEEE-754 score; never NaN.
    pub score: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Level {
    forward: Option<usize>,
    span: usize,
}

#[derive(Debug)]
struct Node {
    member: Vec<u8>,
    score: f64,
    backward: Option<usize>,
    levels: Vec<Level>,
}

/// Skiplist over `(member, score)` with per-level spans.
#[derive(Debug)]
pub struct SkipList {
    /// Arena of nodes; slot 0 is the always-present header.
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    tail: Option<usize>,
    length: usize,
    level: usize,
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

impl SkipList {
    const HEAD: usize = 0;

    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![Some(Node {
                member: Vec::new(),
                score: 0.0,
                backward: None,
                levels: vec![Level::default(); MAX_LEVEL],
            })],
            free: Vec::new(),
            tail: None,
            length: 0,
            level: 1,
        }
    }

    /// Returns the number of stored elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.length
    }

    /// Returns whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    fn node(&self, id: usize) -> &Node {
        self.nodes[id].as_ref().expect("live node id")
    }

    fn node_mut(&mut self, id: usize) -> &mut Node {
        self.nodes[id].as_mut().expect("live node id")
    }

    fn forward(&self, id: usize, level: usize) -> Option<usize> {
        self.node(id).levels[level].forward
    }

    fn span(&self, id: usize, level: usize) -> usize {
        self.node(id).levels[level].span
    }

    /// `(score, member)` strict ordering used for placement.
    fn precedes(&self, id: usize, member: &[u8], score: f64) -> bool {
        let node = self.node(id);
        node.score < score || (node.score == score && node.member.as_slice() < member)
    }

    fn alloc(&mut self, member: Vec<u8>, score: f64, levels: usize) -> usize {
        let node = Node {
            member,
            score,
            backward: None,
            levels: vec![Level::default(); levels],
        };
        if let Some(slot) = self.free.pop() {
            self.nodes[slot] = Some(node);
            slot
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn random_level() -> usize {
        let mut rng = rand::thread_rng();
        let mut level = 1;
        while level < MAX_LEVEL && rng.gen_range(0_u32..4) == 0 {
            level += 1;
        }
        level
    }

    /// Inserts a new `(member, score)` pair.
    ///
    /// The caller guarantees the member is not already present; re-scoring
    /// an existing member goes through delete + insert.
    pub fn insert(&mut self, member: Vec<u8>, score: f64) {
        let mut update = [Self::HEAD; MAX_LEVEL];
        let mut rank = [0_usize; MAX_LEVEL];

        let mut current = Self::HEAD;
        for level in (0..self.level).rev() {
            rank[level] = if level == self.level - 1 {
                0
            } else {
                rank[level + 1]
            };
            while let Some(next) = self.forward(current, level) {
                if self.precedes(next, &member, score) {
                    rank[level] += self.span(current, level);
                    current = next;
                } else {
                    break;
                }
            }
            update[level] = current;
        }

        let new_level = Self::random_level();
        if new_level > self.level {
            for level in self.level..new_level {
                rank[level] = 0;
                update[level] = Self::HEAD;
                self.node_mut(Self::HEAD).levels[level].span = self.length;
            }
            self.level = new_level;
        }

        let id = self.alloc(member, score, new_level);
        for level in 0..new_level {
            let predecessor = update[level];
            let next = self.forward(predecessor, level);
            let predecessor_span = self.span(predecessor, level);

            self.node_mut(id).levels[level].forward = next;
            self.node_mut(predecessor).levels[level].forward = Some(id);
            self.node_mut(id).levels[level].span = predecessor_span - (rank[0] - rank[level]);
            self.node_mut(predecessor).levels[level].span = rank[0] - rank[level] + 1;
        }
        for level in new_level..self.level {
            self.node_mut(update[level]).levels[level].span += 1;
        }

        self.node_mut(id).backward = (update[0] != Self::HEAD).then_some(update[0]);
        match self.forward(id, 0) {
            Some(next) => self.node_mut(next).backward = Some(id),
            None => self.tail = Some(id),
        }
        self.length += 1;
    }

    /// Removes the pair if present. Returns whether a node was removed.
    pub fn delete(&mut self, member: &[u8], score: f64) -> bool {
        let mut update = [Self::HEAD; MAX_LEVEL];
        let mut current = Self::HEAD;
        for level in (0..self.level).rev() {
            while let Some(next) = self.forward(current, level) {
                if self.precedes(next, member, score) {
                    current = next;
                } else {
                    break;
                }
            }
            update[level] = current;
        }

        let Some(target) = self.forward(current, 0) else {
            return false;
        };
        let node = self.node(target);
        if node.score != score || node.member != member {
            return false;
        }
        self.delete_node(target, &update);
        true
    }

    fn delete_node(&mut self, target: usize, update: &[usize; MAX_LEVEL]) {
        for level in 0..self.level {
            let predecessor = update[level];
            if self.forward(predecessor, level) == Some(target) {
                let removed_span = self.span(target, level);
                let removed_forward = self.forward(target, level);
                let slot = &mut self.node_mut(predecessor).levels[level];
                slot.span += removed_span - 1;
                slot.forward = removed_forward;
            } else {
                self.node_mut(predecessor).levels[level].span -= 1;
            }
        }

        let backward = self.node(target).backward;
        match self.forward(target, 0) {
            Some(next) => self.node_mut(next).backward = backward,
            None => self.tail = backward,
        }

        while self.level > 1 && self.forward(Self::HEAD, self.level - 1).is_none() {
            self.level -= 1;
        }
        self.nodes[target] = None;
        self.free.push(target);
        self.length -= 1;
    }

    /// 1-based rank of a pair; 0 when absent.
    #[must_use]
    pub fn rank(&self, member: &[u8], score: f64) -> usize {
        let mut rank = 0;
        let mut current = Self::HEAD;
        for level in (0..self.level).rev() {
            while let Some(next) = self.forward(current, level) {
                let node = self.node(next);
                let advance = node.score < score
                    || (node.score == score && node.member.as_slice() <= member);
                if advance {
                    rank += self.span(current, level);
                    current = next;
                } else {
                    break;
                }
            }
            if current != Self::HEAD && self.node(current).member == member {
                return rank;
            }
        }
        0
    }

    /// Node id at 1-based `rank`.
    fn id_by_rank(&self, rank: usize) -> Option<usize> {
        if rank == 0 || rank > self.length {
            return None;
        }
        let mut traversed = 0;
        let mut current = Self::HEAD;
        for level in (0..self.level).rev() {
            while let Some(next) = self.forward(current, level) {
                if traversed + self.span(current, level) <= rank {
                    traversed += self.span(current, level);
                    current = next;
                } else {
                    break;
                }
            }
            if traversed == rank && current != Self::HEAD {
                return Some(current);
            }
        }
        None
    }

    /// Element at 1-based `rank`.
    #[must_use]
    pub fn element_by_rank(&self, rank: usize) -> Option<Element> {
        self.id_by_rank(rank).map(|id| self.element(id))
    }

    fn element(&self, id: usize) -> Element {
        let node = self.node(id);
        Element {
            member: node.member.clone(),
            score: node.score,
        }
    }

    fn first_id(&self) -> Option<usize> {
        self.forward(Self::HEAD, 0)
    }

    /// First node whose score the borders admit.
    fn first_in_range_id(&self, min: &ScoreBorder, max: &ScoreBorder) -> Option<usize> {
        if min.disjoint_with(max) || self.is_empty() {
            return None;
        }
        let mut current = Self::HEAD;
        for level in (0..self.level).rev() {
            while let Some(next) = self.forward(current, level) {
                if min.admits_from_below(self.node(next).score) {
                    break;
                }
                current = next;
            }
        }
        let candidate = self.forward(current, 0)?;
        max.admits_from_above(self.node(candidate).score)
            .then_some(candidate)
    }

    /// Last node whose score the borders admit.
    fn last_in_range_id(&self, min: &ScoreBorder, max: &ScoreBorder) -> Option<usize> {
        if min.disjoint_with(max) || self.is_empty() {
            return None;
        }
        let mut current = Self::HEAD;
        for level in (0..self.level).rev() {
            while let Some(next) = self.forward(current, level) {
                if max.admits_from_above(self.node(next).score) {
                    current = next;
                } else {
                    break;
                }
            }
        }
        (current != Self::HEAD && min.admits_from_below(self.node(current).score))
            .then_some(current)
    }

    /// Walks elements admitted by `[min, max]`, ascending unless `desc`,
    /// skipping `offset` and yielding at most `limit` (`None` = no limit).
    pub fn for_each_in_range(
        &self,
        min: &ScoreBorder,
        max: &ScoreBorder,
        offset: usize,
        limit: Option<usize>,
        desc: bool,
        mut visitor: impl FnMut(&[u8], f64) -> bool,
    ) {
        let mut cursor = if desc {
            self.last_in_range_id(min, max)
        } else {
            self.first_in_range_id(min, max)
        };
        let mut remaining_offset = offset;
        while remaining_offset > 0 {
            let Some(id) = cursor else {
                return;
            };
            cursor = self.step(id, desc);
            remaining_offset -= 1;
        }

        let mut yielded = 0;
        while let Some(id) = cursor {
            if let Some(limit) = limit
                && yielded >= limit
            {
                return;
            }
            let node = self.node(id);
            if !min.admits_from_below(node.score) || !max.admits_from_above(node.score) {
                return;
            }
            if !visitor(&node.member, node.score) {
                return;
            }
            yielded += 1;
            cursor = self.step(id, desc);
        }
    }

    fn step(&self, id: usize, desc: bool) -> Option<usize> {
        if desc {
            self.node(id).backward
        } else {
            self.forward(id, 0)
        }
    }

    /// Counts elements admitted by `[min, max]`.
    #[must_use]
    pub fn count_in_range(&self, min: &ScoreBorder, max: &ScoreBorder) -> usize {
        let mut count = 0;
        self.for_each_in_range(min, max, 0, None, false, |_, _| {
            count += 1;
            true
        });
        count
    }

    /// Removes up to `limit` elements admitted by `[min, max]` (`None` =
    /// all) and returns them in ascending order.
    pub fn delete_range_by_score(
        &mut self,
        min: &ScoreBorder,
        max: &ScoreBorder,
        limit: Option<usize>,
    ) -> Vec<Element> {
        let mut doomed = Vec::new();
        self.for_each_in_range(min, max, 0, limit, false, |member, score| {
            doomed.push(Element {
                member: member.to_vec(),
                score,
            });
            true
        });
        for element in &doomed {
            let _ = self.delete(&element.member, element.score);
        }
        doomed
    }

    /// Removes elements with 1-based rank in `[start, stop]` and returns
    /// them in ascending order.
    pub fn delete_range_by_rank(&mut self, start: usize, stop: usize) -> Vec<Element> {
        let mut doomed = Vec::new();
        let mut cursor = self.id_by_rank(start);
        let mut rank = start;
        while let Some(id) = cursor {
            if rank > stop {
                break;
            }
            doomed.push(self.element(id));
            cursor = self.forward(id, 0);
            rank += 1;
        }
        for element in &doomed {
            let _ = self.delete(&element.member, element.score);
        }
        doomed
    }

    /// Walks elements in rank order, ascending unless `desc`, starting at
    /// 0-based `start` for `count` elements.
    pub fn for_each_by_rank(
        &self,
        start: usize,
        count: usize,
        desc: bool,
        mut visitor: impl FnMut(&[u8], f64) -> bool,
    ) {
        let mut cursor = if desc {
            self.id_by_rank(self.length.saturating_sub(start))
        } else {
            self.id_by_rank(start + 1)
        };
        let mut yielded = 0;
        while let Some(id) = cursor {
            if yielded >= count {
                return;
            }
            let node = self.node(id);
            if !visitor(&node.member, node.score) {
                return;
            }
            yielded += 1;
            cursor = self.step(id, desc);
        }
    }

    /// Returns the minimum element without removing it.
    #[must_use]
    pub fn peek_min(&self) -> Option<Element> {
        self.first_id().map(|id| self.element(id))
    }
}

#[cfg(test)]
mod tests {
    use super::{Element, SkipList};
    use crate::border::ScoreBorder;
    use googletest::prelude::*;
    use rstest::rstest;

    fn build(pairs: &[(&str, f64)]) -> SkipList {
        let mut list = SkipList::new();
        for (member, score) in pairs {
            list.insert(member.as_bytes().to_vec(), *score);
        }
        list
    }

    fn members_in_order(list: &SkipList) -> Vec<String> {
        let mut out = Vec::new();
        list.for_each_by_rank(0, list.len(), false, |member, _| {
            out.push(String::from_utf8_lossy(member).into_owned());
            true
        });
        out
    }

    #[rstest]
    fn orders_by_score_then_member() {
        let list = build(&[("b", 1.0), ("a", 1.0), ("c", 2.0), ("d", 0.5)]);
        assert_that!(
            members_in_order(&list),
            eq(&vec![
                "d".to_owned(),
                "a".to_owned(),
                "b".to_owned(),
                "c".to_owned()
            ])
        );
    }

    #[rstest]
    fn spans_give_correct_ranks() {
        let list = build(&[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)]);
        assert_that!(list.rank(b"a", 1.0), eq(1_usize));
        assert_that!(list.rank(b"c", 3.0), eq(3_usize));
        assert_that!(list.rank(b"zz", 9.0), eq(0_usize));
        assert_that!(
            list.element_by_rank(2),
            some(eq(&Element {
                member: b"b".to_vec(),
                score: 2.0
            }))
        );
        assert_that!(list.element_by_rank(5), none());
    }

    #[rstest]
    fn delete_rewires_and_shrinks() {
        let mut list = build(&[("a", 1.0), ("b", 2.0), ("c", 3.0)]);
        assert_that!(list.delete(b"b", 2.0), eq(true));
        assert_that!(list.delete(b"b", 2.0), eq(false));
        assert_that!(list.delete(b"a", 9.0), eq(false));
        assert_that!(list.len(), eq(2_usize));
        assert_that!(list.rank(b"c", 3.0), eq(2_usize));
        assert_that!(members_in_order(&list), eq(&vec!["a".to_owned(), "c".to_owned()]));
    }

    #[rstest]
    fn ranks_stay_consistent_across_many_inserts_and_deletes() {
        let mut list = SkipList::new();
        for i in 0..200_i64 {
            list.insert(format!("m{i:03}").into_bytes(), i as f64);
        }
        for i in (0..200_i64).step_by(2) {
            assert_that!(list.delete(format!("m{i:03}").as_bytes(), i as f64), eq(true));
        }
        assert_that!(list.len(), eq(100_usize));
        for (position, i) in (1..200_i64).step_by(2).enumerate() {
            assert_that!(
                list.rank(format!("m{i:03}").as_bytes(), i as f64),
                eq(position + 1)
            );
        }
    }

    #[rstest]
    fn score_range_with_borders() {
        let list = build(&[("a", 1.0), ("b", 2.0), ("c", 2.0), ("d", 3.0)]);
        let min = ScoreBorder::parse(b"(1").expect("valid");
        let max = ScoreBorder::parse(b"3").expect("valid");
        let mut seen = Vec::new();
        list.for_each_in_range(&min, &max, 0, None, false, |member, _| {
            seen.push(member.to_vec());
            true
        });
        assert_that!(seen, eq(&vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]));
        assert_that!(list.count_in_range(&min, &max), eq(3_usize));
    }

    #[rstest]
    fn descending_range_with_offset_and_limit() {
        let list = build(&[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)]);
        let mut seen = Vec::new();
        list.for_each_in_range(
            &ScoreBorder::NegInf,
            &ScoreBorder::PosInf,
            1,
            Some(2),
            true,
            |member, _| {
                seen.push(member.to_vec());
                true
            },
        );
        assert_that!(seen, eq(&vec![b"c".to_vec(), b"b".to_vec()]));
    }

    #[rstest]
    fn delete_range_by_score_returns_removed() {
        let mut list = build(&[("a", 1.0), ("b", 2.0), ("c", 3.0)]);
        let removed = list.delete_range_by_score(
            &ScoreBorder::inclusive(2.0),
            &ScoreBorder::PosInf,
            None,
        );
        assert_that!(removed.len(), eq(2_usize));
        assert_that!(list.len(), eq(1_usize));
        assert_that!(members_in_order(&list), eq(&vec!["a".to_owned()]));
    }

    #[rstest]
    fn delete_range_by_rank_is_inclusive() {
        let mut list = build(&[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)]);
        let removed = list.delete_range_by_rank(2, 3);
        assert_that!(removed.len(), eq(2_usize));
        assert_that!(members_in_order(&list), eq(&vec!["a".to_owned(), "d".to_owned()]));
    }
}
