//! Segmented list of byte-strings.
//!
//! Values live in fixed-capacity pages chained in a deque, so pushes at
//! either end are O(1) and index addressing only walks page headers. A
//! full page splits in half on interior insert; emptied pages are dropped.

use std::collections::VecDeque;

/// Byte-string list backed by fixed-capacity pages.
#[derive(Debug)]
pub struct QuickList {
    pages: VecDeque<Vec<Vec<u8>>>,
    len: usize,
    page_cap: usize,
}

impl QuickList {
    /// Creates an empty list whose pages hold `page_cap` values.
    #[must_use]
    pub fn new(page_cap: usize) -> Self {
        Self {
            pages: VecDeque::new(),
            len: 0,
            page_cap: page_cap.max(1),
        }
    }

    /// Returns the value count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Locates the page holding `index` and the offset inside it.
    fn locate(&self, index: usize) -> (usize, usize) {
        debug_assert!(index < self.len);
        let mut start = 0;
        for (page_index, page) in self.pages.iter().enumerate() {
            if start + page.len() > index {
                return (page_index, index - start);
            }
            start += page.len();
        }
        unreachable!("index {index} is inside the list length {}", self.len)
    }

    /// Appends at the tail.
    pub fn push_back(&mut self, value: Vec<u8>) {
        self.len += 1;
        if let Some(page) = self.pages.back_mut()
            && page.len() < self.page_cap
        {
            page.push(value);
            return;
        }
        let mut page = Vec::with_capacity(self.page_cap);
        page.push(value);
        self.pages.push_back(page);
    }

    /// Prepends at the head.
    pub fn push_front(&mut self, value: Vec<u8>) {
        self.len += 1;
        if let Some(page) = self.pages.front_mut()
            && page.len() < self.page_cap
        {
            page.insert(0, value);
            return;
        }
        let mut page = Vec::with_capacity(self.page_cap);
        page.push(value);
        self.pages.push_front(page);
    }

    /// Removes and returns the head value.
    pub fn pop_front(&mut self) -> Option<Vec<u8>> {
        let page = self.pages.front_mut()?;
        let value = page.remove(0);
        if page.is_empty() {
            let _ = self.pages.pop_front();
        }
        self.len -= 1;
        Some(value)
    }

    /// Removes and returns the tail value.
    pub fn pop_back(&mut self) -> Option<Vec<u8>> {
        let page = self.pages.back_mut()?;
        let value = page.pop()?;
        if page.is_empty() {
            let _ = self.pages.pop_back();
        }
        self.len -= 1;
        Some(value)
    }

    /// Returns the value at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Vec<u8>> {
        if index >= self.len {
            return None;
        }
        let (page, offset) = self.locate(index);
        self.pages[page].get(offset)
    }

    /// Overwrites the value at `index`. Returns whether it existed.
    pub fn set(&mut self, index: usize, value: Vec<u8>) -> bool {
        if index >= self.len {
            return false;
        }
        let (page, offset) = self.locate(index);
        self.pages[page][offset] = value;
        true
    }

    /// Inserts before `index`; `index == len` appends.
    pub fn insert(&mut self, index: usize, value: Vec<u8>) {
        if index >= self.len {
            self.push_back(value);
            return;
        }
        let (page_index, offset) = self.locate(index);
        let page = &mut self.pages[page_index];
        if page.len() < self.page_cap {
            page.insert(offset, value);
            self.len += 1;
            return;
        }
        // Split the full page in half, then insert into the proper half.
        let tail_half = page.split_off(self.page_cap / 2);
        self.pages.insert(page_index + 1, tail_half);
        self.len += 1;
        let head_len = self.pages[page_index].len();
        if offset <= head_len {
            self.pages[page_index].insert(offset, value);
        } else {
            self.pages[page_index + 1].insert(offset - head_len, value);
        }
    }

    /// Removes and returns the value at `index`.
    pub fn remove(&mut self, index: usize) -> Option<Vec<u8>> {
        if index >= self.len {
            return None;
        }
        let (page_index, offset) = self.locate(index);
        let page = &mut self.pages[page_index];
        let value = page.remove(offset);
        if page.is_empty() {
            let _ = self.pages.remove(page_index);
        }
        self.len -= 1;
        Some(value)
    }

    /// Removes occurrences of `value` in `LREM` style: `count > 0` removes
    /// up to `count` from the head, `count < 0` up to `-count` from the
    /// tail, `count == 0` removes all. Returns the removed count.
    pub fn remove_occurrences(&mut self, value: &[u8], count: i64) -> usize {
        let limit = match count {
            0 => usize::MAX,
            _ => usize::try_from(count.unsigned_abs()).unwrap_or(usize::MAX),
        };
        let from_tail = count < 0;
        let mut removed = 0;
        let mut index = if from_tail { self.len } else { 0 };
        while removed < limit {
            if from_tail {
                if index == 0 {
                    break;
                }
                index -= 1;
            } else if index >= self.len {
                break;
            }
            if self.get(index).is_some_and(|stored| stored == value) {
                let _ = self.remove(index);
                removed += 1;
            } else if !from_tail {
                index += 1;
            }
        }
        removed
    }

    /// Visits values with index in `[start, stop)`.
    pub fn for_each_in_range(
        &self,
        start: usize,
        stop: usize,
        mut visitor: impl FnMut(&[u8]) -> bool,
    ) {
        let stop = stop.min(self.len);
        for index in start..stop {
            let (page, offset) = self.locate(index);
            if !visitor(&self.pages[page][offset]) {
                return;
            }
        }
    }

    /// Clones values with index in `[start, stop)`.
    #[must_use]
    pub fn range(&self, start: usize, stop: usize) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        self.for_each_in_range(start, stop, |value| {
            out.push(value.to_vec());
            true
        });
        out
    }
}
