//! Packed sorted integer set.
//!
//! Members are kept sorted in the narrowest signed encoding that fits
//! every stored value (16, 32, or 64 bits). Adding a value that does not
//! fit the current encoding upgrades the whole set in a single step;
//! there is no downgrade on removal.

/// Sorted set of signed integers with width-adaptive storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntSet {
    /// All members fit in `i16`.
    I16(Vec<i16>),
    /// All members fit in `i32`.
    I32(Vec<i32>),
    /// Full 64-bit members.
    I64(Vec<i64>),
}

impl Default for IntSet {
    fn default() -> Self {
        Self::I16(Vec::new())
    }
}

fn required_width(value: i64) -> u8 {
    if i16::try_from(value).is_ok() {
        16
    } else if i32::try_from(value).is_ok() {
        32
    } else {
        64
    }
}

impl IntSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the storage width in bits.
    #[must_use]
    pub fn encoding_width(&self) -> u8 {
        match self {
            Self::I16(_) => 16,
            Self::I32(_) => 32,
            Self::I64(_) => 64,
        }
    }

    /// Returns the member count.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::I16(values) => values.len(),
            Self::I32(values) => values.len(),
            Self::I64(values) => values.len(),
        }
    }

    /// Returns whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn upgrade_to(&mut self, width: u8) {
        if width <= self.encoding_width() {
            return;
        }
        let values: Vec<i64> = self.iter().collect();
        *self = match width {
            32 => Self::I32(values.into_iter().map(|value| value as i32).collect()),
            _ => Self::I64(values),
        };
    }

    /// Adds a member. Returns whether it was newly inserted.
    pub fn add(&mut self, value: i64) -> bool {
        self.upgrade_to(required_width(value));
        match self {
            Self::I16(values) => insert_sorted(values, value as i16),
            Self::I32(values) => insert_sorted(values, value as i32),
            Self::I64(values) => insert_sorted(values, value),
        }
    }

    /// Removes a member. Returns whether it was present.
    pub fn remove(&mut self, value: i64) -> bool {
        match self {
            Self::I16(values) => remove_sorted(values, value),
            Self::I32(values) => remove_sorted(values, value),
            Self::I64(values) => remove_sorted(values, value),
        }
    }

    /// Membership test.
    #[must_use]
    pub fn contains(&self, value: i64) -> bool {
        match self {
            Self::I16(values) => lookup(values, value).is_ok(),
            Self::I32(values) => lookup(values, value).is_ok(),
            Self::I64(values) => lookup(values, value).is_ok(),
        }
    }

    /// Iterates members in ascending order.
    pub fn iter(&self) -> Box<dyn Iterator<Item = i64> + '_> {
        match self {
            Self::I16(values) => Box::new(values.iter().map(|value| i64::from(*value))),
            Self::I32(values) => Box::new(values.iter().map(|value| i64::from(*value))),
            Self::I64(values) => Box::new(values.iter().copied()),
        }
    }
}

fn lookup<T: Copy + Into<i64>>(values: &[T], needle: i64) -> Result<usize, usize> {
    values.binary_search_by(|probe| (*probe).into().cmp(&needle))
}

fn insert_sorted<T: Copy + Into<i64>>(values: &mut Vec<T>, value: T) -> bool {
    match lookup(values, value.into()) {
        Ok(_) => false,
        Err(position) => {
            values.insert(position, value);
            true
        }
    }
}

fn remove_sorted<T: Copy + Into<i64>>(values: &mut Vec<T>, value: i64) -> bool {
    match lookup(values, value) {
        Ok(position) => {
            let _ = values.remove(position);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::IntSet;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn stays_sorted_and_deduplicated() {
        let mut set = IntSet::new();
        for value in [5_i64, -3, 9, 5, 0] {
            let _ = set.add(value);
        }
        assert_that!(set.len(), eq(4_usize));
        assert_that!(set.iter().collect::<Vec<_>>(), eq(&vec![-3_i64, 0, 5, 9]));
    }

    #[rstest]
    #[case(100, 16)]
    #[case(40_000, 32)]
    #[case(3_000_000_000, 64)]
    #[case(-3_000_000_000, 64)]
    fn picks_narrowest_encoding(#[case] value: i64, #[case] width: u8) {
        let mut set = IntSet::new();
        let _ = set.add(value);
        assert_that!(set.encoding_width(), eq(width));
    }

    #[rstest]
    fn upgrade_preserves_existing_members() {
        let mut set = IntSet::new();
        let _ = set.add(7);
        let _ = set.add(-2);
        let _ = set.add(i64::from(i32::MAX) + 1);
        assert_that!(set.encoding_width(), eq(64_u8));
        assert_that!(set.contains(7), eq(true));
        assert_that!(set.contains(-2), eq(true));
        assert_that!(set.contains(i64::from(i32::MAX) + 1), eq(true));
    }

    #[rstest]
    fn remove_keeps_encoding() {
        let mut set = IntSet::new();
        let _ = set.add(1_000_000);
        let _ = set.add(3);
        assert_that!(set.remove(1_000_000), eq(true));
        assert_that!(set.remove(1_000_000), eq(false));
        assert_that!(set.encoding_width(), eq(32_u8));
        assert_that!(set.len(), eq(1_usize));
    }
}
