//! Tagged keyspace value.
//!
//! Every key stores one [`Entity`] variant. Strings keep an
//! integer-encoded subvariant so counters avoid re-parsing; sets switch
//! between the packed integer representation and a hashed set, and the
//! upgrade is a single step performed under the key's write lock.

use hashbrown::{HashMap, HashSet};

use carmine_datastruct::{IntSet, QuickList, SortedSet};

/// String value with integer fast path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrValue {
    /// Arbitrary bytes.
    Raw(Vec<u8>),
    /// A value that is exactly the canonical decimal form of an `i64`.
    Int(i64),
}

impl StrValue {
    /// Wraps raw bytes, tagging canonical integers.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        if let Ok(text) = std::str::from_utf8(&bytes)
            && let Ok(value) = text.parse::<i64>()
            && value.to_string().as_bytes() == bytes.as_slice()
        {
            return Self::Int(value);
        }
        Self::Raw(bytes)
    }

    /// Returns the stored bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Raw(bytes) => bytes.clone(),
            Self::Int(value) => value.to_string().into_bytes(),
        }
    }

    /// Byte length of the stored value.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Raw(bytes) => bytes.len(),
            Self::Int(value) => value.to_string().len(),
        }
    }

    /// Returns whether the value is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parses the value as `i64` when possible.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Raw(bytes) => std::str::from_utf8(bytes).ok()?.parse().ok(),
        }
    }

    /// Storage width classification of the integer subvariant.
    #[must_use]
    pub fn int_width(&self) -> Option<u8> {
        let value = match self {
            Self::Int(value) => *value,
            Self::Raw(_) => return None,
        };
        if i8::try_from(value).is_ok() {
            Some(8)
        } else if i16::try_from(value).is_ok() {
            Some(16)
        } else if i32::try_from(value).is_ok() {
            Some(32)
        } else {
            Some(64)
        }
    }
}

/// Set value with packed-integer and hashed representations.
#[derive(Debug, Clone)]
pub enum SetValue {
    /// Every member is a canonical `i64`; count stays under the cap.
    Ints(IntSet),
    /// Hashed byte-string members.
    Strs(HashSet<Vec<u8>>),
}

/// Returns `Some(i64)` when `member` is the canonical decimal form.
fn as_canonical_int(member: &[u8]) -> Option<i64> {
    let value: i64 = std::str::from_utf8(member).ok()?.parse().ok()?;
    (value.to_string().as_bytes() == member).then_some(value)
}

impl SetValue {
    /// Creates an empty set in the packed representation.
    #[must_use]
    pub fn new() -> Self {
        Self::Ints(IntSet::new())
    }

    /// Adds a member, upgrading to the hashed representation when the
    /// member is not an integer or the packed cap is exceeded.
    pub fn add(&mut self, member: &[u8], intset_cap: usize) -> bool {
        match self {
            Self::Ints(ints) => {
                if let Some(value) = as_canonical_int(member) {
                    if ints.contains(value) {
                        return false;
                    }
                    if ints.len() < intset_cap {
                        return ints.add(value);
                    }
                }
                self.upgrade_to_strs();
                self.add(member, intset_cap)
            }
            Self::Strs(members) => members.insert(member.to_vec()),
        }
    }

    fn upgrade_to_strs(&mut self) {
        if let Self::Ints(ints) = self {
            let members: HashSet<Vec<u8>> = ints
                .iter()
                .map(|value| value.to_string().into_bytes())
                .collect();
            *self = Self::Strs(members);
        }
    }

    /// Removes a member. Returns whether it was present.
    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self {
            Self::Ints(ints) => match as_canonical_int(member) {
                Some(value) => ints.remove(value),
                None => false,
            },
            Self::Strs(members) => members.remove(member),
        }
    }

    /// Membership test.
    #[must_use]
    pub fn contains(&self, member: &[u8]) -> bool {
        match self {
            Self::Ints(ints) => as_canonical_int(member).is_some_and(|value| ints.contains(value)),
            Self::Strs(members) => members.contains(member),
        }
    }

    /// Returns the member count.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Ints(ints) => ints.len(),
            Self::Strs(members) => members.len(),
        }
    }

    /// Returns whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clones every member into byte form.
    #[must_use]
    pub fn members(&self) -> Vec<Vec<u8>> {
        match self {
            Self::Ints(ints) => ints.iter().map(|value| value.to_string().into_bytes()).collect(),
            Self::Strs(members) => members.iter().cloned().collect(),
        }
    }

    /// Returns whether the packed representation is active.
    #[must_use]
    pub fn is_packed(&self) -> bool {
        matches!(self, Self::Ints(_))
    }
}

impl Default for SetValue {
    fn default() -> Self {
        Self::new()
    }
}

/// One keyspace value.
#[derive(Debug)]
pub enum Entity {
    /// Byte-string (integer-tagged subvariant).
    Str(StrValue),
    /// Segmented list of byte-strings.
    List(QuickList),
    /// Field -> value mapping.
    Hash(HashMap<Vec<u8>, Vec<u8>>),
    /// Unordered member set.
    Set(SetValue),
    /// Score-ordered member set.
    SortedSet(SortedSet),
}

impl Entity {
    /// Wire-visible type name, as reported by `TYPE`.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Hash(_) => "hash",
            Self::Set(_) => "set",
            Self::SortedSet(_) => "zset",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SetValue, StrValue};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(b"42".to_vec(), true)]
    #[case(b"-7".to_vec(), true)]
    #[case(b"007".to_vec(), false)]
    #[case(b"+7".to_vec(), false)]
    #[case(b"4.2".to_vec(), false)]
    #[case(b"abc".to_vec(), false)]
    fn integer_tagging_requires_canonical_form(#[case] bytes: Vec<u8>, #[case] tagged: bool) {
        let value = StrValue::from_bytes(bytes.clone());
        assert_that!(matches!(value, StrValue::Int(_)), eq(tagged));
        assert_that!(value.to_bytes(), eq(&bytes));
    }

    #[rstest]
    #[case(100, 8)]
    #[case(-129, 16)]
    #[case(40_000, 32)]
    #[case(3_000_000_000, 64)]
    fn int_width_classifies_storage(#[case] value: i64, #[case] width: u8) {
        let value = StrValue::from_bytes(value.to_string().into_bytes());
        assert_that!(value.int_width(), some(eq(width)));
    }

    #[rstest]
    fn set_starts_packed_and_upgrades_on_text_member() {
        let mut set = SetValue::new();
        assert_that!(set.add(b"10", 512), eq(true));
        assert_that!(set.add(b"10", 512), eq(false));
        assert_that!(set.is_packed(), eq(true));

        assert_that!(set.add(b"word", 512), eq(true));
        assert_that!(set.is_packed(), eq(false));
        assert_that!(set.contains(b"10"), eq(true));
        assert_that!(set.contains(b"word"), eq(true));
        assert_that!(set.len(), eq(2_usize));
    }

    #[rstest]
    fn set_upgrades_when_packed_cap_exceeded() {
        let mut set = SetValue::new();
        for value in 0..4_i64 {
            let _ = set.add(value.to_string().as_bytes(), 4);
        }
        assert_that!(set.is_packed(), eq(true));
        assert_that!(set.add(b"4", 4), eq(true));
        assert_that!(set.is_packed(), eq(false));
        assert_that!(set.len(), eq(5_usize));
    }

    #[rstest]
    fn non_canonical_numeric_member_hashes() {
        let mut set = SetValue::new();
        assert_that!(set.add(b"007", 512), eq(true));
        assert_that!(set.is_packed(), eq(false));
    }
}
