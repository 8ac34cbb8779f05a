//! Range endpoints for sorted-set score queries.
//!
//! A border is one end of a `ZRANGEBYSCORE`-style range: a float with an
//! inclusive/exclusive flag, or one of the symbolic infinities. `(2.5`
//! parses as exclusive 2.5; `inf`, `+inf`, `-inf` are admissible both as
//! borders and as stored scores. NaN is rejected at parse time.

/// One end of a score range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBorder {
    /// `-inf`: below every score.
    NegInf,
    /// `+inf`: above every score.
    PosInf,
    /// A concrete score with open/closed flag.
    Value {
        /// Border score.
        score: f64,
        /// `true` for `(`-prefixed exclusive borders.
        exclusive: bool,
    },
}

impl ScoreBorder {
    /// Inclusive border at `score`.
    #[must_use]
    pub fn inclusive(score: f64) -> Self {
        Self::Value {
            score,
            exclusive: false,
        }
    }

    /// Parses a border argument (`5`, `(5`, `2.718`, `inf`, `+inf`, `-inf`).
    ///
    /// # Errors
    ///
    /// Returns `Err(())` when the token is not a float or parses to NaN;
    /// callers map this onto the protocol's min-or-max error reply.
    pub fn parse(raw: &[u8]) -> Result<Self, ()> {
        match raw {
            b"inf" | b"+inf" => return Ok(Self::PosInf),
            b"-inf" => return Ok(Self::NegInf),
            _ => {}
        }
        let (digits, exclusive) = match raw.first() {
            Some(b'(') => (&raw[1..], true),
            _ => (raw, false),
        };
        let score: f64 = std::str::from_utf8(digits)
            .map_err(|_| ())?
            .parse()
            .map_err(|_| ())?;
        if score.is_nan() {
            return Err(());
        }
        Ok(Self::Value { score, exclusive })
    }

    /// Returns whether this border, used as a minimum, admits `score`.
    #[must_use]
    pub fn admits_from_below(&self, score: f64) -> bool {
        match self {
            Self::NegInf => true,
            Self::PosInf => false,
            Self::Value {
                score: border,
                exclusive,
            } => {
                if *exclusive {
                    *border < score
                } else {
                    *border <= score
                }
            }
        }
    }

    /// Returns whether this border, used as a maximum, admits `score`.
    #[must_use]
    pub fn admits_from_above(&self, score: f64) -> bool {
        match self {
            Self::NegInf => false,
            Self::PosInf => true,
            Self::Value {
                score: border,
                exclusive,
            } => {
                if *exclusive {
                    *border > score
                } else {
                    *border >= score
                }
            }
        }
    }

    /// Returns whether `[min=self, max]` is provably empty.
    #[must_use]
    pub fn disjoint_with(&self, max: &Self) -> bool {
        match (self, max) {
            (Self::PosInf, _) | (_, Self::NegInf) => true,
            (Self::NegInf, _) | (_, Self::PosInf) => false,
            (
                Self::Value {
                    score: low,
                    exclusive: low_open,
                },
                Self::Value {
                    score: high,
                    exclusive: high_open,
                },
            ) => low > high || (low == high && (*low_open || *high_open)),
        }
    }
}
