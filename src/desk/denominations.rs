//! Note counts keyed by face value.
use std::{collections::BTreeMap, fmt, str::FromStr};

use rust_decimal::Decimal;
use serde::Serialize;

use crate::desk::{Currency, FaceValue, LedgerError, NoteCount};

/// Note counts per face value.
///
/// A face value that is absent and a face value with a count of zero are the
/// same thing: zero counts are never stored, and [`Denominations::count`]
/// reports zero for anything missing. Use [`Denominations::dense`] to list
/// every legal face value of a currency explicitly.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Denominations(BTreeMap<FaceValue, NoteCount>);

/// A face value a withdrawal asks for more of than is available.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shortfall {
    pub face: FaceValue,
    pub available: NoteCount,
    pub required: NoteCount,
}

impl Shortfall {
    pub fn missing(&self) -> NoteCount {
        self.required - self.available
    }
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} notes: available={}, required={}, shortfall={}",
            self.face,
            self.available,
            self.required,
            self.missing()
        )
    }
}

impl Denominations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of notes of the given face value.
    pub fn count(&self, face: FaceValue) -> NoteCount {
        self.0.get(&face).copied().unwrap_or(0)
    }

    /// Overwrites the count of one face value.
    pub fn set(&mut self, face: FaceValue, count: NoteCount) {
        if count == 0 {
            self.0.remove(&face);
        } else {
            self.0.insert(face, count);
        }
    }

    /// True if no notes are held at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Non-zero counts in ascending face value order.
    pub fn iter(&self) -> impl Iterator<Item = (FaceValue, NoteCount)> + '_ {
        self.0.iter().map(|(face, count)| (*face, *count))
    }

    /// Face values with a non-zero count.
    pub fn faces(&self) -> impl Iterator<Item = FaceValue> + '_ {
        self.0.keys().copied()
    }

    /// Sum of face value times count.
    pub fn total(&self) -> Decimal {
        self.iter()
            .map(|(face, count)| Decimal::from(face) * Decimal::from(count))
            .sum()
    }

    /// Adds every count of `other`, or nothing at all if any count would overflow.
    pub fn add(&mut self, other: &Denominations) -> Result<(), LedgerError> {
        let sums = other
            .iter()
            .map(|(face, count)| Ok((face, checked_sum(face, self.count(face), count)?)))
            .collect::<Result<Vec<_>, LedgerError>>()?;
        for (face, count) in sums {
            self.set(face, count);
        }
        Ok(())
    }

    /// Collects counts, summing repeated face values.
    pub fn try_from_counts(
        counts: impl IntoIterator<Item = (FaceValue, NoteCount)>,
    ) -> Result<Self, LedgerError> {
        let mut denominations = Denominations::new();
        for (face, count) in counts {
            let merged = checked_sum(face, denominations.count(face), count)?;
            denominations.set(face, merged);
        }
        Ok(denominations)
    }

    /// Face values that `required` asks for more of than this map holds.
    pub fn shortfalls(&self, required: &Denominations) -> Vec<Shortfall> {
        required
            .iter()
            .filter_map(|(face, needed)| {
                let available = self.count(face);
                (available < needed).then_some(Shortfall {
                    face,
                    available,
                    required: needed,
                })
            })
            .collect()
    }

    /// Removes every count of `other`, or nothing at all if any face value falls short.
    pub fn checked_remove(&mut self, other: &Denominations) -> Result<(), Vec<Shortfall>> {
        let shortfalls = self.shortfalls(other);
        if !shortfalls.is_empty() {
            return Err(shortfalls);
        }
        for (face, count) in other.iter() {
            let remaining = self.count(face) - count;
            self.set(face, remaining);
        }
        Ok(())
    }

    /// Removes every count of `other`, clamping at zero.
    ///
    /// Returns the shortfalls that had to be clamped; empty when history is consistent.
    pub fn remove_clamped(&mut self, other: &Denominations) -> Vec<Shortfall> {
        let shortfalls = self.shortfalls(other);
        for (face, count) in other.iter() {
            let remaining = self.count(face).saturating_sub(count);
            self.set(face, remaining);
        }
        shortfalls
    }

    /// Every legal face value of `currency` with its count, zeros included.
    pub fn dense(&self, currency: Currency) -> BTreeMap<FaceValue, NoteCount> {
        currency
            .denominations()
            .iter()
            .map(|face| (*face, self.count(*face)))
            .collect()
    }
}

fn checked_sum(
    face: FaceValue,
    held: NoteCount,
    added: NoteCount,
) -> Result<NoteCount, LedgerError> {
    held.checked_add(added)
        .ok_or(LedgerError::CountOverflow { face })
}

impl<const N: usize> From<[(FaceValue, NoteCount); N]> for Denominations {
    /// Builds the map from literal counts. A repeated face value replaces the earlier count.
    fn from(counts: [(FaceValue, NoteCount); N]) -> Self {
        let mut denominations = Denominations::new();
        for (face, count) in counts {
            denominations.set(face, count);
        }
        denominations
    }
}

impl fmt::Display for Denominations {
    /// Formats as `face:count,face:count` in ascending face value order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, (face, count)) in self.iter().enumerate() {
            if position > 0 {
                f.write_str(",")?;
            }
            write!(f, "{face}:{count}")?;
        }
        Ok(())
    }
}

impl FromStr for Denominations {
    type Err = LedgerError;

    /// Parses `face:count,face:count`. An empty string is an empty map.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || LedgerError::MalformedDenominations(s.to_string());
        if s.trim().is_empty() {
            return Ok(Denominations::new());
        }
        let counts = s
            .split(',')
            .map(|pair| {
                let (face, count) = pair.split_once(':').ok_or_else(malformed)?;
                let face = face.trim().parse::<FaceValue>().map_err(|_| malformed())?;
                let count = count.trim().parse::<NoteCount>().map_err(|_| malformed())?;
                Ok((face, count))
            })
            .collect::<Result<Vec<_>, LedgerError>>()?;
        Denominations::try_from_counts(counts)
    }
}
