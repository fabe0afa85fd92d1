//! Supported currencies and the cashier roster.
use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::desk::{FaceValue, LedgerError};

/// Currencies handled by the desk, each with a fixed set of note face values.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    /// Bulgarian lev, 10 and 50 notes.
    Bgn,
    /// Euro, 10, 20 and 50 notes.
    Eur,
}

impl Currency {
    /// Every supported currency, in display order.
    pub const ALL: [Currency; 2] = [Currency::Bgn, Currency::Eur];

    /// Legal face values, ascending.
    pub fn denominations(self) -> &'static [FaceValue] {
        match self {
            Currency::Bgn => &[10, 50],
            Currency::Eur => &[10, 20, 50],
        }
    }

    pub fn is_valid_denomination(self, face: FaceValue) -> bool {
        self.denominations().contains(&face)
    }

    /// Checks that every face value is legal for this currency.
    pub fn validate_faces(
        self,
        faces: impl IntoIterator<Item = FaceValue>,
    ) -> Result<(), LedgerError> {
        for face in faces {
            if !self.is_valid_denomination(face) {
                return Err(LedgerError::InvalidDenomination {
                    face,
                    currency: self,
                });
            }
        }
        Ok(())
    }

    pub fn code(self) -> &'static str {
        match self {
            Currency::Bgn => "BGN",
            Currency::Eur => "EUR",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BGN" => Ok(Currency::Bgn),
            "EUR" => Ok(Currency::Eur),
            _ => Err(LedgerError::InvalidCurrency(s.to_string())),
        }
    }
}

/// A cashier on the fixed roster.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Cashier {
    Martina,
    Peter,
    Linda,
}

impl Cashier {
    /// The roster, in a stable order. Locks are always taken in this order.
    pub const ALL: [Cashier; 3] = [Cashier::Martina, Cashier::Peter, Cashier::Linda];

    /// Size of the roster.
    pub const COUNT: usize = Self::ALL.len();

    /// Position of the cashier in [`Cashier::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Cashier::Martina => "MARTINA",
            Cashier::Peter => "PETER",
            Cashier::Linda => "LINDA",
        }
    }
}

impl fmt::Display for Cashier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Cashier {
    type Err = LedgerError;

    /// Parses a cashier name, ignoring surrounding whitespace and case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        Cashier::ALL
            .into_iter()
            .find(|cashier| cashier.name() == normalized)
            .ok_or_else(|| LedgerError::InvalidCashier(s.to_string()))
    }
}
