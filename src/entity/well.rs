//! Well Record - one position on an experiment's plate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Row/column position on a plate (`A1` is row 0, column 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WellPosition {
    row: u8,
    column: u16,
}

impl WellPosition {
    /// Create a position from a zero-based row and one-based column.
    #[must_use]
    pub const fn new(row: u8, column: u16) -> Self {
        Self { row, column }
    }

    /// Zero-based row index.
    #[must_use]
    pub const fn row(&self) -> u8 {
        self.row
    }

    /// One-based column number.
    #[must_use]
    pub const fn column(&self) -> u16 {
        self.column
    }

    /// Row label (`A`..=`Z`).
    #[must_use]
    pub fn row_label(&self) -> char {
        char::from(b'A' + self.row.min(25))
    }
}

impl fmt::Display for WellPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.row_label(), self.column)
    }
}

impl FromStr for WellPosition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.chars();
        let row = chars
            .next()
            .filter(char::is_ascii_uppercase)
            .ok_or_else(|| Error::Validation(format!("invalid well position '{s}'")))?;
        let column: u16 = chars
            .as_str()
            .parse()
            .map_err(|_| Error::Validation(format!("invalid well position '{s}'")))?;
        if column == 0 {
            return Err(Error::Validation(format!("invalid well position '{s}'")));
        }
        // ASCII uppercase fits in a u8 offset
        #[allow(clippy::cast_possible_truncation)]
        let row = (row as u32 - u32::from(b'A')) as u8;
        Ok(Self { row, column })
    }
}

/// Lifecycle of a single well, monotonic like the experiment's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WellStatus {
    /// Allocated, nothing measured yet.
    Pending,
    /// Raw sensor measurement recorded.
    Measured,
    /// Derived analysis result recorded.
    Analyzed,
    /// Well could not be processed.
    Failed,
}

impl WellStatus {
    const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Measured => 1,
            Self::Analyzed => 2,
            Self::Failed => 3,
        }
    }

    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Measured => "measured",
            Self::Analyzed => "analyzed",
            Self::Failed => "failed",
        }
    }

    /// Whether `next` keeps the lifecycle monotonic. Re-measuring a measured
    /// well is allowed (latest measurement wins); nothing leaves `Failed`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        match (self, next) {
            (Self::Failed, _) => false,
            (Self::Measured, Self::Measured) => true,
            (current, next) => next.rank() > current.rank(),
        }
    }
}

impl fmt::Display for WellStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured header of a well. Measurement and analysis payloads are
/// document fragments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WellRecord {
    well_id: String,
    experiment_id: String,
    position: WellPosition,
    status: WellStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    measured_at: Option<DateTime<Utc>>,
}

impl WellRecord {
    /// Create a pending well for an experiment.
    #[must_use]
    pub fn new(experiment_id: impl Into<String>, position: WellPosition) -> Self {
        let experiment_id = experiment_id.into();
        let now = Utc::now();
        Self {
            well_id: Self::id_for(&experiment_id, position),
            experiment_id,
            position,
            status: WellStatus::Pending,
            created_at: now,
            updated_at: now,
            measured_at: None,
        }
    }

    /// Well id for a position on an experiment's plate.
    #[must_use]
    pub fn id_for(experiment_id: &str, position: WellPosition) -> String {
        format!("{experiment_id}:{position}")
    }

    /// Get the well ID.
    #[must_use]
    pub fn well_id(&self) -> &str {
        &self.well_id
    }

    /// Get the parent experiment ID.
    #[must_use]
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Get the plate position.
    #[must_use]
    pub const fn position(&self) -> WellPosition {
        self.position
    }

    /// Get the current status.
    #[must_use]
    pub const fn status(&self) -> WellStatus {
        self.status
    }

    /// Get the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Get the last-modified timestamp.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Get the last measurement timestamp.
    #[must_use]
    pub const fn measured_at(&self) -> Option<DateTime<Utc>> {
        self.measured_at
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// Returns `IllegalTransition` if the move is not monotonic
    pub fn transition(&mut self, next: WellStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::IllegalTransition {
                entity: self.well_id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        if next == WellStatus::Measured {
            self.measured_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}
