//! Plate Type - well geometry for experimental setups

use serde::{Deserialize, Serialize};

use super::WellPosition;
use crate::{Error, Result};

/// Largest supported row count (rows are labelled `A..=Z`).
pub const MAX_ROWS: u8 = 26;

/// Plate geometry registered in the structured store.
///
/// Plates are immutable once registered; an experiment references one and
/// gets exactly `rows * columns` wells.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlateType {
    plate_type_id: String,
    name: String,
    rows: u8,
    columns: u16,
    well_volume_ul: f64,
    material: String,
    description: Option<String>,
}

impl PlateType {
    /// Create a plate type with default volume and material.
    #[must_use]
    pub fn new(plate_type_id: impl Into<String>, name: impl Into<String>, rows: u8, columns: u16) -> Self {
        PlateTypeBuilder::new(plate_type_id, name, rows, columns).build()
    }

    /// Create a builder for constructing a plate type with optional fields.
    #[must_use]
    pub fn builder(
        plate_type_id: impl Into<String>,
        name: impl Into<String>,
        rows: u8,
        columns: u16,
    ) -> PlateTypeBuilder {
        PlateTypeBuilder::new(plate_type_id, name, rows, columns)
    }

    /// Get the plate type ID.
    #[must_use]
    pub fn plate_type_id(&self) -> &str {
        &self.plate_type_id
    }

    /// Get the plate name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of rows.
    #[must_use]
    pub const fn rows(&self) -> u8 {
        self.rows
    }

    /// Number of columns.
    #[must_use]
    pub const fn columns(&self) -> u16 {
        self.columns
    }

    /// Nominal volume per well in microlitres.
    #[must_use]
    pub const fn well_volume_ul(&self) -> f64 {
        self.well_volume_ul
    }

    /// Plate material.
    #[must_use]
    pub fn material(&self) -> &str {
        &self.material
    }

    /// Optional free-text description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Total number of wells.
    #[must_use]
    pub fn wells_count(&self) -> usize {
        usize::from(self.rows) * usize::from(self.columns)
    }

    /// Well positions in row-major order (`A1, A2, …, H12`).
    pub fn positions(&self) -> impl Iterator<Item = WellPosition> + '_ {
        (0..self.rows).flat_map(move |row| (1..=self.columns).map(move |column| WellPosition::new(row, column)))
    }

    /// Check the geometry before registration.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for empty ids, zero or oversized dimensions, or a
    /// non-positive well volume
    pub fn validate(&self) -> Result<()> {
        if self.plate_type_id.trim().is_empty() {
            return Err(Error::Validation("plate type id must not be empty".into()));
        }
        if self.rows == 0 || self.rows > MAX_ROWS {
            return Err(Error::Validation(format!(
                "plate {} must have 1..={MAX_ROWS} rows, got {}",
                self.plate_type_id, self.rows
            )));
        }
        if self.columns == 0 {
            return Err(Error::Validation(format!(
                "plate {} must have at least one column",
                self.plate_type_id
            )));
        }
        if !(self.well_volume_ul > 0.0) {
            return Err(Error::Validation(format!(
                "plate {} must have a positive well volume",
                self.plate_type_id
            )));
        }
        Ok(())
    }
}

/// Builder for `PlateType`.
#[derive(Debug)]
pub struct PlateTypeBuilder {
    plate_type_id: String,
    name: String,
    rows: u8,
    columns: u16,
    well_volume_ul: f64,
    material: String,
    description: Option<String>,
}

impl PlateTypeBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(plate_type_id: impl Into<String>, name: impl Into<String>, rows: u8, columns: u16) -> Self {
        Self {
            plate_type_id: plate_type_id.into(),
            name: name.into(),
            rows,
            columns,
            well_volume_ul: 200.0,
            material: "polystyrene".to_string(),
            description: None,
        }
    }

    /// Set the nominal well volume.
    #[must_use]
    pub const fn well_volume_ul(mut self, volume: f64) -> Self {
        self.well_volume_ul = volume;
        self
    }

    /// Set the plate material.
    #[must_use]
    pub fn material(mut self, material: impl Into<String>) -> Self {
        self.material = material.into();
        self
    }

    /// Set a description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Build the `PlateType`.
    #[must_use]
    pub fn build(self) -> PlateType {
        PlateType {
            plate_type_id: self.plate_type_id,
            name: self.name,
            rows: self.rows,
            columns: self.columns,
            well_volume_ul: self.well_volume_ul,
            material: self.material,
            description: self.description,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_96_well_positions() {
        let plate = PlateType::new("p96", "96-well-plate", 8, 12);
        let positions: Vec<String> = plate.positions().map(|p| p.to_string()).collect();
        assert_eq!(positions.len(), 96);
        assert_eq!(positions[0], "A1");
        assert_eq!(positions[11], "A12");
        assert_eq!(positions[95], "H12");
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        assert!(PlateType::new("p", "bad", 0, 12).validate().is_err());
        assert!(PlateType::new("p", "bad", 27, 12).validate().is_err());
        assert!(PlateType::new("p", "bad", 8, 0).validate().is_err());
        assert!(PlateType::builder("p", "bad", 8, 12)
            .well_volume_ul(0.0)
            .build()
            .validate()
            .is_err());
        assert!(PlateType::new("p", "ok", 16, 24).validate().is_ok());
    }
}
