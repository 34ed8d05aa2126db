//! Unit definitions and conversion
//!
//! A unit-definition table is loaded from a JSON asset and kept behind a
//! [`UnitModel`], which swaps the whole table at once when a different asset
//! is requested. Readers take a snapshot of the current table, so a reload
//! never exposes a partially-built table.
//!
//! Conversion arithmetic is done in [`Decimal`] so converted values can be
//! truncated for display without binary floating-point noise.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, error, info};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::CharcoalError;

/// Asset name under which the embedded table is registered
pub const BUILTIN_ASSET: &str = "builtin:clinical-units";

static BUILTIN_UNITS: &str = include_str!("../assets/units.json");

/// Conversion and display services the scheduler depends on
pub trait Converter: Send + Sync {
    /// Convert `value` from one unit code to another.
    fn convert(&self, value: f64, from: &str, to: &str) -> Result<Decimal, CharcoalError>;

    /// Human-readable symbol for a unit code.
    fn display_symbol(&self, unit_code: &str) -> String;
}

#[derive(Debug, Deserialize)]
struct RawTable {
    #[serde(default)]
    version: Option<String>,
    units: Vec<RawUnit>,
    #[serde(default)]
    conversions: Vec<RawConversion>,
}

#[derive(Debug, Deserialize)]
struct RawUnit {
    code: String,
    #[serde(default)]
    print_symbol: Option<String>,
    #[serde(default)]
    name: Option<String>,
    dimension: String,
    #[serde(default)]
    factor: Option<String>,
    #[serde(default)]
    divisor: Option<String>,
    #[serde(default)]
    offset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConversion {
    from: String,
    to: String,
    factor: String,
    #[serde(default)]
    note: Option<String>,
}

/// A single unit of the loaded table.
///
/// Values map onto the dimension's base unit as
/// `base = (value + offset) * factor / divisor`.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitDefinition {
    pub code: String,
    pub print_symbol: String,
    pub name: String,
    pub dimension: String,
    factor: Decimal,
    divisor: Decimal,
    offset: Decimal,
}

impl UnitDefinition {
    fn to_base(&self, value: Decimal) -> Result<Decimal, CharcoalError> {
        value
            .checked_add(self.offset)
            .and_then(|v| v.checked_mul(self.factor))
            .and_then(|v| v.checked_div(self.divisor))
            .ok_or(CharcoalError::Overflow)
    }

    fn from_base(&self, base: Decimal) -> Result<Decimal, CharcoalError> {
        base.checked_mul(self.divisor)
            .and_then(|v| v.checked_div(self.factor))
            .and_then(|v| v.checked_sub(self.offset))
            .ok_or(CharcoalError::Overflow)
    }
}

/// An explicit factor between two units of different dimensions
#[derive(Debug, Clone, PartialEq)]
pub struct ExplicitConversion {
    pub factor: Decimal,
    pub note: Option<String>,
}

/// Immutable unit-definition table
#[derive(Debug, Default)]
pub struct UnitTable {
    version: Option<String>,
    units: HashMap<String, UnitDefinition>,
    conversions: HashMap<(String, String), ExplicitConversion>,
}

impl UnitTable {
    /// Parse and validate a JSON unit-definition asset
    pub fn from_json(bytes: &[u8]) -> Result<Self, CharcoalError> {
        let raw: RawTable = serde_json::from_slice(bytes)
            .map_err(|e| CharcoalError::Configuration(format!("malformed unit table: {}", e)))?;

        let mut units = HashMap::with_capacity(raw.units.len());
        for unit in raw.units {
            let factor = parse_factor(&unit.code, "factor", unit.factor.as_deref())?;
            let divisor = parse_factor(&unit.code, "divisor", unit.divisor.as_deref())?;
            let offset = match unit.offset.as_deref() {
                Some(text) => parse_decimal(&unit.code, "offset", text)?,
                None => Decimal::ZERO,
            };

            let definition = UnitDefinition {
                print_symbol: unit.print_symbol.unwrap_or_else(|| unit.code.clone()),
                name: unit.name.unwrap_or_default(),
                code: unit.code,
                dimension: unit.dimension,
                factor,
                divisor,
                offset,
            };

            if units.contains_key(&definition.code) {
                return Err(CharcoalError::Configuration(format!(
                    "duplicate unit code {}",
                    definition.code
                )));
            }
            units.insert(definition.code.clone(), definition);
        }

        let mut conversions = HashMap::with_capacity(raw.conversions.len());
        for conversion in raw.conversions {
            for code in [&conversion.from, &conversion.to] {
                if !units.contains_key(code) {
                    return Err(CharcoalError::Configuration(format!(
                        "conversion references unknown unit {}",
                        code
                    )));
                }
            }
            let label = format!("{} -> {}", conversion.from, conversion.to);
            let factor = parse_factor(&label, "factor", Some(&conversion.factor))?;
            conversions.insert(
                (conversion.from, conversion.to),
                ExplicitConversion {
                    factor,
                    note: conversion.note,
                },
            );
        }

        Ok(Self {
            version: raw.version,
            units,
            conversions,
        })
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, code: &str) -> Option<&UnitDefinition> {
        self.units.get(code)
    }

    /// Convert a decimal value between two unit codes of this table.
    ///
    /// Identical codes return the value untouched. An explicit conversion
    /// (in either direction) takes precedence; otherwise both units must
    /// share a dimension.
    pub fn convert(&self, value: Decimal, from: &str, to: &str) -> Result<Decimal, CharcoalError> {
        if from == to {
            return Ok(value);
        }

        let source = self
            .get(from)
            .ok_or_else(|| CharcoalError::UnknownUnit(from.to_string()))?;
        let target = self
            .get(to)
            .ok_or_else(|| CharcoalError::UnknownUnit(to.to_string()))?;

        if let Some(explicit) = self.conversions.get(&(from.to_string(), to.to_string())) {
            debug!("Using explicit conversion {} -> {}", from, to);
            return value
                .checked_mul(explicit.factor)
                .ok_or(CharcoalError::Overflow);
        }
        if let Some(explicit) = self.conversions.get(&(to.to_string(), from.to_string())) {
            debug!("Using inverse of explicit conversion {} -> {}", to, from);
            return value
                .checked_div(explicit.factor)
                .ok_or(CharcoalError::Overflow);
        }

        if source.dimension != target.dimension {
            return Err(CharcoalError::IncompatibleUnits {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        target.from_base(source.to_base(value)?)
    }

    /// Print symbol for a code, or its common display form when unknown
    pub fn display_symbol(&self, code: &str) -> String {
        match self.get(code) {
            Some(unit) => unit.print_symbol.clone(),
            None => {
                debug!("Unit {} not in table, defaulting to common display", code);
                common_display(code)
            }
        }
    }
}

fn parse_decimal(code: &str, field: &str, text: &str) -> Result<Decimal, CharcoalError> {
    Decimal::from_str(text.trim()).map_err(|e| {
        CharcoalError::Configuration(format!("invalid {} {:?} for {}: {}", field, text, code, e))
    })
}

/// Parse a multiplicative field, defaulting to one and rejecting zero
fn parse_factor(code: &str, field: &str, text: Option<&str>) -> Result<Decimal, CharcoalError> {
    let value = match text {
        Some(text) => parse_decimal(code, field, text)?,
        None => Decimal::ONE,
    };
    if value.is_zero() {
        return Err(CharcoalError::Configuration(format!(
            "{} for {} must not be zero",
            field, code
        )));
    }
    Ok(value)
}

/// Render a unit code without its bracket and annotation syntax.
///
/// `[lb_av]` becomes `lb_av`, `mg{glucose}/dL` becomes `mg/dL`.
pub fn common_display(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    let mut in_annotation = false;
    for c in code.chars() {
        match c {
            '{' => in_annotation = true,
            '}' => in_annotation = false,
            '[' | ']' => {}
            _ if !in_annotation => out.push(c),
            _ => {}
        }
    }
    out
}

/// Convert a float into a decimal through its shortest textual form
pub fn to_decimal(value: f64) -> Result<Decimal, CharcoalError> {
    let text = value.to_string();
    Decimal::from_str(&text).map_err(|_| CharcoalError::InvalidValue(text))
}

struct LoadedTable {
    asset: String,
    table: Arc<UnitTable>,
}

/// Owner of the currently loaded unit table
#[derive(Default)]
pub struct UnitModel {
    state: RwLock<Option<LoadedTable>>,
}

impl UnitModel {
    /// Create a model with nothing loaded
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a model with the embedded clinical table loaded
    pub fn builtin() -> Result<Self, CharcoalError> {
        let model = Self::new();
        model.load_builtin()?;
        Ok(model)
    }

    /// Model for a configured asset path, or the built-in table when unset.
    ///
    /// A load failure is logged once and leaves the model unloaded; every
    /// conversion then falls back to the source value and unit.
    pub fn from_asset(path: Option<&str>) -> Self {
        let model = Self::new();
        let loaded = match path {
            Some(path) => model.load_file(path),
            None => model.load_builtin(),
        };
        if let Err(e) = loaded {
            error!("Unit definitions unavailable, values display unconverted: {}", e);
        }
        model
    }

    /// Load a table from asset bytes.
    ///
    /// Loading the asset that is already loaded is a no-op. A different asset
    /// replaces the table in one step; on failure the previous table stays.
    pub fn load(&self, asset: &str, bytes: &[u8]) -> Result<(), CharcoalError> {
        if self.loaded_asset().as_deref() == Some(asset) {
            debug!("Unit asset {} already loaded", asset);
            return Ok(());
        }

        let table = UnitTable::from_json(bytes).map_err(|e| {
            error!("Cannot load unit definitions from {}: {}", asset, e);
            e
        })?;
        info!(
            "Loaded {} unit definitions from {} (version {})",
            table.len(),
            asset,
            table.version().unwrap_or("unversioned")
        );

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = Some(LoadedTable {
            asset: asset.to_string(),
            table: Arc::new(table),
        });
        Ok(())
    }

    /// Load a table from a file; the path doubles as the asset name
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<(), CharcoalError> {
        let path = path.as_ref();
        let asset = path.display().to_string();
        if self.loaded_asset().as_deref() == Some(asset.as_str()) {
            return Ok(());
        }
        let bytes = fs::read(path).map_err(|e| {
            CharcoalError::Configuration(format!("cannot read {}: {}", asset, e))
        })?;
        self.load(&asset, &bytes)
    }

    pub fn load_builtin(&self) -> Result<(), CharcoalError> {
        self.load(BUILTIN_ASSET, BUILTIN_UNITS.as_bytes())
    }

    /// Drop the loaded table
    pub fn clear(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = None;
    }

    pub fn is_loaded(&self) -> bool {
        self.table().is_some()
    }

    /// Name of the asset currently loaded, if any
    pub fn loaded_asset(&self) -> Option<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.as_ref().map(|loaded| loaded.asset.clone())
    }

    /// Snapshot of the current table
    pub fn table(&self) -> Option<Arc<UnitTable>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.as_ref().map(|loaded| Arc::clone(&loaded.table))
    }

    pub fn unit(&self, code: &str) -> Option<UnitDefinition> {
        self.table().and_then(|table| table.get(code).cloned())
    }
}

impl Converter for UnitModel {
    fn convert(&self, value: f64, from: &str, to: &str) -> Result<Decimal, CharcoalError> {
        let table = self.table().ok_or(CharcoalError::ModelNotLoaded)?;
        table.convert(to_decimal(value)?, from, to)
    }

    fn display_symbol(&self, unit_code: &str) -> String {
        match self.table() {
            Some(table) => table.display_symbol(unit_code),
            None => common_display(unit_code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(text: &str) -> Decimal {
        Decimal::from_str(text).unwrap()
    }

    fn model() -> UnitModel {
        UnitModel::builtin().unwrap()
    }

    #[test]
    fn test_builtin_table_loads() {
        let model = model();
        assert!(model.is_loaded());
        assert_eq!(model.loaded_asset().as_deref(), Some(BUILTIN_ASSET));
        assert_eq!(model.unit("mmol/L").unwrap().dimension, "substance-concentration");
    }

    #[test]
    fn test_glucose_conversion() {
        let model = model();
        assert_eq!(model.convert(3.9, "mmol/L", "mg/dL").unwrap(), dec("70.26084"));

        let back = model.convert(126.0, "mg/dL", "mmol/L").unwrap();
        assert_eq!(back.round_dp(3), dec("6.994"));
    }

    #[test]
    fn test_same_dimension_conversion() {
        let model = model();
        assert_eq!(model.convert(5.0, "mmol/L", "umol/L").unwrap(), dec("5000"));
        assert_eq!(model.convert(180.0, "cm", "m").unwrap(), dec("1.8"));
        assert_eq!(model.convert(1.0, "g/dL", "mg/dL").unwrap(), dec("1000"));

        let pounds = model.convert(70.0, "kg", "[lb_av]").unwrap();
        assert_eq!(pounds.round_dp(2), dec("154.32"));
    }

    #[test]
    fn test_temperature_offsets() {
        let model = model();
        assert_eq!(model.convert(98.6, "[degF]", "Cel").unwrap(), dec("37"));
        assert_eq!(model.convert(37.0, "Cel", "[degF]").unwrap(), dec("98.6"));
        assert_eq!(model.convert(0.0, "Cel", "K").unwrap(), dec("273.15"));
    }

    #[test]
    fn test_identical_units_skip_table() {
        let model = model();
        assert_eq!(model.convert(4.2, "not-a-unit", "not-a-unit").unwrap(), dec("4.2"));
    }

    #[test]
    fn test_conversion_errors() {
        let model = model();
        assert!(matches!(
            model.convert(1.0, "bogus-unit", "mmol/L"),
            Err(CharcoalError::UnknownUnit(code)) if code == "bogus-unit"
        ));
        assert!(matches!(
            model.convert(1.0, "mmol/L", "kg"),
            Err(CharcoalError::IncompatibleUnits { .. })
        ));
        assert!(matches!(
            model.convert(f64::NAN, "mmol/L", "mg/dL"),
            Err(CharcoalError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_unloaded_model() {
        let model = UnitModel::new();
        assert!(matches!(
            model.convert(3.9, "mmol/L", "mg/dL"),
            Err(CharcoalError::ModelNotLoaded)
        ));
        assert_eq!(model.display_symbol("[lb_av]"), "lb_av");
    }

    #[test]
    fn test_from_asset_degrades_on_bad_file() {
        let path = std::env::temp_dir().join(format!("charcoal-bad-units-{}.json", std::process::id()));
        std::fs::write(&path, "not json").unwrap();

        let model = UnitModel::from_asset(path.to_str());
        assert!(!model.is_loaded());
        assert!(matches!(
            model.convert(3.9, "mmol/L", "mg/dL"),
            Err(CharcoalError::ModelNotLoaded)
        ));

        let job = crate::job::ConversionJob::new(
            crate::job::ElementId::next(),
            crate::measurement::Measurement::new(3.9, "mmol/L"),
            "mg/dL",
            1,
            "%s %s",
        );
        assert_eq!(job.execute(&model), "3.9 mmol/L");

        let missing = UnitModel::from_asset(Some("/nonexistent/charcoal/units.json"));
        assert!(!missing.is_loaded());
        assert_eq!(UnitModel::from_asset(None).loaded_asset().as_deref(), Some(BUILTIN_ASSET));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_display_symbol() {
        let model = model();
        assert_eq!(model.display_symbol("Cel"), "°C");
        assert_eq!(model.display_symbol("mm[Hg]"), "mmHg");
        assert_eq!(model.display_symbol("mg{glucose}/dL"), "mg/dL");
        assert_eq!(model.display_symbol("bogus-unit"), "bogus-unit");
    }

    #[test]
    fn test_reload_semantics() {
        let model = model();
        let before = model.table().unwrap();

        // Same name: no-op even with different bytes
        model.load(BUILTIN_ASSET, b"not json").unwrap();
        assert!(Arc::ptr_eq(&before, &model.table().unwrap()));

        let small = br#"{ "units": [ { "code": "m", "dimension": "length" } ] }"#;
        model.load("small", small).unwrap();
        assert_eq!(model.loaded_asset().as_deref(), Some("small"));
        assert_eq!(model.table().unwrap().len(), 1);

        // The old snapshot is still intact for readers that held it
        assert!(before.get("mmol/L").is_some());
    }

    #[test]
    fn test_failed_load_keeps_previous_table() {
        let model = model();
        let err = model.load("broken", b"{ \"units\": 5 }").unwrap_err();
        assert!(matches!(err, CharcoalError::Configuration(_)));
        assert_eq!(model.loaded_asset().as_deref(), Some(BUILTIN_ASSET));
    }

    #[test]
    fn test_table_validation() {
        let zero = br#"{ "units": [ { "code": "x", "dimension": "d", "divisor": "0" } ] }"#;
        assert!(UnitTable::from_json(zero).is_err());

        let duplicate = br#"{ "units": [
            { "code": "x", "dimension": "d" },
            { "code": "x", "dimension": "d" }
        ] }"#;
        assert!(UnitTable::from_json(duplicate).is_err());

        let dangling = br#"{ "units": [ { "code": "x", "dimension": "d" } ],
            "conversions": [ { "from": "x", "to": "y", "factor": "2" } ] }"#;
        assert!(UnitTable::from_json(dangling).is_err());
    }

    #[test]
    fn test_clear() {
        let model = model();
        model.clear();
        assert!(!model.is_loaded());
        assert!(model.loaded_asset().is_none());
    }
}
