//! Configuration file parsing

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::binding::DisplayBinding;
use crate::error::CharcoalError;

/// Configuration loaded from config.txt
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Config {
    /// Unit-definition JSON; the built-in table is used when unset
    pub unit_asset: Option<String>,
    /// Preference database; the OS data directory is used when unset
    pub database_path: Option<String>,
    /// Worker pool size override
    pub workers: Option<usize>,
    /// Display bindings, one per property
    pub bindings: Vec<DisplayBinding>,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CharcoalError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        debug!("Loading config from {}", path.display());
        Self::parse(&text)
    }

    /// Parse configuration text
    pub fn parse(text: &str) -> Result<Self, CharcoalError> {
        let mut config = Config::default();

        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;

            // Strip trailing comment
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let Some((key, value)) = Self::parse_line(line) else {
                warn!("Ignoring config line {}: no value for '{}'", line_no, line);
                continue;
            };

            match key {
                "unit_asset" => config.unit_asset = Some(value.to_string()),
                "database" => config.database_path = Some(value.to_string()),
                "workers" => {
                    let workers = value.parse::<usize>().ok().filter(|n| *n > 0).ok_or_else(|| {
                        CharcoalError::Configuration(format!(
                            "line {}: workers must be a positive number, got '{}'",
                            line_no, value
                        ))
                    })?;
                    config.workers = Some(workers);
                }
                "property" => {
                    let binding = Self::parse_binding(value).ok_or_else(|| {
                        CharcoalError::Configuration(format!(
                            "line {}: expected 'property <name> <unit> <precision> <format>'",
                            line_no
                        ))
                    })?;
                    // Later lines override earlier ones
                    config.bindings.retain(|b| b.property != binding.property);
                    config.bindings.push(binding);
                }
                other => warn!("Ignoring unknown config key '{}' on line {}", other, line_no),
            }
        }

        Ok(config)
    }

    /// Parse a single config line, returning (key, value)
    fn parse_line(line: &str) -> Option<(&str, &str)> {
        let mut parts = line.splitn(2, |c: char| c.is_whitespace());
        let key = parts.next()?.trim();
        let value = parts.next()?.trim();

        if key.is_empty() || value.is_empty() {
            return None;
        }

        Some((key, value))
    }

    /// `<name> <default_unit> <default_precision> <format...>`
    fn parse_binding(value: &str) -> Option<DisplayBinding> {
        let (property, rest) = Self::parse_line(value)?;
        let (unit, rest) = Self::parse_line(rest)?;
        let (precision, format) = Self::parse_line(rest)?;
        let precision = precision.parse::<i32>().ok()?;
        Some(DisplayBinding::new(property, unit, precision, format))
    }

    /// Binding configured for `property`
    pub fn binding(&self, property: &str) -> Option<&DisplayBinding> {
        self.bindings.iter().find(|b| b.property == property)
    }

    /// Write a commented default config file
    pub fn create_default<P: AsRef<Path>>(path: P) -> Result<(), CharcoalError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, DEFAULT_CONFIG)?;
        debug!("Wrote default config to {}", path.display());
        Ok(())
    }
}

const DEFAULT_CONFIG: &str = "\
# charcoal configuration
#
# unit_asset <path>        unit-definition JSON (built-in clinical table if unset)
# database <path>          preference database
# workers <n>              conversion worker threads
# property <name> <default_unit> <default_precision> <format>
#
# The format takes the value then the unit: %s %s, {} {}, %2$s %1$s, {1} {0}

property blood_glucose mmol/L 1 %s %s
property body_weight kg 1 %s %s
property body_height cm 0 %s %s
property body_temperature Cel 1 %s %s
property heart_rate /min 0 %s %s
property blood_pressure mm[Hg] 0 %s %s
";

/// Directory holding the database and config file
pub fn get_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("charcoal")
}

/// Create the data directory if it does not exist
pub fn ensure_data_dir() -> Result<PathBuf, CharcoalError> {
    let dir = get_data_dir();
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn default_database_path() -> PathBuf {
    get_data_dir().join("charcoal.preferences.db")
}

pub fn config_file_path() -> PathBuf {
    get_data_dir().join("config.txt")
}
