//! SQLite storage for display preferences
//!
//! Two maps live under the `charcoal.preferences` namespace: the preferred
//! unit for a property (e.g. `blood_glucose` -> `mmol/L`) and the preferred
//! precision for a unit (e.g. `mmol/L` -> 1).

use std::path::Path;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Mutex, PoisonError};

use log::debug;
use rusqlite::{params, Connection, OptionalExtension, Result};
use serde::Serialize;

/// Namespace all preferences are stored under
pub const PREF_NAMESPACE: &str = "charcoal.preferences";

/// Returned by precision lookups when no fallback is supplied
pub const NO_SUCH_PRECISION: i32 = -1;

/// Which preference changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PreferenceChange {
    /// Preferred unit for this property
    Unit(String),
    /// Preferred precision for this unit
    Precision(String),
    Cleared,
}

/// Persistent preference store
pub struct PreferenceStore {
    conn: Connection,
    subscribers: Mutex<Vec<Sender<PreferenceChange>>>,
}

impl PreferenceStore {
    /// Create or open a preference database at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// A store that lives only as long as this value
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS unit_preferences (
                namespace TEXT NOT NULL,
                property TEXT NOT NULL,
                unit TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (namespace, property)
            );

            CREATE TABLE IF NOT EXISTS precision_preferences (
                namespace TEXT NOT NULL,
                unit TEXT NOT NULL,
                digits INTEGER NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (namespace, unit)
            );",
        )?;

        Ok(Self {
            conn,
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Set the unit used to display readings of `property`
    pub fn set_unit_for_property(&self, property: &str, unit: &str) -> Result<()> {
        debug!("Setting unit {} for property {}", unit, property);
        self.conn.execute(
            "INSERT INTO unit_preferences (namespace, property, unit) VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace, property)
             DO UPDATE SET unit = excluded.unit, updated_at = CURRENT_TIMESTAMP",
            params![PREF_NAMESPACE, property, unit],
        )?;
        self.publish(PreferenceChange::Unit(property.to_string()));
        Ok(())
    }

    /// Preferred unit for `property`, or `fallback` if none is set
    pub fn unit_for_property(&self, property: &str, fallback: &str) -> Result<String> {
        let unit: Option<String> = self
            .conn
            .query_row(
                "SELECT unit FROM unit_preferences WHERE namespace = ?1 AND property = ?2",
                params![PREF_NAMESPACE, property],
                |row| row.get(0),
            )
            .optional()?;

        if unit.is_none() {
            debug!("No unit set for property {}, using {}", property, fallback);
        }
        Ok(unit.unwrap_or_else(|| fallback.to_string()))
    }

    pub fn has_unit_for_property(&self, property: &str) -> Result<bool> {
        self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM unit_preferences WHERE namespace = ?1 AND property = ?2)",
            params![PREF_NAMESPACE, property],
            |row| row.get(0),
        )
    }

    /// Set the number of decimal digits shown for values in `unit`
    pub fn set_precision_for_unit(&self, unit: &str, precision: i32) -> Result<()> {
        debug!("Setting precision {} for unit {}", precision, unit);
        self.conn.execute(
            "INSERT INTO precision_preferences (namespace, unit, digits) VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace, unit)
             DO UPDATE SET digits = excluded.digits, updated_at = CURRENT_TIMESTAMP",
            params![PREF_NAMESPACE, unit, precision],
        )?;
        self.publish(PreferenceChange::Precision(unit.to_string()));
        Ok(())
    }

    /// Preferred precision for `unit`, or `fallback` if none is set
    pub fn precision_for_unit(&self, unit: &str, fallback: i32) -> Result<i32> {
        let precision: Option<i32> = self
            .conn
            .query_row(
                "SELECT digits FROM precision_preferences WHERE namespace = ?1 AND unit = ?2",
                params![PREF_NAMESPACE, unit],
                |row| row.get(0),
            )
            .optional()?;

        if precision.is_none() {
            debug!("No precision set for unit {}, using {}", unit, fallback);
        }
        Ok(precision.unwrap_or(fallback))
    }

    pub fn has_precision_for_unit(&self, unit: &str) -> Result<bool> {
        self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM precision_preferences WHERE namespace = ?1 AND unit = ?2)",
            params![PREF_NAMESPACE, unit],
            |row| row.get(0),
        )
    }

    /// Remove every stored preference
    pub fn clear_all(&self) -> Result<()> {
        self.conn.execute(
            "DELETE FROM unit_preferences WHERE namespace = ?1",
            params![PREF_NAMESPACE],
        )?;
        self.conn.execute(
            "DELETE FROM precision_preferences WHERE namespace = ?1",
            params![PREF_NAMESPACE],
        )?;
        self.publish(PreferenceChange::Cleared);
        Ok(())
    }

    /// All (property, unit) pairs, ordered by property
    pub fn unit_preferences(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT property, unit FROM unit_preferences WHERE namespace = ?1 ORDER BY property",
        )?;
        let rows = stmt
            .query_map(params![PREF_NAMESPACE], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// All (unit, precision) pairs, ordered by unit
    pub fn precision_preferences(&self) -> Result<Vec<(String, i32)>> {
        let mut stmt = self.conn.prepare(
            "SELECT unit, digits FROM precision_preferences WHERE namespace = ?1 ORDER BY unit",
        )?;
        let rows = stmt
            .query_map(params![PREF_NAMESPACE], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Receive a message for every subsequent preference write
    pub fn subscribe(&self) -> Receiver<PreferenceChange> {
        let (sender, receiver) = channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
        receiver
    }

    fn publish(&self, change: PreferenceChange) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|sender| sender.send(change.clone()).is_ok());
    }
}
