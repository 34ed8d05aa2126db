//! Display bindings
//!
//! A binding says how one display element shows a property: which unit to
//! fall back to, how many digits, and the display template. The host builds
//! bindings explicitly (or reads them from the config file) and attaches them
//! to element ids; preferences are consulted on every display request.

use std::sync::Arc;

use log::{debug, warn};

use crate::error::CharcoalError;
use crate::job::{ConversionJob, ElementId};
use crate::measurement::Measurement;
use crate::scheduler::{ConversionScheduler, SubmitOutcome};
use crate::storage::{PreferenceChange, PreferenceStore};

/// How an element displays a property
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayBinding {
    /// Property name used as the unit preference key (e.g. `blood_glucose`)
    pub property: String,
    pub default_unit: String,
    pub default_precision: i32,
    pub format: String,
}

/// What a display request turned into
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Job(ConversionJob),
    /// The binding is incomplete; show the bare value
    Plain(String),
}

impl DisplayBinding {
    pub fn new(
        property: impl Into<String>,
        default_unit: impl Into<String>,
        default_precision: i32,
        format: impl Into<String>,
    ) -> Self {
        Self {
            property: property.into(),
            default_unit: default_unit.into(),
            default_precision,
            format: format.into(),
        }
    }

    /// All fields needed for a conversion are present
    pub fn is_initialized(&self) -> bool {
        self.default_precision >= 0
            && !self.format.is_empty()
            && !self.property.is_empty()
            && !self.default_unit.is_empty()
    }

    /// Preferred unit for the property, or the binding's default
    pub fn desired_unit(&self, prefs: &PreferenceStore) -> Result<String, CharcoalError> {
        Ok(prefs.unit_for_property(&self.property, &self.default_unit)?)
    }

    /// Preferred precision for `unit`, or the binding's default
    pub fn desired_precision(&self, prefs: &PreferenceStore, unit: &str) -> Result<i32, CharcoalError> {
        Ok(prefs.precision_for_unit(unit, self.default_precision)?)
    }

    /// Turn a measurement into a conversion job for `element_id`
    pub fn resolve(
        &self,
        prefs: &PreferenceStore,
        element_id: ElementId,
        measurement: &Measurement,
    ) -> Result<Resolution, CharcoalError> {
        if !self.is_initialized() {
            warn!(
                "Binding for {} not initialized, displaying as plain number",
                element_id
            );
            return Ok(Resolution::Plain(measurement.value_string()));
        }

        let unit = self.desired_unit(prefs)?;
        let precision = self.desired_precision(prefs, &unit)?;
        debug!(
            "{} displays {} in {} with {} digits",
            element_id, self.property, unit, precision
        );

        Ok(Resolution::Job(ConversionJob::new(
            element_id,
            measurement.clone(),
            unit,
            precision,
            self.format.clone(),
        )))
    }
}

/// Result of asking a bound element to show its measurement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayUpdate {
    /// A job went to the scheduler; the text arrives through its sink
    Pending(SubmitOutcome),
    /// Text to show right away
    Text(String),
}

/// A display element attached to a scheduler.
///
/// Dropping it (or calling [`BoundElement::detach`]) unregisters the element,
/// so no result is delivered for it afterwards.
pub struct BoundElement {
    id: ElementId,
    binding: DisplayBinding,
    scheduler: Arc<ConversionScheduler>,
    current: Option<Measurement>,
    last_unit: Option<String>,
}

impl BoundElement {
    pub fn attach(binding: DisplayBinding, scheduler: Arc<ConversionScheduler>) -> Self {
        Self {
            id: ElementId::next(),
            binding,
            scheduler,
            current: None,
            last_unit: None,
        }
    }

    pub fn id(&self) -> ElementId {
        self.id
    }

    /// Display a new measurement
    pub fn show(
        &mut self,
        prefs: &PreferenceStore,
        measurement: Measurement,
    ) -> Result<DisplayUpdate, CharcoalError> {
        self.current = Some(measurement);
        match self.relight(prefs)? {
            Some(update) => Ok(update),
            None => Err(CharcoalError::InvalidArgument("no measurement to show".to_string())),
        }
    }

    /// Re-display the current measurement with the current preferences
    pub fn relight(&mut self, prefs: &PreferenceStore) -> Result<Option<DisplayUpdate>, CharcoalError> {
        let Some(measurement) = self.current.as_ref() else {
            return Ok(None);
        };

        match self.binding.resolve(prefs, self.id, measurement)? {
            Resolution::Job(job) => {
                self.last_unit = Some(job.desired_unit.clone());
                Ok(Some(DisplayUpdate::Pending(self.scheduler.submit(job))))
            }
            Resolution::Plain(text) => {
                // A pending conversion must not overwrite the plain text
                self.scheduler.unregister(self.id);
                self.last_unit = None;
                Ok(Some(DisplayUpdate::Text(text)))
            }
        }
    }

    /// Whether a preference change should trigger a relight
    pub fn affected_by(&self, change: &PreferenceChange) -> bool {
        match change {
            PreferenceChange::Unit(property) => *property == self.binding.property,
            PreferenceChange::Precision(unit) => {
                *unit == self.binding.default_unit || self.last_unit.as_deref() == Some(unit.as_str())
            }
            PreferenceChange::Cleared => true,
        }
    }

    /// Tear the element down
    pub fn detach(self) {}
}

impl Drop for BoundElement {
    fn drop(&mut self) {
        self.scheduler.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Delivery, SchedulerConfig};
    use crate::units::{Converter, UnitModel};
    use std::sync::mpsc::Receiver;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn glucose_binding() -> DisplayBinding {
        DisplayBinding::new("blood_glucose", "mmol/L", 1, "%s %s")
    }

    fn scheduler() -> (Arc<ConversionScheduler>, Receiver<Delivery>) {
        let model: Arc<dyn Converter> = Arc::new(UnitModel::builtin().unwrap());
        let (scheduler, rx) =
            ConversionScheduler::with_channel(model, SchedulerConfig::with_workers(1)).unwrap();
        (Arc::new(scheduler), rx)
    }

    #[test]
    fn test_resolve_uses_defaults() {
        let prefs = PreferenceStore::in_memory().unwrap();
        let id = ElementId::next();
        let measurement = Measurement::new(75.0, "mg/dL");

        let resolution = glucose_binding().resolve(&prefs, id, &measurement).unwrap();
        assert_eq!(
            resolution,
            Resolution::Job(ConversionJob::new(id, measurement, "mmol/L", 1, "%s %s"))
        );
    }

    #[test]
    fn test_resolve_uses_preferences() {
        let prefs = PreferenceStore::in_memory().unwrap();
        prefs.set_unit_for_property("blood_glucose", "mg/dL").unwrap();
        prefs.set_precision_for_unit("mg/dL", 0).unwrap();
        prefs.set_precision_for_unit("mmol/L", 3).unwrap();

        let measurement = Measurement::new(3.9, "mmol/L");
        let Resolution::Job(job) = glucose_binding()
            .resolve(&prefs, ElementId::next(), &measurement)
            .unwrap()
        else {
            panic!("expected a job");
        };
        assert_eq!(job.desired_unit, "mg/dL");
        assert_eq!(job.desired_precision, 0);
    }

    #[test]
    fn test_uninitialized_binding_shows_plain_value() {
        let prefs = PreferenceStore::in_memory().unwrap();
        let binding = DisplayBinding::new("blood_glucose", "mmol/L", -1, "%s %s");
        assert!(!binding.is_initialized());

        let resolution = binding
            .resolve(&prefs, ElementId::next(), &Measurement::new(3.9, "mmol/L"))
            .unwrap();
        assert_eq!(resolution, Resolution::Plain("3.9".to_string()));
    }

    #[test]
    fn test_bound_element_show_and_relight() {
        let prefs = PreferenceStore::in_memory().unwrap();
        let (scheduler, rx) = scheduler();
        let mut element = BoundElement::attach(glucose_binding(), Arc::clone(&scheduler));

        assert_eq!(element.relight(&prefs).unwrap(), None);

        element.show(&prefs, Measurement::new(3.9, "mmol/L")).unwrap();
        let first = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(first.element_id, element.id());
        assert_eq!(first.text, "3.9 mmol/L");

        let changes = prefs.subscribe();
        prefs.set_unit_for_property("blood_glucose", "mg/dL").unwrap();
        prefs.set_precision_for_unit("mg/dL", 0).unwrap();
        for change in changes.try_iter() {
            if element.affected_by(&change) {
                element.relight(&prefs).unwrap();
            }
        }

        // Deliveries for this element end with the latest preferences applied
        let mut last = String::new();
        while let Ok(delivery) = rx.recv_timeout(Duration::from_millis(500)) {
            last = delivery.text;
        }
        assert_eq!(last, "70 mg/dL");
    }

    #[test]
    fn test_affected_by() {
        let (scheduler, _rx) = scheduler();
        let element = BoundElement::attach(glucose_binding(), scheduler);

        assert!(element.affected_by(&PreferenceChange::Unit("blood_glucose".to_string())));
        assert!(!element.affected_by(&PreferenceChange::Unit("heart_rate".to_string())));
        assert!(element.affected_by(&PreferenceChange::Precision("mmol/L".to_string())));
        assert!(!element.affected_by(&PreferenceChange::Precision("kg".to_string())));
        assert!(element.affected_by(&PreferenceChange::Cleared));
    }

    #[test]
    fn test_drop_unregisters() {
        let prefs = PreferenceStore::in_memory().unwrap();
        let (scheduler, _rx) = scheduler();
        let mut element = BoundElement::attach(glucose_binding(), Arc::clone(&scheduler));
        let id = element.id();

        element.show(&prefs, Measurement::new(3.9, "mmol/L")).unwrap();
        element.detach();
        assert!(!scheduler.is_pending(id));
    }
}
