//! Conversion jobs: one conversion-and-format request for one display element

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::measurement::Measurement;
use crate::precision::{truncate, truncate_decimal};
use crate::units::Converter;

static NEXT_ELEMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a single display slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(u64);

impl ElementId {
    /// A process-unique id
    pub fn next() -> Self {
        ElementId(NEXT_ELEMENT_ID.fetch_add(1, Ordering::Relaxed))
    }

}

impl From<u64> for ElementId {
    fn from(value: u64) -> Self {
        ElementId(value)
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "element-{}", self.0)
    }
}

/// Everything needed to convert and format one measurement for one element
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionJob {
    pub element_id: ElementId,
    pub measurement: Measurement,
    pub desired_unit: String,
    pub desired_precision: i32,
    /// Template with two positional placeholders: value, then unit
    pub display_format: String,
}

impl ConversionJob {
    pub fn new(
        element_id: ElementId,
        measurement: Measurement,
        desired_unit: impl Into<String>,
        desired_precision: i32,
        display_format: impl Into<String>,
    ) -> Self {
        Self {
            element_id,
            measurement,
            desired_unit: desired_unit.into(),
            desired_precision,
            display_format: display_format.into(),
        }
    }

    /// True when both jobs would render the same text: same measurement,
    /// unit, precision and format. A pending job collapses an identical one.
    pub fn same_request(&self, other: &ConversionJob) -> bool {
        self.measurement == other.measurement
            && self.desired_unit == other.desired_unit
            && self.desired_precision == other.desired_precision
            && self.display_format == other.display_format
    }

    /// Convert and format the measurement.
    ///
    /// Never fails: if the conversion is not possible the original value is
    /// shown with the original unit.
    pub fn execute(&self, converter: &dyn Converter) -> String {
        let source = &self.measurement;

        let (value, unit) = if source.unit_code == self.desired_unit {
            debug!("Current unit matches desired unit {}", self.desired_unit);
            (
                truncate(&source.value_string(), self.desired_precision),
                self.desired_unit.as_str(),
            )
        } else {
            debug!(
                "Converting {} {} to {}",
                source.value, source.unit_code, self.desired_unit
            );
            match converter.convert(source.value, &source.unit_code, &self.desired_unit) {
                Ok(converted) => {
                    debug!("Adjusted value for new unit -> {}", converted);
                    (
                        truncate_decimal(&converted, self.desired_precision),
                        self.desired_unit.as_str(),
                    )
                }
                Err(e) => {
                    debug!("Defaulting to passed in unit {}: {}", source.unit_code, e);
                    (
                        truncate(&source.value_string(), self.desired_precision),
                        source.unit_code.as_str(),
                    )
                }
            }
        };

        render_template(&self.display_format, &value, &converter.display_symbol(unit))
    }
}

/// Fill a two-slot display template with a value and a unit.
///
/// Sequential placeholders `%s`, `%v` and `{}` take the value first and the
/// unit second. `%1$s`/`%2$s` and `{0}`/`{1}` address them by position.
/// `%%` is a literal percent sign; anything unrecognised is copied through.
pub fn render_template(format: &str, value: &str, unit: &str) -> String {
    let args = [value, unit];
    let mut out = String::with_capacity(format.len() + value.len() + unit.len());
    let mut next = 0usize;
    let mut rest = format;

    while let Some(c) = rest.chars().next() {
        let consumed = match c {
            '%' => match placeholder_percent(rest) {
                Some((len, Some(index))) => {
                    push_arg(&mut out, &args, index);
                    len
                }
                Some((len, None)) if rest[1..].starts_with('%') => {
                    out.push('%');
                    len
                }
                Some((len, None)) => {
                    push_arg(&mut out, &args, next);
                    next += 1;
                    len
                }
                None => {
                    out.push('%');
                    1
                }
            },
            '{' => match placeholder_brace(rest) {
                Some((len, Some(index))) => {
                    push_arg(&mut out, &args, index);
                    len
                }
                Some((len, None)) => {
                    push_arg(&mut out, &args, next);
                    next += 1;
                    len
                }
                None => {
                    out.push('{');
                    1
                }
            },
            _ => {
                out.push(c);
                c.len_utf8()
            }
        };
        rest = &rest[consumed..];
    }

    out
}

fn push_arg(out: &mut String, args: &[&str; 2], index: usize) {
    if let Some(arg) = args.get(index) {
        out.push_str(arg);
    }
}

/// Recognise `%s`, `%v`, `%%` or `%N$s` at the start of `text`.
/// Returns the byte length and, for positional forms, the zero-based index.
fn placeholder_percent(text: &str) -> Option<(usize, Option<usize>)> {
    let bytes = text.as_bytes();
    match *bytes.get(1)? {
        b's' | b'v' | b'%' => Some((2, None)),
        b'1'..=b'9' => {
            let digits = bytes[1..].iter().take_while(|b| b.is_ascii_digit()).count();
            let after = 1 + digits;
            if bytes.get(after) == Some(&b'$') && matches!(bytes.get(after + 1).copied(), Some(b's' | b'v')) {
                let position: usize = text[1..after].parse().ok()?;
                Some((after + 2, Some(position - 1)))
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Recognise `{}` or `{N}` at the start of `text`
fn placeholder_brace(text: &str) -> Option<(usize, Option<usize>)> {
    let close = text.find('}')?;
    let inner = &text[1..close];
    if inner.is_empty() {
        Some((2, None))
    } else if inner.bytes().all(|b| b.is_ascii_digit()) {
        Some((close + 1, Some(inner.parse().ok()?)))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::UnitModel;

    fn glucose_job(value: f64, unit: &str, desired: &str, precision: i32) -> ConversionJob {
        ConversionJob::new(
            ElementId::from(1),
            Measurement::new(value, unit),
            desired,
            precision,
            "%s %s",
        )
    }

    #[test]
    fn test_element_ids_are_unique() {
        let a = ElementId::next();
        let b = ElementId::next();
        assert_ne!(a, b);
        assert_eq!(ElementId::from(7).to_string(), "element-7");
    }

    #[test]
    fn test_render_template_sequential() {
        assert_eq!(render_template("%s %s", "70", "mg/dL"), "70 mg/dL");
        assert_eq!(render_template("%v %v", "70", "mg/dL"), "70 mg/dL");
        assert_eq!(render_template("{} {}", "70", "mg/dL"), "70 mg/dL");
        assert_eq!(render_template("Glucose: %s (%s)", "5.5", "mmol/L"), "Glucose: 5.5 (mmol/L)");
    }

    #[test]
    fn test_render_template_positional() {
        assert_eq!(render_template("%2$s %1$s", "70", "mg/dL"), "mg/dL 70");
        assert_eq!(render_template("{1}: {0}", "70", "mg/dL"), "mg/dL: 70");
    }

    #[test]
    fn test_render_template_literals() {
        assert_eq!(render_template("%s%%", "12", "%"), "12%");
        assert_eq!(render_template("%d {x} %s", "1", "u"), "%d {x} 1");
        assert_eq!(render_template("%s %s %s", "1", "u"), "1 u ");
        assert_eq!(render_template("50% of %s", "1", "u"), "50% of 1");
    }

    #[test]
    fn test_execute_converts() {
        let model = UnitModel::builtin().unwrap();
        let job = glucose_job(3.9, "mmol/L", "mg/dL", 0);
        assert_eq!(job.execute(&model), "70 mg/dL");

        let job = glucose_job(3.9, "mmol/L", "mg/dL", 2);
        assert_eq!(job.execute(&model), "70.26 mg/dL");
    }

    #[test]
    fn test_execute_same_unit() {
        let model = UnitModel::builtin().unwrap();
        let job = glucose_job(75.0, "mg/dL", "mg/dL", 2);
        assert_eq!(job.execute(&model), "75.0 mg/dL");

        let job = glucose_job(5.678, "mmol/L", "mmol/L", 1);
        assert_eq!(job.execute(&model), "5.6 mmol/L");
    }

    #[test]
    fn test_execute_falls_back_to_source_unit() {
        let model = UnitModel::builtin().unwrap();
        let job = glucose_job(12.55, "bogus-unit", "mmol/L", 1);
        assert_eq!(job.execute(&model), "12.5 bogus-unit");

        let job = glucose_job(80.0, "kg", "mmol/L", 0);
        assert_eq!(job.execute(&model), "80 kg");
    }

    #[test]
    fn test_execute_without_model() {
        let model = UnitModel::new();
        let job = glucose_job(3.9, "mmol/L", "mg/dL", 0);
        assert_eq!(job.execute(&model), "3 mmol/L");
    }

    #[test]
    fn test_same_request() {
        let job = glucose_job(3.9, "mmol/L", "mg/dL", 0);
        assert!(job.same_request(&glucose_job(3.9, "mmol/L", "mg/dL", 0)));
        assert!(!job.same_request(&glucose_job(4.0, "mmol/L", "mg/dL", 0)));
        assert!(!job.same_request(&glucose_job(3.9, "mmol/L", "mmol/L", 0)));
        assert!(!job.same_request(&glucose_job(3.9, "mmol/L", "mg/dL", 2)));

        let mut reformatted = glucose_job(3.9, "mmol/L", "mg/dL", 0);
        reformatted.display_format = "{1}: {0}".to_string();
        assert!(!job.same_request(&reformatted));

        // Only the request matters, not which element asked
        let mut other_element = glucose_job(3.9, "mmol/L", "mg/dL", 0);
        other_element.element_id = ElementId::from(2);
        assert!(job.same_request(&other_element));
    }
}
