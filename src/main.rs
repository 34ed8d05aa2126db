//! Charcoal unit conversion host
//!
//! Converts measurements into the preferred display unit and precision, and
//! manages the stored display preferences.
//!
//! Usage:
//!   charcoal show blood_glucose 3.9 mmol/L     - Display a measurement
//!   charcoal set-unit blood_glucose mg/dL       - Change the preferred unit
//!   charcoal --help                             - Show help
//!   CHARCOAL_DBG=1 charcoal show ...            - Enable debug output

use std::env;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use charcoal::binding::{BoundElement, DisplayBinding, DisplayUpdate};
use charcoal::config::{config_file_path, default_database_path, ensure_data_dir, get_data_dir, Config};
use charcoal::error::CharcoalError;
use charcoal::measurement::Measurement;
use charcoal::scheduler::{ConversionScheduler, Delivery, SchedulerConfig, SubmitOutcome};
use charcoal::storage::PreferenceStore;
use charcoal::units::{Converter, UnitModel};

/// How long `show` waits for the worker pool
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Precision used for properties with no configured binding
const FALLBACK_PRECISION: i32 = 2;

fn main() -> Result<(), CharcoalError> {
    let args: Vec<String> = env::args().collect();

    // Check for debug mode
    let debug_mode = env::var("CHARCOAL_DBG").is_ok();

    // Initialize logger
    if debug_mode {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .init();
    }

    // Ensure data directory exists
    if let Err(e) = ensure_data_dir() {
        eprintln!("Warning: Could not create data directory: {}", e);
    }

    // Create default config if it doesn't exist
    let cfg_path = config_file_path();
    if !cfg_path.exists() {
        if let Err(e) = Config::create_default(&cfg_path) {
            warn!("Could not create default config: {}", e);
        }
    }

    // Try loading config from data directory first, then current directory
    let config = Config::load(&cfg_path)
        .or_else(|_| Config::load("config.txt"))
        .unwrap_or_else(|e| {
            warn!("Could not load config: {}. Using defaults.", e);
            Config::default()
        });

    // Use configured path or default OS-specific path
    let db_path = config
        .database_path
        .clone()
        .unwrap_or_else(|| default_database_path().to_string_lossy().to_string());

    match args.get(1).map(|s| s.as_str()) {
        Some("show") => {
            let property = required(&args, 2, "property")?;
            let value = parse_value(required(&args, 3, "value")?)?;
            let unit = required(&args, 4, "unit")?;
            cmd_show(&config, &db_path, property, Measurement::new(value, unit))?;
        }
        Some("observation") => {
            let property = required(&args, 2, "property")?;
            let path = required(&args, 3, "observation file")?;
            let resource: serde_json::Value = serde_json::from_str(&fs::read_to_string(path)?)?;
            let measurement = Measurement::from_fhir_observation(&resource).ok_or_else(|| {
                CharcoalError::InvalidArgument(format!("{} has no usable valueQuantity", path))
            })?;
            cmd_show(&config, &db_path, property, measurement)?;
        }
        Some("set-unit") => {
            let property = required(&args, 2, "property")?;
            let unit = required(&args, 3, "unit")?;
            cmd_set_unit(&config, &db_path, property, unit)?;
        }
        Some("set-precision") => {
            let unit = required(&args, 2, "unit")?;
            let digits = required(&args, 3, "digits")?;
            let digits: i32 = digits.parse().map_err(|_| {
                CharcoalError::InvalidArgument(format!("digits must be a number, got '{}'", digits))
            })?;
            let prefs = PreferenceStore::new(&db_path)?;
            prefs.set_precision_for_unit(unit, digits)?;
            eprintln!("{} values now show {} decimal digits", unit, digits);
        }
        Some("prefs") | Some("preferences") => {
            cmd_list_preferences(&db_path)?;
        }
        Some("symbol") => {
            let code = required(&args, 2, "unit code")?;
            let model = UnitModel::from_asset(config.unit_asset.as_deref());
            println!("{}", model.display_symbol(code));
        }
        Some("clear") => {
            let prefs = PreferenceStore::new(&db_path)?;
            prefs.clear_all()?;
            eprintln!("Cleared all display preferences in {}", db_path);
        }
        Some("path") | Some("paths") => {
            cmd_show_paths(&db_path);
        }
        Some("--version") | Some("-V") => {
            println!("charcoal {}", env!("CARGO_PKG_VERSION"));
        }
        Some("--help") | Some("-h") | Some("help") | None => {
            print_help();
        }
        Some(other) => {
            print_help();
            return Err(CharcoalError::InvalidArgument(format!("unknown command '{}'", other)));
        }
    }

    Ok(())
}

fn required<'a>(args: &'a [String], index: usize, name: &str) -> Result<&'a str, CharcoalError> {
    args.get(index)
        .map(|s| s.as_str())
        .ok_or_else(|| CharcoalError::InvalidArgument(format!("missing {}", name)))
}

fn parse_value(text: &str) -> Result<f64, CharcoalError> {
    text.parse::<f64>()
        .map_err(|_| CharcoalError::InvalidArgument(format!("'{}' is not a number", text)))
}

/// Convert and print one measurement (CLI mode)
fn cmd_show(
    config: &Config,
    db_path: &str,
    property: &str,
    measurement: Measurement,
) -> Result<(), CharcoalError> {
    let binding = config.binding(property).cloned().unwrap_or_else(|| {
        warn!("No binding configured for {}, displaying in source unit", property);
        DisplayBinding::new(property, measurement.unit_code.clone(), FALLBACK_PRECISION, "%s %s")
    });

    let prefs = PreferenceStore::new(db_path)?;
    let model: Arc<dyn Converter> = Arc::new(UnitModel::from_asset(config.unit_asset.as_deref()));
    let scheduler_config = match config.workers {
        Some(workers) => SchedulerConfig::with_workers(workers),
        None => SchedulerConfig::default(),
    };
    let (scheduler, deliveries) = ConversionScheduler::with_channel(model, scheduler_config)?;
    let scheduler = Arc::new(scheduler);

    let mut element = BoundElement::attach(binding, Arc::clone(&scheduler));
    info!("Showing {} {} as {}", measurement.value, measurement.unit_code, property);

    let text = match element.show(&prefs, measurement)? {
        DisplayUpdate::Text(text) => text,
        DisplayUpdate::Pending(SubmitOutcome::Rejected) => return Err(CharcoalError::SchedulerShutdown),
        DisplayUpdate::Pending(_) => wait_for(&deliveries, &element)?,
    };
    println!("{}", text);

    element.detach();
    scheduler.shutdown();
    debug!("Scheduler stats: {}", serde_json::to_string(&scheduler.stats())?);
    Ok(())
}

fn wait_for(
    deliveries: &std::sync::mpsc::Receiver<Delivery>,
    element: &BoundElement,
) -> Result<String, CharcoalError> {
    let deadline = Instant::now() + DELIVERY_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let delivery = deliveries.recv_timeout(remaining).map_err(|_| {
            CharcoalError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "conversion did not complete in time",
            ))
        })?;
        if delivery.element_id == element.id() {
            return Ok(delivery.text);
        }
    }
}

fn cmd_set_unit(config: &Config, db_path: &str, property: &str, unit: &str) -> Result<(), CharcoalError> {
    let model = UnitModel::from_asset(config.unit_asset.as_deref());
    if model.unit(unit).is_none() {
        eprintln!("Warning: {} is not in the unit table; values will show in their source unit", unit);
    }

    let prefs = PreferenceStore::new(db_path)?;
    prefs.set_unit_for_property(property, unit)?;
    eprintln!("{} now displays in {}", property, model.display_symbol(unit));
    Ok(())
}

/// Print stored preferences as JSON
fn cmd_list_preferences(db_path: &str) -> Result<(), CharcoalError> {
    let prefs = PreferenceStore::new(db_path)?;
    let units: serde_json::Map<String, serde_json::Value> = prefs
        .unit_preferences()?
        .into_iter()
        .map(|(property, unit)| (property, serde_json::Value::from(unit)))
        .collect();
    let precisions: serde_json::Map<String, serde_json::Value> = prefs
        .precision_preferences()?
        .into_iter()
        .map(|(unit, digits)| (unit, serde_json::Value::from(digits)))
        .collect();

    let json = serde_json::json!({ "units": units, "precision": precisions });
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

/// Show data paths
fn cmd_show_paths(db_path: &str) {
    println!("Charcoal Data Paths:");
    println!("  Data directory:  {}", get_data_dir().display());
    println!("  Database:        {}", db_path);
    println!("  Config file:     {}", config_file_path().display());
}

fn print_help() {
    eprintln!("Charcoal unit conversion v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("  charcoal show <property> <value> <unit>    Display a measurement");
    eprintln!("  charcoal observation <property> <file>     Display a FHIR Observation's quantity");
    eprintln!("  charcoal set-unit <property> <unit>        Set the preferred unit for a property");
    eprintln!("  charcoal set-precision <unit> <digits>     Set the decimal digits for a unit");
    eprintln!("  charcoal prefs                             List stored preferences");
    eprintln!("  charcoal symbol <code>                     Show the display symbol for a unit code");
    eprintln!("  charcoal clear                             Remove all stored preferences");
    eprintln!("  charcoal path                              Show data file locations");
    eprintln!("  charcoal help                              Show this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("  CHARCOAL_DBG=1              Enable debug output");
    eprintln!();
    eprintln!("DATA LOCATIONS:");
    eprintln!("  Database:  {}", default_database_path().display());
    eprintln!("  Config:    {}", config_file_path().display());
}
