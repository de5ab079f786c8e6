//! Device property handlers over a file database.

use std::path::Path;

use tabled::Tabled;

use devbus_api::DbDatum;
use devbus_core::PropertyStore;

use crate::cli::{GlobalOpts, PropArgs, PropCommand};
use crate::config;
use crate::error::CliError;
use crate::output;

// ── Table row ───────────────────────────────────────────────────────

#[derive(Tabled)]
struct PropRow {
    #[tabled(rename = "Property")]
    name: String,
    #[tabled(rename = "Values")]
    values: String,
}

impl From<&DbDatum> for PropRow {
    fn from(d: &DbDatum) -> Self {
        Self {
            name: d.name.clone(),
            values: d.values.join(", "),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn open(path: &Path) -> Result<PropertyStore, CliError> {
    tracing::info!(path = %path.display(), "opening file database");
    Ok(PropertyStore::open_file(path)?)
}

/// Device names are `domain/family/member`.
fn check_device_name(device: &str) -> Result<(), CliError> {
    let parts: Vec<&str> = device.split('/').collect();
    if parts.len() == 3 && parts.iter().all(|p| !p.is_empty()) {
        return Ok(());
    }
    Err(CliError::Validation {
        field: "device".into(),
        reason: format!("'{device}' is not of the form domain/family/member"),
    })
}

fn announce(message: &str, global: &GlobalOpts) {
    if !global.quiet {
        eprintln!("{message}");
    }
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: PropArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let device = match &args.command {
        PropCommand::Get { device, .. }
        | PropCommand::Put { device, .. }
        | PropCommand::Delete { device, .. } => device,
    };
    check_device_name(device)?;

    let path = config::file_database(global, args.file)?;
    let store = open(&path)?;

    match args.command {
        PropCommand::Get { device, names } => {
            let data = store.get_device_property(&device, names.as_slice())?;
            if data.iter().all(DbDatum::is_empty) {
                return Err(CliError::NotFound {
                    resource_type: "property".into(),
                    identifier: format!("{device}->{}", names.join(",")),
                    hint: format!("No value is stored in {}", path.display()),
                });
            }
            let out = output::render_list(
                &global.output,
                &data,
                |d| PropRow::from(d),
                |d| d.values.join("\n"),
            )?;
            output::print_output(&out, global.quiet);
            Ok(())
        }

        PropCommand::Put {
            device,
            name,
            values,
        } => {
            store.put_device_property(&device, &[DbDatum::with_values(name, values)])?;
            announce("Property set", global);
            Ok(())
        }

        PropCommand::Delete { device, names } => {
            store.delete_device_property(&device, names.as_slice())?;
            announce("Property deleted", global);
            Ok(())
        }
    }
}
