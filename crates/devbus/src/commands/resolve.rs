//! `devbus resolve`: parse a connection spec and show the database
//! location requests would be sent to.

use serde::Serialize;

use devbus_api::ConnectionSpec;

use crate::cli::{GlobalOpts, ResolveArgs};
use crate::config;
use crate::error::CliError;
use crate::output;

#[derive(Debug, Serialize)]
struct Resolved {
    #[serde(flatten)]
    spec: ConnectionSpec,
    /// Location of the database device; absent for file databases.
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<String>,
}

impl From<ConnectionSpec> for Resolved {
    fn from(spec: ConnectionSpec) -> Self {
        let database = (!spec.is_file_backed).then(|| spec.db_location().to_string());
        Self { spec, database }
    }
}

fn yes_no(flag: bool) -> String {
    String::from(if flag { "yes" } else { "no" })
}

fn detail(r: &Resolved, color: bool) -> String {
    let spec = &r.spec;
    let mut rows = Vec::new();
    if let Some(path) = &spec.file_path {
        rows.push(("File database", path.display().to_string()));
    } else {
        rows.push(("Hosts", spec.hosts.join(", ")));
        rows.push(("Ports", spec.ports.join(", ")));
        rows.push(("Multi-host", yes_no(spec.is_multi_host)));
    }
    if let Some(db) = &r.database {
        rows.push(("Database", db.clone()));
    }
    output::detail(&rows, color)
}

fn id(r: &Resolved) -> String {
    match (&r.database, &r.spec.file_path) {
        (Some(db), _) => db.clone(),
        (None, Some(path)) => path.display().to_string(),
        (None, None) => String::new(),
    }
}

/// The spec given on the command line, else the configured one.
fn target(args: ResolveArgs, global: &GlobalOpts) -> Result<ConnectionSpec, CliError> {
    if let Some(spec) = args.spec {
        return Ok(spec.parse()?);
    }
    let cfg = config::load(global)?;
    if cfg.file_database.is_none() && cfg.tango_host.is_none() {
        return Err(CliError::NoDatabase {
            path: config::config_path(global).display().to_string(),
        });
    }
    Ok(cfg.connection_spec()?)
}

pub fn handle(args: ResolveArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let resolved = Resolved::from(target(args, global)?);
    tracing::info!(database = ?resolved.database, "resolved connection spec");

    let color = output::should_color(&global.color);
    let out = output::render_single(&global.output, &resolved, |r| detail(r, color), id)?;
    output::print_output(&out, global.quiet);
    Ok(())
}
