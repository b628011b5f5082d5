use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;

use saga_migrator_lib::import::write_import_report;
use saga_migrator_lib::store::{open_pool, SqliteDocumentStore, SqliteTableStore};
use saga_migrator_lib::{
    derive, init_logging, AppError, AppResult, CancelFlag, ExportTree, Exporter, Importer,
    MigratorConfig,
};

#[derive(Parser)]
#[command(name = "saga-migrator", about = "Moves saga state from a table store to a document store")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the document id derived from a saga key
    Derive {
        /// Fully qualified saga data type name
        #[arg(long = "type", value_name = "TYPE")]
        type_name: String,
        /// Name of the correlation property
        #[arg(long)]
        property: String,
        /// Key value as text
        #[arg(long)]
        value: String,
    },
    /// Export every record of one saga type to `<out>/<type>/<id>.json`
    Export {
        /// SQLite database holding the table store
        #[arg(long, value_name = "PATH")]
        source: PathBuf,
        #[arg(long = "type", value_name = "TYPE")]
        type_name: String,
        /// Property whose value keys each saga
        #[arg(long, value_name = "NAME")]
        key_property: String,
        #[arg(long, value_name = "DIR")]
        out: PathBuf,
        /// JSON settings file
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
        /// Where to write the run report (overrides the settings file)
        #[arg(long, value_name = "DIR")]
        report_dir: Option<PathBuf>,
    },
    /// Load an export tree into the document store
    Import {
        /// SQLite database holding the document store (created if missing)
        #[arg(long, value_name = "PATH")]
        target: PathBuf,
        #[arg(long = "in", value_name = "DIR")]
        input: PathBuf,
        /// Only import this type's directory
        #[arg(long = "type", value_name = "TYPE")]
        type_name: Option<String>,
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
        #[arg(long, value_name = "DIR")]
        report_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    let result = match cli.cmd {
        Cmd::Derive {
            type_name,
            property,
            value,
        } => {
            println!("{}", derive(&type_name, &property, &value));
            Ok(true)
        }
        Cmd::Export {
            source,
            type_name,
            key_property,
            out,
            config,
            report_dir,
        } => {
            export(
                &source,
                type_name,
                key_property,
                out,
                config.as_deref(),
                report_dir,
            )
            .await
        }
        Cmd::Import {
            target,
            input,
            type_name,
            config,
            report_dir,
        } => {
            import(
                &target,
                &input,
                type_name.as_deref(),
                config.as_deref(),
                report_dir,
            )
            .await
        }
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(err) => {
            err.log_with_event("cli_failed");
            eprintln!("error: {err}");
            ExitCode::from(1)
        }
    }
}

fn load_config(path: Option<&Path>) -> AppResult<MigratorConfig> {
    match path {
        Some(path) => MigratorConfig::load(path),
        None => Ok(MigratorConfig::default()),
    }
}

/// Stops new work on Ctrl-C; whatever is in flight finishes.
fn cancel_on_ctrl_c() -> CancelFlag {
    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!(target: "saga_migrator", event = "cancel_requested");
            flag.cancel();
        }
    });
    cancel
}

fn print_summary<T: Serialize>(summary: &T) -> AppResult<()> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}

async fn export(
    source: &Path,
    type_name: String,
    key_property: String,
    out: PathBuf,
    config: Option<&Path>,
    report_dir: Option<PathBuf>,
) -> AppResult<bool> {
    let config = load_config(config)?;
    let mut options = config.export_options(out, type_name, key_property);
    if report_dir.is_some() {
        options.report_dir = report_dir;
    }

    let pool = open_pool(source, false)
        .await
        .map_err(|err| AppError::from(err).with_context("db", source.display().to_string()))?;
    let store = SqliteTableStore::new(pool);

    let summary = Exporter::new(Arc::new(store), options)
        .with_cancel_flag(cancel_on_ctrl_c())
        .run()
        .await?;
    print_summary(&summary)?;
    Ok(summary.is_clean())
}

async fn import(
    target: &Path,
    input: &Path,
    type_name: Option<&str>,
    config: Option<&Path>,
    report_dir: Option<PathBuf>,
) -> AppResult<bool> {
    let config = load_config(config)?;
    let tree = ExportTree::load(input, type_name)?;

    let pool = open_pool(target, true)
        .await
        .map_err(|err| AppError::from(err).with_context("db", target.display().to_string()))?;
    let store = SqliteDocumentStore::new(pool);
    store.ensure_schema().await?;

    let summary = Importer::new(Arc::new(store))
        .with_cancel_flag(cancel_on_ctrl_c())
        .run(&tree)
        .await;

    if let Some(dir) = report_dir.or(config.import.report_dir) {
        write_import_report(&dir, tree.root(), &summary)?;
    }
    print_summary(&summary)?;
    Ok(summary.is_clean())
}
