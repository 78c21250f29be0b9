//! 🚀 userstream: the front door, the bouncer, the maitre d' of the pipeline.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 This binary is the thin wrapper that parses args, loads config, sets up
//! logging, listens for Ctrl-C, and then lets the library do the heavy lifting.
//! Like a manager. 🦆

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::presets::{NOTHING, UTF8_FULL};
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use userstream::app_config::{AppConfig, SourceConfig};
use userstream::{ConsumerReport, DemoReport, ProducerReport, StopSignal, UserRecord};

/// 🚰 Fake users in, real rows out.
#[derive(Debug, Parser)]
#[command(name = "userstream", version, about)]
struct Cli {
    /// 📋 TOML config file. Missing is fine, env vars and defaults take over.
    #[arg(short, long, default_value = "userstream.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 📤 Fetch users and publish them to Kafka until the window closes.
    Produce,
    /// 📥 Consume the topic into Cassandra until Ctrl-C.
    Consume,
    /// 🔎 Print one user by id.
    Lookup { id: String },
    /// 🧮 Count the rows in the users table.
    Count,
    /// 👀 Print the first few rows.
    Head {
        #[arg(short = 'n', long, default_value_t = 5)]
        n: usize,
    },
    /// 🎪 Run the whole pipeline in-process, no Kafka and no Cassandra needed.
    Demo {
        #[arg(long, default_value_t = 10)]
        messages: u64,
        /// 📦 Use the built-in fixture user instead of calling randomuser.me.
        #[arg(long)]
        offline: bool,
    },
}

/// 🚀 main(): where it all begins. The "I pressed F5 and held my breath" moment.
#[tokio::main]
async fn main() -> Result<()> {
    // 📡 RUST_LOG wins; otherwise info, because the pipeline has things to say
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        error!("💀 error: {}", err);
        // -- 🧅 peel the onion of sadness, one layer at a time
        let mut the_vibes_are_giving_connection_issues = false;
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
            let cause_str = cause.to_string();
            if cause_str.contains("error sending request")
                || cause_str.contains("connection refused")
                || cause_str.contains("Connection refused")
                || cause_str.contains("Could not connect to Cassandra")
                || cause_str.contains("store unavailable")
                || cause_str.contains("Could not fetch metadata")
                || cause_str.contains("no partitions")
            {
                the_vibes_are_giving_connection_issues = true;
            }
        }

        if the_vibes_are_giving_connection_issues {
            error!(
                "🔧 hint: looks like Kafka or Cassandra isn't reachable. \
                If you're using Docker, try `docker ps` to see what's up, or \
                `docker compose up -d` to resurrect them. Or run `userstream demo --offline` \
                to watch the pipeline without either. ☕"
            );
        }

        // 🗑️ Exit with prejudice.
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let app_config = load(&cli.config)?;

    match cli.command {
        Command::Produce => {
            let report = userstream::produce(app_config, stop_on_signal()).await?;
            print_producer(&report);
        }
        Command::Consume => {
            let report = userstream::consume(app_config, stop_on_signal()).await?;
            print_consumer(&report);
        }
        Command::Lookup { id } => match userstream::lookup(&app_config, &id).await? {
            Some(record) => print_record(&record),
            None => {
                println!("🤷 No user with id '{id}'");
                std::process::exit(2);
            }
        },
        Command::Count => {
            println!("{}", userstream::count(&app_config).await?);
        }
        Command::Head { n } => {
            print_rows(&userstream::head(&app_config, n).await?);
        }
        Command::Demo { messages, offline } => {
            let mut app_config = app_config;
            if offline {
                app_config.source = SourceConfig::Fixture;
            }
            let report = userstream::demo(app_config, messages).await?;
            print_demo(&report);
        }
    }
    Ok(())
}

/// 🔒 Use the config file if it's there, env vars and defaults if it isn't.
fn load(config_file: &Path) -> Result<AppConfig> {
    let config_file_if_it_exists = match config_file.try_exists().with_context(|| {
        format!(
            "💀 Couldn't check whether the config file exists. Maybe a permissions thing, \
            maybe a pwd/cwd thing. Was checking here: '{}'",
            config_file.display()
        )
    })? {
        true => Some(config_file),
        false => {
            info!("📋 No config file at '{}', using env vars and defaults", config_file.display());
            None
        }
    };

    userstream::app_config::load_config(config_file_if_it_exists)
        .context("💀 Couldn't load the config. Check the TOML and any USTREAM_* env vars")
}

/// 🛑 A stop signal that fires on SIGTERM or SIGINT.
fn stop_on_signal() -> StopSignal {
    let (stop_handle, stop) = userstream::stop_pair();
    tokio::spawn(async move {
        match await_signal().await {
            Ok(name) => {
                info!("🛑 Received {name}, finishing the current unit of work and stopping");
                stop_handle.stop();
            }
            Err(err) => warn!("⚠️ Could not listen for shutdown signals, Ctrl-C will be abrupt: {err}"),
        }
    });
    stop
}

#[cfg(unix)]
async fn await_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term_signal = signal(SignalKind::terminate())?;
    let mut interrupt_signal = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = term_signal.recv() => Ok("SIGTERM"),
        _ = interrupt_signal.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn await_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl-C")
}

// ===== 🍽️ Printing =====

fn key_value_table(rows: Vec<(&str, String)>) -> Table {
    let mut table = Table::new();
    table.load_preset(NOTHING);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    for (key, value) in rows {
        table.add_row(vec![Cell::new(key), Cell::new(value).set_alignment(CellAlignment::Right)]);
    }
    table
}

fn print_producer(report: &ProducerReport) {
    println!(
        "{}",
        key_value_table(vec![
            ("ticks", report.ticks.to_string()),
            ("published", report.published.to_string()),
            ("source failures", report.source_failures.to_string()),
            ("publish failures", report.publish_failures.to_string()),
            ("elapsed", format!("{:.1?}", report.elapsed)),
            ("stopped early", report.stopped_early.to_string()),
        ])
    );
}

fn print_consumer(report: &ConsumerReport) {
    let offsets = report
        .next_offsets
        .iter()
        .map(|(partition, offset)| format!("{partition}:{offset}"))
        .collect::<Vec<_>>()
        .join(" ");
    println!(
        "{}",
        key_value_table(vec![
            ("batches", report.batches.to_string()),
            ("messages", report.messages.to_string()),
            ("rows written", report.rows_written.to_string()),
            ("dead letters", report.dead_letters.to_string()),
            ("checkpoint", offsets),
        ])
    );
}

fn print_record(record: &UserRecord) {
    println!(
        "{}",
        key_value_table(record.fields().iter().map(|(name, value)| (*name, value.to_string())).collect())
    );
}

fn print_rows(rows: &[UserRecord]) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["id", "name", "email", "username", "post_code"]);
    for row in rows {
        table.add_row(vec![
            row.id.clone(),
            format!("{} {}", row.first_name, row.last_name),
            row.email.clone(),
            row.username.clone(),
            row.post_code.clone(),
        ]);
    }
    println!("{table}");
}

fn print_demo(report: &DemoReport) {
    println!("📤 producer");
    print_producer(&report.producer);
    println!("📥 consumer");
    print_consumer(&report.consumer);
    println!("🏛️ {} rows in the table, first {}:", report.row_count, report.rows.len());
    print_rows(&report.rows);
}
