//! mysql-queryable - command line entry point.
//!
//! Runs one statement and prints the result as JSON: one line per row for
//! row-returning statements, a single `{"affected_rows":..,"insert_id":..}`
//! object otherwise.

use futures_util::StreamExt;
use mysql_queryable::config::Cli;
use mysql_queryable::{Binds, Db, QueryOutcome, Queryable, StreamOptions};
use std::io::Write;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so stdout stays machine readable.
    if cli.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse_args();
    init_tracing(&cli);

    let config = cli.db_config()?;
    let db = Db::new(config)?;

    if cli.wait {
        info!("Waiting for the database");
        db.wait().await?;
    }

    let shape = cli.row_shape()?;
    let binds = Binds::from(cli.bind_values());

    let result = if cli.stream {
        let options = StreamOptions::new()
            .with_high_water_mark(cli.high_water_mark)
            .with_prepared(cli.prepared)
            .with_row_shape(shape);
        print_stream(&db, &cli.sql, binds, options).await
    } else {
        let options = db
            .options()
            .clone()
            .with_prepared(cli.prepared)
            .with_row_shape(shape);
        print_outcome(&db.with_options(options), &cli.sql, binds).await
    };

    db.close().await;

    if let Err(e) = result {
        error!(error = %e, "Statement failed");
        return Err(e);
    }
    Ok(())
}

async fn print_stream(
    db: &Db,
    sql: &str,
    binds: Binds,
    options: StreamOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut rows = db.stream_with(sql, binds, options);
    let mut out = std::io::stdout().lock();
    let mut count: u64 = 0;
    while let Some(row) = rows.next().await {
        serde_json::to_writer(&mut out, &row?)?;
        writeln!(out)?;
        count += 1;
    }
    info!(rows = count, "Stream finished");
    Ok(())
}

async fn print_outcome(
    queryable: &Queryable,
    sql: &str,
    binds: Binds,
) -> Result<(), Box<dyn std::error::Error>> {
    let outcome = queryable.query(sql, binds).await?;
    let mut out = std::io::stdout().lock();
    match &outcome {
        QueryOutcome::Rows(rows) => {
            for row in rows {
                serde_json::to_writer(&mut out, row)?;
                writeln!(out)?;
            }
        }
        QueryOutcome::Write(result) => {
            serde_json::to_writer(&mut out, result)?;
            writeln!(out)?;
        }
    }
    info!(rows = outcome.row_count(), "Statement finished");
    Ok(())
}
