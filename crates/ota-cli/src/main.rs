use atty::Stream;
use clap::Parser;
use color_eyre::Result;
use serde_json::Value;

mod cli;
mod dispatch;
mod outcome;
mod style;

use cli::{CommandGroupCli, OtaCli};
use outcome::ExecutionOutcome;
use style::Style;

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = OtaCli::parse();
    init_tracing(cli.trace, cli.verbose);

    let name = dispatch::command_name(&cli.command);
    let outcome = dispatch::load_config(cli.config.as_deref())
        .and_then(|config| dispatch::dispatch_command(config, &cli.command))
        .unwrap_or_else(|err| ExecutionOutcome::from_error(&err));
    let code = emit_output(&cli, name, &outcome)?;

    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn init_tracing(trace: bool, verbose: u8) {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("ota={level},ota_core={level},ota_cli={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn emit_output(cli: &OtaCli, name: &str, outcome: &ExecutionOutcome) -> Result<i32> {
    let code = outcome.status.exit_code();
    let style = Style::new(cli.no_color, atty::is(Stream::Stdout));

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome.to_json(name))?);
    } else if code != 0 {
        eprintln!("{}", style.status(outcome.status, &outcome.message));
    } else if !cli.quiet {
        println!("{}", style.status(outcome.status, &outcome.message));
        match &cli.command {
            CommandGroupCli::Launch(args) if args.assets => {
                for line in asset_lines(&outcome.details) {
                    println!("{}", style.info(&line));
                }
            }
            CommandGroupCli::List => {
                if let Some(table) = render_update_table(&style, &outcome.details) {
                    println!("{table}");
                }
            }
            _ => {}
        }
    }

    Ok(code)
}

fn asset_lines(details: &Value) -> Vec<String> {
    details
        .get("localAssets")
        .and_then(Value::as_object)
        .map(|assets| {
            assets
                .iter()
                .map(|(key, path)| format!("  {key} -> {}", path.as_str().unwrap_or_default()))
                .collect()
        })
        .unwrap_or_default()
}

fn render_update_table(style: &Style, details: &Value) -> Option<String> {
    let updates = details.get("updates")?.as_array()?;
    if updates.is_empty() {
        return None;
    }

    let mut rows = Vec::new();
    for update in updates {
        rows.push([
            update["id"].as_str().unwrap_or_default().to_string(),
            update["status"].as_str().unwrap_or_default().to_string(),
            update["commitTime"].as_str().unwrap_or_default().to_string(),
            if update["launched"].as_bool().unwrap_or(false) {
                "yes".to_string()
            } else {
                "no".to_string()
            },
        ]);
    }
    let headers = ["ID", "STATUS", "COMMITTED", "LAUNCHED"];
    let mut widths = headers.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let format_row = |cells: &[String; 4]| {
        cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ")
    };
    let header = format_row(&headers.map(str::to_string));
    let mut lines = vec![style.table_header(header.trim_end())];
    for row in &rows {
        lines.push(format_row(row).trim_end().to_string());
    }
    Some(lines.join("\n"))
}
