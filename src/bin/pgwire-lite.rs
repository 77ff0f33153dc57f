//! pgwire-lite - interactive PostgreSQL client
//!
//! # Usage
//!
//! ```bash
//! # Interactive session (empty line runs the default query)
//! PGPASSWORD=secret pgwire-lite -U alice -d shop
//!
//! # One command, rows as JSON
//! pgwire-lite -c "SELECT id, email FROM users" --format json
//! ```

use std::collections::VecDeque;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use colored::*;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;

use pgwire_lite::protocol::ErrorFields;
use pgwire_lite::{CommandSource, ConnectConfig, Event, EventSink, PgConnection, PgError, ResultSet};

#[derive(Parser)]
#[command(name = "pgwire-lite")]
#[command(version)]
#[command(about = "Minimal PostgreSQL client over the v3 wire protocol", long_about = None)]
#[command(after_help = "EXAMPLES:
    pgwire-lite -U alice -d shop
    pgwire-lite -c 'SELECT now()'
    pgwire-lite --config ./pgwire.toml --format table")]
struct Cli {
    /// Server host
    #[arg(long, env = "PGHOST")]
    host: Option<String>,

    /// Server port
    #[arg(short, long, env = "PGPORT")]
    port: Option<u16>,

    /// User name
    #[arg(short = 'U', long, env = "PGUSER")]
    user: Option<String>,

    /// Database name
    #[arg(short, long, env = "PGDATABASE")]
    database: Option<String>,

    /// Password for SCRAM-SHA-256
    #[arg(long, env = "PGPASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Query run when an empty command is entered
    #[arg(long)]
    default_query: Option<String>,

    /// Config file (defaults to ./pgwire.toml, then the user config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run a single command and exit
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "plain")]
    format: OutputFormat,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// One line per row, values joined with " | "
    Plain,
    Table,
    Json,
}

impl Cli {
    /// Config file values overridden by flags and environment.
    fn connect_config(&self) -> anyhow::Result<ConnectConfig> {
        let mut config = ConnectConfig::load(self.config.as_deref())?;
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(user) = &self.user {
            config.user = user.clone();
        }
        if let Some(database) = &self.database {
            config.database = database.clone();
        }
        if let Some(password) = &self.password {
            config.password = Some(password.clone());
        }
        if let Some(query) = &self.default_query {
            config.default_query = query.clone();
        }
        if config.application_name.is_none() {
            config.application_name = Some("pgwire-lite".to_string());
        }
        Ok(config.validate()?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let config = cli.connect_config()?;
    let mut conn = PgConnection::connect(&config)
        .await
        .with_context(|| format!("could not connect to {}", config.address()))?;

    let mut terminal = Terminal::new(cli.format);
    conn.handshake(&mut terminal)
        .await
        .with_context(|| format!("login as {} failed", config.user))?;

    match &cli.command {
        Some(command) => {
            let mut commands = VecDeque::from(vec![command.clone()]);
            conn.run(&mut commands, &mut terminal).await?;
            if terminal.errors > 0 {
                std::process::exit(1);
            }
        }
        None => {
            println!(
                "{} {}@{}/{}",
                "Connected:".green().bold(),
                config.user,
                config.address(),
                config.database
            );
            if let Some(version) = conn.context().parameter("server_version") {
                println!("{} {}", "Server:".dimmed(), version);
            }
            println!(
                "{}",
                "Empty line runs the default query. .help for commands.".dimmed()
            );

            let mut repl = Repl::new(&config.database)?;
            let result = conn.run(&mut repl, &mut terminal).await;
            repl.save_history();
            result?;
            println!("{}", "Goodbye!".green());
        }
    }
    Ok(())
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let default = if verbose {
        "pgwire_lite=debug"
    } else {
        "pgwire_lite=warn"
    };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

/// Line editor feeding the connection one command at a time.
struct Repl {
    editor: DefaultEditor,
    prompt: String,
    history: Option<PathBuf>,
}

impl Repl {
    fn new(database: &str) -> anyhow::Result<Self> {
        let mut editor = DefaultEditor::new().context("failed to initialize line editor")?;
        let history = dirs::home_dir().map(|p| p.join(".pgwire_history"));
        if let Some(path) = &history {
            let _ = editor.load_history(path);
        }
        Ok(Self {
            editor,
            prompt: format!("{}=> ", database).cyan().bold().to_string(),
            history,
        })
    }

    fn save_history(&mut self) {
        if let Some(path) = &self.history
            && let Err(e) = self.editor.save_history(path)
        {
            tracing::warn!(error = %e, "could not save history");
        }
    }
}

impl CommandSource for Repl {
    fn next_command(&mut self) -> Option<String> {
        loop {
            // The connection is idle while waiting for input.
            let line = tokio::task::block_in_place(|| self.editor.readline(&self.prompt));
            match line {
                Ok(line) => {
                    let trimmed = line.trim();
                    match trimmed {
                        ".exit" | ".quit" | "\\q" => return None,
                        ".help" | "\\?" => {
                            show_help();
                            continue;
                        }
                        _ => {}
                    }
                    if !trimmed.is_empty() {
                        let _ = self.editor.add_history_entry(trimmed);
                    }
                    return Some(line);
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C".dimmed());
                }
                Err(ReadlineError::Eof) => return None,
                Err(err) => {
                    eprintln!("{} {}", "Error:".red(), err);
                    return None;
                }
            }
        }
    }
}

fn show_help() {
    println!("{}", "Commands:".cyan().bold());
    println!("  {}  - Exit", ".exit, \\q".yellow());
    println!("  {}  - Show this help", ".help, \\?".yellow());
    println!("  {}  - Run the default query", "<empty>".yellow());
    println!();
    println!("Anything else is sent to the server as a simple query.");
}

/// Renders events to stdout/stderr.
struct Terminal {
    format: OutputFormat,
    errors: usize,
}

impl Terminal {
    fn new(format: OutputFormat) -> Self {
        Self { format, errors: 0 }
    }
}

impl EventSink for Terminal {
    fn on_event(&mut self, event: &Event) {
        match event {
            Event::Row(row) if self.format == OutputFormat::Plain => println!("{}", row.render()),
            Event::CommandComplete { tag, result } => {
                match (self.format, result) {
                    (OutputFormat::Table, Some(set)) => print_table(set),
                    (OutputFormat::Json, Some(set)) => println!(
                        "{}",
                        serde_json::to_string_pretty(&set.to_json()).unwrap_or_default()
                    ),
                    _ => {}
                }
                if self.format == OutputFormat::Json {
                    eprintln!("{}", tag.dimmed());
                } else {
                    println!("{}", tag.dimmed());
                }
            }
            Event::EmptyQuery => println!("{}", "(empty query)".dimmed()),
            Event::ServerError(fields) => {
                self.errors += 1;
                print_server_error(fields);
            }
            Event::Notice(fields) => {
                eprintln!("{} {}", format!("{}:", fields.severity()).yellow(), fields.message());
            }
            Event::DecodeError { tag, message } => {
                eprintln!("{} discarded '{}' frame: {}", "warning:".yellow(), tag, message);
            }
            _ => {}
        }
    }

    fn on_error(&mut self, error: &PgError) {
        self.errors += 1;
        eprintln!("{} {}", "Error:".red().bold(), error);
    }
}

fn print_server_error(fields: &ErrorFields) {
    eprintln!("{}", fields.to_string().red().bold());
    if let Some(detail) = fields.detail() {
        eprintln!("{} {}", "DETAIL:".red(), detail);
    }
    if let Some(hint) = fields.hint() {
        eprintln!("{} {}", "HINT:".yellow(), hint);
    }
}

fn print_table(set: &ResultSet) {
    let cell = |v: &Option<String>| v.clone().unwrap_or_else(|| "NULL".to_string());

    let mut widths: Vec<usize> = set.columns.iter().map(|c| c.name.len()).collect();
    for row in &set.rows {
        for (width, value) in widths.iter_mut().zip(&row.values) {
            *width = (*width).max(cell(value).chars().count());
        }
    }

    let header: Vec<String> = set
        .columns
        .iter()
        .zip(&widths)
        .map(|(c, w)| format!("{:w$}", c.name, w = *w))
        .collect();
    println!("{}", header.join(" │ ").white().bold());

    let sep: Vec<String> = widths.iter().map(|w| "─".repeat(*w)).collect();
    println!("{}", sep.join("─┼─").dimmed());

    for row in &set.rows {
        let cells: Vec<String> = row
            .values
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!("{:w$}", cell(v), w = *w))
            .collect();
        println!("{}", cells.join(" │ "));
    }

    println!();
    println!("{} row(s) returned", set.rows.len().to_string().cyan());
}
