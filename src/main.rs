//! Purpose: `pipelog` CLI entry point.
//! Role: Binary crate root; parses args, runs commands, emits JSON diagnostics.
//! Invariants: `read` writes only log bytes to stdout; metadata goes to stderr.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};

mod command_dispatch;
mod serve;

use pipelog::api::{Error, ErrorKind, to_exit_code};
use pipelog::storage_paths::default_storage_dir;

const DEFAULT_MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse_from(std::env::args_os()) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `pipelog --help`."));
            }
        },
    };

    let storage_dir = cli.storage.unwrap_or_else(default_storage_dir);

    command_dispatch::dispatch_command(cli.command, storage_dir)
        .map_err(add_not_found_hint)
        .map_err(add_queue_full_hint)
}

#[derive(Parser)]
#[command(
    name = "pipelog",
    version,
    about = "Append-only storage and streaming reads for build pipeline logs",
    long_about = None,
    after_help = r#"EXAMPLES
  $ pipelog serve --bind 127.0.0.1:8080
  $ make 2>&1 | pipelog append 42/step-1.log
  $ pipelog read 42/step-1.log --lines 20 --backward
  $ pipelog read 42/step-1.log --html > step-1.html

Logs live under <storage>/<pipeline>/step-<n>.log; paths given to `append`
and `read` are relative to the storage directory."#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Storage directory (default: ~/.pipelog/storage)",
        value_hint = ValueHint::DirPath
    )]
    storage: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Run the HTTP server",
        long_about = "Serve log uploads and tail/page reads over HTTP until Ctrl-C or SIGTERM.\nQueued appends are drained before the process exits."
    )]
    Serve(ServeArgs),
    #[command(
        about = "Append stdin to a stored file",
        after_help = "EXAMPLES\n  $ ./build.sh | pipelog append 42/step-1.log\n  $ gzip -c out.txt | pipelog append 42/step-2.log --gzip"
    )]
    Append {
        #[arg(help = "Storage-relative path, e.g. 42/step-1.log")]
        path: String,
        #[arg(long, help = "Stdin is one gzip member; inflate it before writing")]
        gzip: bool,
    },
    #[command(
        about = "Print a byte range or line window of a stored file",
        after_help = "The selected window is described as JSON on stderr:\n  {\"window\":{\"begin\":..,\"end\":..,\"lines\":..,\"remaining\":..,\"position\":..}}"
    )]
    Read(ReadArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[arg(
        long,
        default_value = "127.0.0.1:8080",
        help = "Bind address",
        help_heading = "Connection"
    )]
    bind: String,
    #[arg(
        long,
        default_value_t = 2,
        help = "Append worker count; each owns one shard of paths",
        help_heading = "Storage"
    )]
    appender_threads: usize,
    #[arg(
        long,
        default_value_t = 1024,
        help = "Pending appends per shard before uploads are rejected",
        help_heading = "Storage"
    )]
    queue_capacity: usize,
    #[arg(
        long,
        default_value_t = 8192,
        help = "Read chunk size in bytes",
        help_heading = "Storage"
    )]
    read_chunk_size: usize,
    #[arg(
        long,
        default_value_t = 120_000,
        help = "Per-append timeout in milliseconds",
        help_heading = "Storage"
    )]
    append_timeout_ms: u64,
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_BODY_BYTES,
        help = "Max request body size in bytes",
        help_heading = "Safety"
    )]
    max_body_bytes: u64,
}

#[derive(Args)]
struct ReadArgs {
    #[arg(help = "Storage-relative path, e.g. 42/step-1.log")]
    path: String,
    #[arg(
        long,
        default_value_t = 0,
        help = "Start offset (end offset with --backward; 0 means end of file)"
    )]
    position: u64,
    #[arg(long, value_name = "N", help = "Return at most N lines")]
    lines: Option<u32>,
    #[arg(long, help = "Scan backward from --position")]
    backward: bool,
    #[arg(long, help = "Leave out a trailing line with no newline")]
    lines_only: bool,
    #[arg(long, help = "Render the window as an HTML page")]
    html: bool,
}

fn parse_bind(raw: &str) -> Result<SocketAddr, Error> {
    raw.parse().map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid bind address")
            .with_hint("Use a host:port value like 127.0.0.1:8080.")
    })
}

fn add_not_found_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::NotFound || err.hint().is_some() {
        return err;
    }
    err.with_hint("Paths are relative to --storage; check the pipeline id and step number.")
}

fn add_queue_full_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::QueueFull || err.hint().is_some() {
        return err;
    }
    err.with_hint("The append queue for this path is saturated; retry shortly.")
}

fn emit_json(value: Value, stderr: bool) {
    let json = serde_json::to_string(&value)
        .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    if stderr {
        eprintln!("{json}");
    } else {
        println!("{json}");
    }
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::QueueFull => "queue is full".to_string(),
        ErrorKind::InvalidRange => "invalid range".to_string(),
        ErrorKind::Decode => "decode failed".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(offset) = err.offset() {
        lines.push(format!("offset: {offset}"));
    }
    for cause in error_causes(err) {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

#[cfg(test)]
mod tests {
    use super::{Cli, Command, error_json, error_text, parse_bind};
    use clap::Parser;
    use pipelog::api::{Error, ErrorKind};

    #[test]
    fn read_flags_parse() {
        let cli = Cli::try_parse_from([
            "pipelog",
            "--storage",
            "/tmp/logs",
            "read",
            "42/step-1.log",
            "--lines",
            "20",
            "--backward",
        ])
        .expect("parse");
        assert_eq!(cli.storage.as_deref(), Some(std::path::Path::new("/tmp/logs")));
        let Command::Read(args) = cli.command else {
            panic!("expected read");
        };
        assert_eq!(args.path, "42/step-1.log");
        assert_eq!(args.lines, Some(20));
        assert!(args.backward);
        assert!(!args.html);
        assert_eq!(args.position, 0);
    }

    #[test]
    fn serve_defaults() {
        let cli = Cli::try_parse_from(["pipelog", "serve"]).expect("parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.bind, "127.0.0.1:8080");
        assert_eq!(args.appender_threads, 2);
        assert_eq!(args.queue_capacity, 1024);
        assert_eq!(args.read_chunk_size, 8192);
        assert_eq!(args.append_timeout_ms, 120_000);
        parse_bind(&args.bind).expect("default bind parses");
        assert_eq!(
            parse_bind("nope").expect_err("bad bind").kind(),
            ErrorKind::Usage
        );
    }

    #[test]
    fn error_json_carries_context() {
        let err = Error::new(ErrorKind::InvalidRange)
            .with_message("position is past the end of file")
            .with_path("/tmp/logs/42/step-1.log")
            .with_offset(99)
            .with_source(std::io::Error::other("inner"));
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "InvalidRange");
        assert_eq!(value["error"]["offset"], 99);
        assert_eq!(value["error"]["causes"][0], "inner");
        assert!(error_text(&err).contains("offset: 99"));
    }
}
