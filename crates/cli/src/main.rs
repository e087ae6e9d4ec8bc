use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use fleetput_core::config::{
    Settings, load_settings, parse_settings, save_settings, to_toml, validate_settings,
};
use fleetput_core::run_log::{RunKind, start_run_log};
use fleetput_core::{
    APP_NAME, CommandOptions, CommandTarget, Credentials, DEFAULT_PATTERN, DestinationReport,
    DestinationSpec, ErrorKind, MirrorRequest, ParsedSpecs, ProgressEvent, ProgressSink,
    ProtocolConnector, SshShell, TransferOptions, TransferRequest, dispatch_all_with,
    mirror_with, parse_inline, read_list_file, resolve_files, run_on_all, transfer_with,
};
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "fleetput")]
#[command(about = "Push files to FTP/SFTP/SCP/SMB/S3 destinations and run commands over SSH", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    /// Print NDJSON progress events on stdout.
    #[arg(long)]
    events: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct DestList {
    /// Comma-separated destination specs.
    #[arg(long)]
    dests: Option<String>,
    /// File with one destination spec per line.
    #[arg(long)]
    list: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Upload matching files to one destination.
    Upload {
        #[arg(long)]
        dest: String,
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value = DEFAULT_PATTERN)]
        pattern: String,
    },
    /// Upload matching files to every destination of a list.
    Batch {
        #[command(flatten)]
        dests: DestList,
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value = DEFAULT_PATTERN)]
        pattern: String,
        #[arg(long)]
        parallel: Option<u32>,
    },
    /// Recreate a local directory tree on an SFTP destination.
    Mirror {
        #[arg(long)]
        dest: String,
        #[arg(long)]
        dir: PathBuf,
    },
    /// Run one command over SSH on a host or on every host of a list.
    Exec {
        #[arg(long, conflicts_with_all = ["host", "user"])]
        list: Option<PathBuf>,
        #[arg(long, requires = "user")]
        host: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    Specs {
        #[command(subcommand)]
        cmd: SpecsCmd,
    },
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
}

#[derive(Subcommand)]
enum SpecsCmd {
    /// Parse a destination list without connecting.
    Check {
        #[command(flatten)]
        dests: DestList,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
    Set,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(code, message)
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

struct NdjsonProgressSink {
    run_id: String,
}

impl ProgressSink for NdjsonProgressSink {
    fn on_progress(&self, event: ProgressEvent) {
        let line = serde_json::json!({
            "type": "transfer.progress",
            "runId": self.run_id,
            "event": event,
        });
        println!("{line}");
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

struct Context {
    json: bool,
    events: bool,
    config_dir: PathBuf,
    data_dir: PathBuf,
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| std::env::var("FLEETPUT_CONFIG_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_config_dir);
    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var("FLEETPUT_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| config_dir.clone());
    let ctx = Context {
        json: cli.json,
        events: cli.events,
        config_dir,
        data_dir,
    };

    match cli.cmd {
        Command::Upload { dest, dir, pattern } => upload(&ctx, &dest, &dir, &pattern).await,
        Command::Batch {
            dests,
            dir,
            pattern,
            parallel,
        } => batch(&ctx, &dests, &dir, &pattern, parallel).await,
        Command::Mirror { dest, dir } => mirror(&ctx, &dest, dir).await,
        Command::Exec {
            list,
            host,
            user,
            command,
        } => exec(&ctx, list, host, user, &command.join(" ")).await,
        Command::Specs { cmd } => match cmd {
            SpecsCmd::Check { dests } => specs_check(&ctx, &dests),
        },
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&ctx),
            SettingsCmd::Set => settings_set(&ctx),
        },
    }
}

fn load_checked_settings(ctx: &Context) -> Result<Settings, CliError> {
    let settings = load_settings(&ctx.config_dir).map_err(map_core_err)?;
    validate_settings(&settings).map_err(map_core_err)?;
    Ok(settings)
}

fn new_run_id() -> String {
    format!("run_{}", uuid::Uuid::new_v4())
}

/// Cancels `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!(event = "run.interrupted", "run.interrupted");
            token.cancel();
        }
    });
}

fn parse_one(dest: &str) -> Result<DestinationSpec, CliError> {
    DestinationSpec::parse(dest).map_err(map_core_err)
}

fn read_dest_list(dests: &DestList) -> Result<ParsedSpecs, CliError> {
    match (&dests.dests, &dests.list) {
        (Some(inline), _) => Ok(parse_inline(inline)),
        (None, Some(path)) => read_list_file(path).map_err(map_core_err),
        (None, None) => Err(CliError::new("spec.missing", "pass --dests or --list")),
    }
}

fn rejected_json(parsed: &ParsedSpecs) -> serde_json::Value {
    serde_json::Value::Array(
        parsed
            .rejected
            .iter()
            .map(|r| {
                serde_json::json!({
                    "position": r.position,
                    "kind": r.error.kind(),
                    "message": r.error.to_string(),
                })
            })
            .collect(),
    )
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let text =
        serde_json::to_string(value).map_err(|e| CliError::new("output.encode_failed", e.to_string()))?;
    println!("{text}");
    Ok(())
}

fn print_report(report: &DestinationReport) {
    println!(
        "destination={} location={}",
        report.destination,
        report.location.as_deref().unwrap_or("-")
    );
    for notice in &report.notices {
        println!("  notice: {}", notice.message());
    }
    for outcome in &report.outcomes {
        match &outcome.status {
            fleetput_core::TransferStatus::Success => {
                println!("  ok {} ({} bytes)", outcome.file.display(), outcome.bytes_sent)
            }
            fleetput_core::TransferStatus::Failed { kind, message } => {
                println!("  failed {} [{kind}] {message}", outcome.file.display())
            }
        }
    }
    for skipped in &report.not_attempted {
        println!("  not attempted {}", skipped.display());
    }
}

async fn upload(ctx: &Context, dest: &str, dir: &Path, pattern: &str) -> Result<(), CliError> {
    let settings = load_checked_settings(ctx)?;
    let destination = parse_one(dest)?;
    let files = resolve_files(dir, pattern).map_err(map_core_err)?;

    let run_id = new_run_id();
    let run_log = start_run_log(RunKind::Upload, &run_id, &ctx.data_dir)
        .map_err(|e| CliError::new("log.start_failed", e.to_string()))?;
    tracing::info!(
        event = "run.start",
        kind = "upload",
        run_id = %run_id,
        log_path = %run_log.path().display(),
        "run.start"
    );

    let token = CancellationToken::new();
    cancel_on_ctrl_c(&token);
    let sink = NdjsonProgressSink {
        run_id: run_id.clone(),
    };
    let options = TransferOptions {
        cancel: Some(&token),
        progress: if ctx.events { Some(&sink) } else { None },
        connect_timeout: Some(settings.connect_timeout()),
    };

    let connector = ProtocolConnector::new(settings);
    let request = TransferRequest { destination, files };
    let report = transfer_with(&connector, &request, options)
        .await
        .map_err(map_core_err)?;
    tracing::info!(event = "run.finish", kind = "upload", success = report.is_success(), "run.finish");

    if ctx.json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    if report.cancelled {
        return Err(CliError::new("task.cancelled", "upload cancelled")
            .with_details(serde_json::json!({ "destination": report.destination })));
    }
    if !report.is_success() {
        return Err(CliError::retryable("upload.failed", "not every file was uploaded")
            .with_details(serde_json::json!({ "destination": report.destination })));
    }
    Ok(())
}

async fn batch(
    ctx: &Context,
    dests: &DestList,
    dir: &Path,
    pattern: &str,
    parallel: Option<u32>,
) -> Result<(), CliError> {
    let settings = load_checked_settings(ctx)?;
    let parsed = read_dest_list(dests)?;
    if parsed.specs.is_empty() {
        return Err(CliError::new("spec.malformed", "no valid destination in the list")
            .with_details(serde_json::json!({ "rejected": rejected_json(&parsed) })));
    }
    let files = resolve_files(dir, pattern).map_err(map_core_err)?;
    let max_parallel = parallel.unwrap_or(settings.batch.max_parallel).max(1) as usize;

    let run_id = new_run_id();
    let run_log = start_run_log(RunKind::Batch, &run_id, &ctx.data_dir)
        .map_err(|e| CliError::new("log.start_failed", e.to_string()))?;
    tracing::info!(
        event = "run.start",
        kind = "batch",
        run_id = %run_id,
        log_path = %run_log.path().display(),
        destinations = parsed.specs.len(),
        rejected = parsed.rejected.len(),
        "run.start"
    );

    let token = CancellationToken::new();
    cancel_on_ctrl_c(&token);
    let sink = NdjsonProgressSink {
        run_id: run_id.clone(),
    };
    let options = TransferOptions {
        cancel: Some(&token),
        progress: if ctx.events { Some(&sink) } else { None },
        connect_timeout: Some(settings.connect_timeout()),
    };

    let connector = ProtocolConnector::new(settings);
    let entries = dispatch_all_with(&connector, &files, &parsed.specs, options, max_parallel).await;
    let failed = entries.iter().filter(|e| !e.is_success()).count();
    tracing::info!(event = "run.finish", kind = "batch", failed, "run.finish");

    if ctx.json {
        let results: Vec<serde_json::Value> = entries
            .iter()
            .map(|entry| match &entry.result {
                Ok(report) => serde_json::json!({ "ok": report.is_success(), "report": report }),
                Err(e) => serde_json::json!({
                    "ok": false,
                    "destination": entry.destination.label(),
                    "error": { "kind": e.kind(), "message": e.to_string() },
                }),
            })
            .collect();
        print_json(&serde_json::json!({
            "runId": run_id,
            "results": results,
            "rejected": rejected_json(&parsed),
        }))?;
    } else {
        for entry in &entries {
            match &entry.result {
                Ok(report) => print_report(report),
                Err(e) => println!("destination={} failed [{}] {e}", entry.destination.label(), e.kind()),
            }
        }
        for rejected in &parsed.rejected {
            println!("rejected entry {}: {}", rejected.position, rejected.error);
        }
    }

    if failed > 0 || !parsed.rejected.is_empty() {
        return Err(CliError::new(
            "batch.partial_failure",
            format!("{failed} of {} destinations failed", entries.len()),
        )
        .with_details(serde_json::json!({
            "failed": failed,
            "rejected": parsed.rejected.len(),
        })));
    }
    Ok(())
}

async fn mirror(ctx: &Context, dest: &str, dir: PathBuf) -> Result<(), CliError> {
    let settings = load_checked_settings(ctx)?;
    let destination = parse_one(dest)?;

    let run_id = new_run_id();
    let run_log = start_run_log(RunKind::Mirror, &run_id, &ctx.data_dir)
        .map_err(|e| CliError::new("log.start_failed", e.to_string()))?;
    tracing::info!(
        event = "run.start",
        kind = "mirror",
        run_id = %run_id,
        log_path = %run_log.path().display(),
        "run.start"
    );

    let token = CancellationToken::new();
    cancel_on_ctrl_c(&token);
    let sink = NdjsonProgressSink {
        run_id: run_id.clone(),
    };
    let options = TransferOptions {
        cancel: Some(&token),
        progress: if ctx.events { Some(&sink) } else { None },
        connect_timeout: Some(settings.connect_timeout()),
    };

    let connector = ProtocolConnector::new(settings);
    let request = MirrorRequest {
        destination,
        local_root: dir,
    };
    let report = mirror_with(&connector, &request, options)
        .await
        .map_err(map_core_err)?;
    tracing::info!(event = "run.finish", kind = "mirror", complete = report.is_complete(), "run.finish");

    if ctx.json {
        print_json(&report)?;
    } else {
        println!("mirrored into {}", report.remote_root);
        println!(
            "directories created={} failed={}",
            report.dirs_created.len(),
            report.dir_failures.len()
        );
        for failure in &report.dir_failures {
            println!("  mkdir failed {} [{}] {}", failure.remote, failure.kind, failure.message);
        }
        for file in report.files.iter().filter(|f| !f.status.is_success()) {
            println!("  upload failed {}", file.file.display());
        }
    }
    if !report.is_complete() {
        return Err(CliError::new("mirror.partial_failure", "part of the tree was not mirrored"));
    }
    Ok(())
}

fn read_password() -> Result<String, CliError> {
    if let Ok(password) = std::env::var("FLEETPUT_PASSWORD") {
        return Ok(password);
    }
    let mut input = String::new();
    std::io::stdin()
        .read_line(&mut input)
        .map_err(|e| CliError::new("input.read_failed", e.to_string()))?;
    Ok(input.trim_end_matches(['\r', '\n']).to_string())
}

async fn exec(
    ctx: &Context,
    list: Option<PathBuf>,
    host: Option<String>,
    user: Option<String>,
    command: &str,
) -> Result<(), CliError> {
    let settings = load_checked_settings(ctx)?;
    let targets = match (list, host, user) {
        (Some(path), _, _) => {
            let parsed = read_list_file(&path).map_err(map_core_err)?;
            for rejected in &parsed.rejected {
                tracing::warn!(event = "spec.rejected", position = rejected.position, "spec.rejected");
            }
            CommandTarget::from_specs(&parsed.specs)
        }
        (None, Some(host), Some(user)) => {
            vec![CommandTarget::new(host, Credentials::new(user, read_password()?))]
        }
        _ => return Err(CliError::new("exec.no_target", "pass --list or --host with --user")),
    };
    if targets.is_empty() {
        return Err(CliError::new("exec.no_target", "the list has no host entries (object storage entries are skipped)"));
    }

    let run_id = new_run_id();
    let run_log = start_run_log(RunKind::Exec, &run_id, &ctx.data_dir)
        .map_err(|e| CliError::new("log.start_failed", e.to_string()))?;
    tracing::info!(
        event = "run.start",
        kind = "exec",
        run_id = %run_id,
        hosts = targets.len(),
        log_path = %run_log.path().display(),
        "run.start"
    );

    // Ctrl-C skips the host that is running; a second one within a second stops the run.
    let token = CancellationToken::new();
    let interrupt = std::sync::Arc::new(Notify::new());
    {
        let token = token.clone();
        let interrupt = interrupt.clone();
        tokio::spawn(async move {
            let mut last: Option<Instant> = None;
            while tokio::signal::ctrl_c().await.is_ok() {
                if last.is_some_and(|t| t.elapsed() < Duration::from_secs(1)) {
                    token.cancel();
                    return;
                }
                last = Some(Instant::now());
                interrupt.notify_waiters();
            }
        });
    }

    let shell = SshShell::new(settings.ssh.clone());
    let options = CommandOptions {
        cancel: Some(&token),
        interrupt: Some(interrupt.as_ref()),
        connect_timeout: Some(settings.connect_timeout()),
    };
    let runs = run_on_all(&shell, &targets, command, options).await;
    let failed = runs.iter().filter(|r| r.result.is_err()).count();
    tracing::info!(event = "run.finish", kind = "exec", failed, "run.finish");

    if ctx.json {
        let results: Vec<serde_json::Value> = runs
            .iter()
            .map(|run| match &run.result {
                Ok(result) => serde_json::json!({ "ok": true, "result": result }),
                Err(e) => serde_json::json!({
                    "ok": false,
                    "host": run.host,
                    "error": { "kind": e.kind(), "message": e.to_string() },
                }),
            })
            .collect();
        print_json(&serde_json::json!({ "runId": run_id, "results": results }))?;
    } else {
        for run in &runs {
            match &run.result {
                Ok(result) => {
                    println!("== {} (exit {})", run.host, result.exit_status);
                    print!("{}", result.output);
                    if !result.output.ends_with('\n') {
                        println!();
                    }
                }
                Err(e) => println!("== {} failed [{}] {e}", run.host, e.kind()),
            }
        }
    }

    if failed > 0 {
        return Err(CliError::new(
            "exec.partial_failure",
            format!("{failed} of {} hosts failed", runs.len()),
        ));
    }
    Ok(())
}

fn specs_check(ctx: &Context, dests: &DestList) -> Result<(), CliError> {
    let parsed = read_dest_list(dests)?;
    if ctx.json {
        let valid: Vec<String> = parsed.specs.iter().map(DestinationSpec::label).collect();
        print_json(&serde_json::json!({
            "valid": valid,
            "rejected": rejected_json(&parsed),
        }))?;
    } else {
        for spec in &parsed.specs {
            println!("ok {}", spec.label());
        }
        for rejected in &parsed.rejected {
            println!("rejected entry {}: {}", rejected.position, rejected.error);
        }
    }
    if !parsed.rejected.is_empty() {
        return Err(CliError::new(
            "spec.malformed",
            format!("{} malformed entries", parsed.rejected.len()),
        ));
    }
    Ok(())
}

fn settings_get(ctx: &Context) -> Result<(), CliError> {
    let settings = load_settings(&ctx.config_dir).map_err(map_core_err)?;
    if ctx.json {
        print_json(&serde_json::json!({ "settings": settings }))?;
    } else {
        let text = to_toml(&settings).map_err(map_core_err)?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn settings_set(ctx: &Context) -> Result<(), CliError> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let settings =
        parse_settings(&input).map_err(|e| CliError::new("config.invalid", e.to_string()))?;
    validate_settings(&settings).map_err(map_core_err)?;
    save_settings(&ctx.config_dir, &settings).map_err(map_core_err)?;

    if ctx.json {
        print_json(&serde_json::json!({ "settings": settings }))?;
    }
    Ok(())
}

fn default_config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join(APP_NAME)
}

/// Stable error code and retryability for a core error kind.
fn error_code(kind: ErrorKind) -> (&'static str, bool) {
    match kind {
        ErrorKind::InvalidPath => ("path.invalid", false),
        ErrorKind::MalformedSpec => ("spec.malformed", false),
        ErrorKind::Connection => ("dest.unreachable", true),
        ErrorKind::Authentication => ("dest.auth_failed", false),
        ErrorKind::RemotePath => ("dest.remote_path", false),
        ErrorKind::CredentialResolution => ("s3.credentials_missing", false),
        ErrorKind::AccessOrNotFound => ("s3.bucket_unavailable", false),
        ErrorKind::Transfer => ("transfer.failed", true),
        ErrorKind::Command => ("command.failed", false),
        ErrorKind::InvalidConfig => ("config.invalid", false),
        ErrorKind::Io => ("io.failed", true),
        ErrorKind::Cancelled => ("task.cancelled", false),
    }
}

fn map_core_err(e: fleetput_core::Error) -> CliError {
    let kind = e.kind();
    let (code, retryable) = error_code(kind);
    CliError {
        code,
        message: e.to_string(),
        details: serde_json::json!({ "kind": kind }),
        retryable,
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}
