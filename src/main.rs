// Porter CLI - fleet task execution over SSH

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use tracing_subscriber::EnvFilter;

use porter::executor::Connector;
use porter::guard::CommandGuard;
use porter::inventory::{Inventory, MachineStore};
use porter::logstream::{self, LogCallback, LogStream};
use porter::orchestrator::{CommandRequest, ExecuteRequest, ExecutionStatus, Orchestrator};
use porter::output::{
    create_event_channel, suggest_fix, CommandResponse, OutputFormat, PorterError, TerminalOutput,
};
use porter::transfer::UploadOptions;
use porter::PorterConfig;

#[derive(Parser)]
#[command(
    name = "porter",
    about = "Fleet task execution over SSH",
    version,
    disable_colored_help = true,
    term_width = 0,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output (streams remote output, debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode - only show errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    output_format: String,

    /// Config file (defaults to $PORTER_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Machine inventory file
    #[arg(short, long, global = true)]
    inventory: Option<PathBuf>,

    /// Comma-separated [user@]host[:port] list (alternative to inventory file)
    #[arg(short = 'H', long, global = true)]
    hosts: Option<String>,

    /// SSH user for machines that do not set one
    #[arg(short, long, global = true)]
    user: Option<String>,

    /// SSH private key
    #[arg(short = 'k', long, global = true)]
    private_key: Option<String>,

    /// Prompt for the SSH password
    #[arg(long, global = true)]
    ask_pass: bool,
}

#[derive(Subcommand)]
#[command(disable_colored_help = true)]
enum Commands {
    /// Deploy and run a script on machines
    Run {
        /// Script to run; its directory (and a sibling lib/) is shipped along
        script: PathBuf,

        /// Machine ids (default: every machine in the inventory)
        #[arg(short, long, value_delimiter = ',')]
        machines: Vec<String>,

        /// Return control while workers run; Ctrl-C cancels the execution
        #[arg(long = "async")]
        run_async: bool,

        /// Arguments passed to the script
        #[arg(last = true)]
        flags: Vec<String>,
    },

    /// Run one ad-hoc command on a machine
    Exec {
        machine: String,
        command: String,

        /// Confirm a command flagged as dangerous
        #[arg(short = 'y', long)]
        yes: bool,

        /// Skip validation and the danger check
        #[arg(long)]
        skip_validate: bool,

        #[arg(short, long)]
        sudo: bool,
    },

    /// Follow logs on a machine until Ctrl-C
    Logs {
        machine: String,

        /// systemd unit (journalctl)
        #[arg(long)]
        unit: Option<String>,

        /// Files to tail
        #[arg(short, long)]
        file: Vec<String>,

        /// Docker container
        #[arg(long)]
        container: Option<String>,

        /// docker compose project directory
        #[arg(long)]
        compose: Option<String>,

        /// Service within the compose project
        #[arg(long, requires = "compose")]
        service: Option<String>,

        /// Arbitrary follow command
        #[arg(long)]
        command: Option<String>,

        /// Read files with sudo
        #[arg(short, long)]
        sudo: bool,

        /// Backlog lines
        #[arg(short = 'n', long)]
        lines: Option<usize>,
    },

    /// Upload one file to a machine
    Upload {
        machine: String,
        local: PathBuf,
        remote: String,

        /// Octal mode, e.g. 755
        #[arg(long)]
        mode: Option<String>,

        #[arg(long)]
        owner: Option<String>,

        /// Create missing parent directories
        #[arg(short = 'p', long)]
        create_dirs: bool,

        /// Verify the remote copy by SHA-256
        #[arg(long)]
        verify: bool,

        #[arg(short, long)]
        sudo: bool,
    },

    /// Validate a command and report whether it needs confirmation
    Check { command: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "porter=debug" } else { "porter=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{:#}", e);
            if let Some(hint) = e.downcast_ref::<PorterError>().and_then(suggest_fix) {
                eprintln!("{} {}", "hint:".yellow(), hint);
            }
            std::process::exit(1);
        }
    }
}

/// Everything a subcommand needs, resolved from flags and config
struct App {
    config: PorterConfig,
    inventory: Arc<Inventory>,
    connector: Arc<dyn Connector>,
    format: OutputFormat,
    terminal: Arc<TerminalOutput>,
}

impl App {
    fn new(cli: &Cli) -> Result<Self> {
        let format = OutputFormat::from_str(&cli.output_format).unwrap_or_else(|e| {
            eprintln!("{}. Using 'text'.", e);
            OutputFormat::Text
        });
        let config = PorterConfig::load(cli.config.as_deref())?;

        let inventory = match (&cli.inventory, &cli.hosts) {
            (Some(path), _) => Inventory::from_file(path)?,
            (None, Some(hosts)) => Inventory::from_targets(hosts)?,
            (None, None) => bail!("No machines: pass --inventory or --hosts"),
        };

        let mut pool = config.connection_pool();
        if let Some(user) = &cli.user {
            pool = pool.with_default_user(user.clone());
        }
        if let Some(key) = &cli.private_key {
            pool = pool.with_private_key(key.clone());
        }
        if cli.ask_pass {
            pool = pool.with_password(prompt_password("SSH password: ")?);
        }

        Ok(App {
            config,
            inventory: Arc::new(inventory),
            connector: Arc::new(pool),
            format,
            terminal: Arc::new(TerminalOutput::new(cli.verbose, cli.quiet)),
        })
    }

    fn orchestrator(&self) -> Result<Orchestrator> {
        Ok(Orchestrator::new(self.connector.clone(), self.inventory.clone())
            .with_rate_limiter(self.config.rate_limiter())
            .with_guard(self.config.command_guard()?)
            .with_executor_config(self.config.executor_config())
            .with_deploy(self.config.deploy.clone()))
    }

    fn json(&self) -> bool {
        self.format == OutputFormat::Json
    }
}

async fn run(cli: Cli) -> Result<i32> {
    if let Commands::Check { command } = &cli.command {
        return check_command(cli.config.as_deref(), command);
    }

    let ctx = App::new(&cli)?;
    match cli.command {
        Commands::Run {
            script,
            machines,
            run_async,
            flags,
        } => run_script(&ctx, script, machines, run_async, flags).await,
        Commands::Exec {
            machine,
            command,
            yes,
            skip_validate,
            sudo,
        } => {
            let req = CommandRequest {
                machine_id: machine,
                command,
                confirmed: yes,
                skip_validate,
                sudo,
            };
            exec_command(&ctx, req).await
        }
        Commands::Logs {
            machine,
            unit,
            file,
            container,
            compose,
            service,
            command,
            sudo,
            lines,
        } => {
            let source = LogSource::pick(unit, file, container, compose, service, command, sudo)?;
            follow_logs(&ctx, &machine, source, lines).await
        }
        Commands::Upload {
            machine,
            local,
            remote,
            mode,
            owner,
            create_dirs,
            verify,
            sudo,
        } => {
            let opts = UploadOptions {
                mode,
                owner,
                create_dirs,
                verify,
                sudo,
            };
            upload(&ctx, &machine, &local, &remote, &opts).await
        }
        Commands::Check { command } => check_command(cli.config.as_deref(), &command),
    }
}

async fn run_script(
    ctx: &App,
    script: PathBuf,
    machines: Vec<String>,
    run_async: bool,
    flags: Vec<String>,
) -> Result<i32> {
    let machine_ids = if machines.is_empty() {
        ctx.inventory.ids()
    } else {
        machines
    };
    let req = ExecuteRequest {
        machine_ids,
        script_path: script.to_string_lossy().into_owned(),
        flags,
    };

    let (events, rx) = create_event_channel();
    let terminal = ctx.terminal.clone();
    let drain = tokio::spawn(async move { terminal.drain(rx).await });
    let orch = ctx.orchestrator()?.with_events(events);

    if !ctx.json() {
        ctx.terminal
            .print_header("run", &req.script_path, req.machine_ids.len());
    }

    let record = if run_async {
        let started = orch.execute_async(&req)?;
        if !ctx.json() {
            eprintln!("{} {}", "execution".dimmed(), started.id.cyan());
        }
        wait_or_cancel(&orch, &started.id).await?
    } else {
        orch.execute(&req).await?
    };

    drop(orch);
    let _ = drain.await;

    if ctx.json() {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        ctx.terminal.print_record(&record);
    }
    Ok(if record.status == ExecutionStatus::Completed { 0 } else { 2 })
}

/// Poll until the execution finishes; the first Ctrl-C cancels it
async fn wait_or_cancel(
    orch: &Orchestrator,
    id: &str,
) -> Result<porter::orchestrator::ExecutionRecord> {
    let mut cancelled = false;
    loop {
        let record = orch
            .tracker()
            .get(id)
            .with_context(|| format!("execution {} vanished", id))?;
        if record.finished_at.is_some() {
            return Ok(record);
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !cancelled => {
                eprintln!("{}", "Cancelling; waiting for machines to wind down".yellow());
                orch.cancel(id)?;
                cancelled = true;
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }
    }
}

async fn exec_command(ctx: &App, req: CommandRequest) -> Result<i32> {
    let orch = ctx.orchestrator()?;
    let result = orch.run_command(&req).await;

    if ctx.json() {
        let response = CommandResponse::from(result);
        println!("{}", response.to_json());
        return Ok(if response.success() { 0 } else { 1 });
    }

    let out = result?;
    ctx.terminal.print_command_output(&out);
    Ok(out.exit_code)
}

enum LogSource {
    Journal(String),
    Files { paths: Vec<String>, sudo: bool },
    Container(String),
    Compose { dir: String, service: Option<String> },
    Custom(String),
}

impl LogSource {
    fn pick(
        unit: Option<String>,
        files: Vec<String>,
        container: Option<String>,
        compose: Option<String>,
        service: Option<String>,
        command: Option<String>,
        sudo: bool,
    ) -> Result<Self> {
        let mut picked = Vec::new();
        if let Some(unit) = unit {
            picked.push(LogSource::Journal(unit));
        }
        if !files.is_empty() {
            picked.push(LogSource::Files { paths: files, sudo });
        }
        if let Some(container) = container {
            picked.push(LogSource::Container(container));
        }
        if let Some(dir) = compose {
            picked.push(LogSource::Compose { dir, service });
        }
        if let Some(cmd) = command {
            picked.push(LogSource::Custom(cmd));
        }

        match picked.len() {
            1 => Ok(picked.remove(0)),
            0 => bail!("Pick a log source: --unit, --file, --container, --compose or --command"),
            _ => bail!("Pick exactly one log source"),
        }
    }
}

async fn follow_logs(
    ctx: &App,
    machine: &str,
    source: LogSource,
    lines: Option<usize>,
) -> Result<i32> {
    let host = ctx
        .inventory
        .get(machine)
        .with_context(|| format!("machine not found: {}", machine))?;
    let conn = ctx.connector.connect(&host).await?;

    let mut opts = ctx.config.stream_options();
    if let Some(lines) = lines {
        opts.lines = lines;
    }

    let json = ctx.json();
    let callback: LogCallback = Arc::new(move |source: &str, line: &str| {
        if json {
            println!(
                "{}",
                serde_json::json!({ "source": source, "line": line })
            );
        } else if source.ends_with(":stderr") {
            println!("{} {}", format!("[{}]", source).dimmed(), line.red());
        } else {
            println!("{} {}", format!("[{}]", source).dimmed(), line);
        }
    });

    let stream: LogStream = match source {
        LogSource::Journal(unit) => logstream::journal_follow(conn, &unit, callback, &opts),
        LogSource::Files { paths, sudo: true } if paths.len() == 1 => {
            logstream::tail_follow_with_sudo(conn, &paths[0], callback, &opts)
        }
        LogSource::Files { paths, .. } if paths.len() == 1 => {
            logstream::tail_follow(conn, &paths[0], callback, &opts)
        }
        LogSource::Files { paths, .. } => {
            logstream::tail_follow_multiple(conn, &paths, callback, &opts)
        }
        LogSource::Container(name) => logstream::docker_logs(conn, &name, callback, &opts),
        LogSource::Compose { dir, service } => {
            logstream::docker_compose_logs(conn, &dir, service.as_deref(), callback, &opts)
        }
        LogSource::Custom(cmd) => {
            logstream::custom_log_stream(conn, "custom", &cmd, callback, &opts)
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => stream.stop().await,
        _ = stream.done() => {}
    }
    stream.wait().await?;
    Ok(0)
}

async fn upload(
    ctx: &App,
    machine: &str,
    local: &Path,
    remote: &str,
    opts: &UploadOptions,
) -> Result<i32> {
    let orch = ctx.orchestrator()?;
    let report = orch.upload_file(machine, local, remote, opts).await?;

    if ctx.json() {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        ctx.terminal.print_upload(&report);
    }
    Ok(if report.verified == Some(false) { 1 } else { 0 })
}

fn check_command(config_path: Option<&Path>, command: &str) -> Result<i32> {
    let config = PorterConfig::load(config_path)?;
    let guard: CommandGuard = config.command_guard()?;

    let normalized = match guard.validate(command) {
        Ok(normalized) => normalized,
        Err(e) => {
            println!("{} {}", "REJECTED".red().bold(), e.plain_message());
            return Ok(1);
        }
    };
    match guard.is_dangerous(&normalized) {
        Some(pattern) => {
            println!(
                "{} matches '{}'; run with --yes to confirm",
                "DANGEROUS".yellow().bold(),
                pattern
            );
            Ok(2)
        }
        None => {
            println!("{} {}", "OK".green().bold(), normalized);
            Ok(0)
        }
    }
}

fn prompt_password(prompt: &str) -> Result<String> {
    // Print prompt to stderr so it appears even with redirected stdout
    eprint!("{}", prompt.cyan());
    io::stderr().flush().ok();

    let password = rpassword::read_password().context("Failed to read password")?;
    let password = password.trim().to_string();
    eprintln!();

    if password.is_empty() {
        bail!("Password cannot be empty");
    }
    Ok(password)
}
