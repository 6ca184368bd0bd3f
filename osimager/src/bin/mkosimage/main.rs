/*!
`mkosimage` builds a VM image for a `<platform>/<location>/<spec>` target.

Resolution, template substitution, and Packer supervision all live in the
`osimager` library; this binary parses arguments, wires up settings and the
spec index, and streams the resulting build's output to the terminal.

Exit codes: 0 success, 1 configuration/resolution error, 2 missing required
file, 3 credential failure, 4 build failure, 5 cancelled, 6 timed out.
*/

#![deny(rust_2018_idioms)]

use clap::Parser;
use osimager::assembly::{self, AssemblyOptions, BuildTarget};
use osimager::creds;
use osimager::events::EventKind;
use osimager::index::SpecIndex;
use osimager::orchestrator::{BuildRequest, BuildState, Orchestrator};
use osimager_config::Settings;
use simplelog::{ColorChoice, Config as LogConfig, LevelFilter, TermLogger, TerminalMode};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

/// Builds OS images by driving Packer with declaratively composed
/// configuration.
#[derive(Debug, Parser)]
#[clap(version, about)]
struct Args {
    /// How much detail to log; from least to most: ERROR, WARN, INFO, DEBUG, TRACE
    #[clap(long, global = true, default_value = "INFO")]
    log_level: LevelFilter,

    /// Print the spec index and exit
    #[clap(long, visible_alias = "avail")]
    list: bool,

    /// Print the available platforms and exit
    #[clap(long)]
    list_platforms: bool,

    /// Resolve the target and print its defs as key=value lines
    #[clap(long)]
    list_defs: bool,

    /// Resolve and print the intended Packer invocation without running it
    #[clap(long)]
    dry: bool,

    /// Dump resolved defs as JSON and exit
    #[clap(long)]
    dump_defs: bool,

    /// Dump the assembled Packer document as JSON and exit
    #[clap(long)]
    dump_config: bool,

    /// Override defs: key=value[,key=value...]; may be repeated
    #[clap(long)]
    define: Vec<String>,

    /// Keep the build workspace after the build terminates
    #[clap(long)]
    keep: bool,

    /// Use this directory for the build workspace
    #[clap(long)]
    temp: Option<PathBuf>,

    /// Pass -force to Packer
    #[clap(long)]
    force: bool,

    /// Pass -debug to Packer and enable PACKER_LOG
    #[clap(long)]
    debug: bool,

    /// Shorthand for --log-level DEBUG
    #[clap(long)]
    verbose: bool,

    /// Only use ISO images already present on local disk
    #[clap(long)]
    local_only: bool,

    /// Pass -on-error=<mode> to Packer
    #[clap(long = "on_error")]
    on_error: Option<String>,

    /// Use this FQDN instead of deriving one from the name and domain
    #[clap(long)]
    fqdn: Option<String>,

    /// Pass -timestamp-ui to Packer
    #[clap(long)]
    timestamp: bool,

    /// Override Packer user variables: key=value; may be repeated
    #[clap(long = "set")]
    set: Vec<String>,

    /// Queue priority; higher runs first
    #[clap(long, default_value_t = 0)]
    priority: i64,

    /// Per-build timeout in seconds
    #[clap(long)]
    timeout: Option<u64>,

    /// The build target: <platform>/<location>/<spec>
    target: Option<String>,

    /// Instance name; defaults to the spec key
    name: Option<String>,

    /// Instance IP address; resolved from DNS when omitted
    ip: Option<String>,
}

fn main() {
    let args = Args::parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        args.log_level
    };
    // TermLogger sends errors to stderr and anything less to stdout.
    if TermLogger::init(
        log_level,
        LogConfig::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .is_err()
    {
        eprintln!("Failed to initialize logger");
    }

    let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
    let code = rt.block_on(run(args));
    process::exit(code);
}

async fn run(args: Args) -> i32 {
    let mut settings = match Settings::from_user_dir() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };
    if let Some(temp) = &args.temp {
        settings.temp_dir = Some(temp.clone());
    }

    let index = match SpecIndex::load_or_rebuild(
        &settings.data_dir,
        &settings.user_dir,
        &settings.iso_dir(),
    ) {
        Ok(index) => index,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

    if args.list {
        print_index(&index);
        return 0;
    }
    if args.list_platforms {
        return print_platforms(&settings);
    }

    let target: BuildTarget = match args.target.as_deref().map(str::parse) {
        Some(Ok(target)) => target,
        Some(Err(e)) => {
            eprintln!("{}", e);
            return 1;
        }
        None => {
            eprintln!("A build target is required; see --help");
            return 1;
        }
    };

    let options = AssemblyOptions {
        name: args.name.clone(),
        ip: args.ip.clone(),
        defines: parse_pairs(&args.define),
        variables: parse_pairs(&args.set),
        fqdn: args.fqdn.clone(),
        local_only: args.local_only,
        workspace: None,
        reprovision_host: None,
    };

    // Diagnostic paths resolve without dispatching a build.
    if args.list_defs || args.dump_defs || args.dump_config || args.dry {
        return resolve_and_print(&args, &settings, &index, &target, &options);
    }

    let creds = match creds::provider_from_settings(&settings) {
        Ok(creds) => creds,
        Err(e) => {
            eprintln!("{}", e);
            return 3;
        }
    };

    let mut request = BuildRequest::new(target);
    request.options = options;
    request.priority = args.priority;
    request.timeout = args.timeout.map(Duration::from_secs);
    request.keep_workspace = args.keep;
    request.debug = args.debug;
    request.force = args.force;
    request.on_error = args.on_error.clone();
    request.timestamp_ui = args.timestamp;

    let orchestrator = Orchestrator::start(settings, index, creds);
    let submitted = match orchestrator.submit(request) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

    stream_build(&orchestrator, &submitted.id).await
}

/// Follows one build to termination, echoing its log events, and maps the
/// terminal state to an exit code.  Ctrl-C requests cancellation and keeps
/// following; the orchestrator owns the kill sequence.
async fn stream_build(orchestrator: &Orchestrator, id: &str) -> i32 {
    let (snapshot, mut subscription) = match orchestrator.subscribe_build(id) {
        Ok(subscribed) => subscribed,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };
    log::info!("Following build {} ({})", snapshot.id, snapshot.target);

    loop {
        tokio::select! {
            event = subscription.rx.recv() => {
                let event = match event {
                    Some(event) => event,
                    None => break,
                };
                match event.kind {
                    EventKind::Log => {
                        if let Some(message) = event.data.get("message").and_then(|m| m.as_str()) {
                            println!("{}", message);
                        }
                    }
                    EventKind::Completed
                    | EventKind::Failed
                    | EventKind::Cancelled => break,
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::warn!("Interrupt received; cancelling build");
                let _ = orchestrator.cancel(id);
            }
        }
    }

    let finished = match orchestrator.get(id) {
        Some(snapshot) => snapshot,
        None => return 1,
    };
    match finished.state {
        BuildState::Completed => {
            log::info!("Build completed");
            0
        }
        BuildState::Failed => {
            if let Some(message) = &finished.error_message {
                eprintln!("{}", message);
            }
            finished.error_exit_code.unwrap_or(4)
        }
        state => {
            if let Some(message) = &finished.error_message {
                eprintln!("{}", message);
            }
            state.exit_code()
        }
    }
}

/// Handles --list-defs, --dump-defs, --dump-config, and --dry.
fn resolve_and_print(
    args: &Args,
    settings: &Settings,
    index: &SpecIndex,
    target: &BuildTarget,
    options: &AssemblyOptions,
) -> i32 {
    let creds = match creds::provider_from_settings(settings) {
        Ok(creds) => creds,
        Err(e) => {
            eprintln!("{}", e);
            return 3;
        }
    };
    let assembled = match assembly::assemble(settings, index, target, options, creds.as_deref()) {
        Ok(assembled) => assembled,
        Err(e) => {
            eprintln!("{}", e);
            return e.exit_code();
        }
    };

    if args.list_defs {
        for (key, value) in &assembled.defs {
            println!("{}={}", key, value);
        }
        return 0;
    }
    if args.dump_defs {
        match serde_json::to_string_pretty(&assembled.defs) {
            Ok(rendered) => println!("{}", rendered),
            Err(e) => {
                eprintln!("{}", e);
                return 1;
            }
        }
        return 0;
    }
    if args.dump_config {
        match serde_json::to_string_pretty(&assembled.document) {
            Ok(rendered) => println!("{}", rendered),
            Err(e) => {
                eprintln!("{}", e);
                return 1;
            }
        }
        return 0;
    }

    // --dry: show what would run.
    let document_path = assembled.workspace.join(format!("{}.json", assembled.name));
    let mut invocation = vec!["packer".to_string(), "build".to_string()];
    if args.timestamp {
        invocation.push("-timestamp-ui".to_string());
    }
    if let Some(mode) = &args.on_error {
        invocation.push(format!("-on-error={}", mode));
    }
    if args.force {
        invocation.push("-force".to_string());
    }
    if args.debug {
        invocation.push("-debug".to_string());
    }
    invocation.push(document_path.display().to_string());
    println!("{}", invocation.join(" "));
    0
}

fn print_index(index: &SpecIndex) {
    println!("{:<40} {:<12} {:<10} {:<8} {}", "KEY", "DIST", "VERSION", "ARCH", "ISO");
    for entry in index.entries() {
        println!(
            "{:<40} {:<12} {:<10} {:<8} {}",
            entry.key,
            entry.dist,
            entry.version,
            entry.arch,
            if entry.iso_local { "local" } else { "remote" }
        );
    }
}

fn print_platforms(settings: &Settings) -> i32 {
    let dir = settings.data_dir.join("platforms");
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!("Failed to read '{}': {}", dir.display(), e);
            return 1;
        }
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .map(|ext| ext == "json" || ext == "toml")
                .unwrap_or(false)
        })
        .filter_map(|path| path.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
        .collect();
    names.sort();
    names.dedup();
    for name in names {
        println!("{}", name);
    }
    0
}

/// Parses repeated `key=value[,key=value...]` arguments.
fn parse_pairs(raw: &[String]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for chunk in raw {
        for item in chunk.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            match item.split_once('=') {
                Some((key, value)) => pairs.push((key.to_string(), value.to_string())),
                None => log::warn!("Ignoring malformed define '{}'", item),
            }
        }
    }
    pairs
}

#[cfg(test)]
mod test {
    use super::parse_pairs;

    #[test]
    fn pairs_split_on_commas_and_repeats() {
        let raw = vec![
            "cpu_cores=8,memory_mb=4096".to_string(),
            "thin_disk=false".to_string(),
        ];
        assert_eq!(
            parse_pairs(&raw),
            [
                ("cpu_cores".to_string(), "8".to_string()),
                ("memory_mb".to_string(), "4096".to_string()),
                ("thin_disk".to_string(), "false".to_string()),
            ]
        );
    }

    #[test]
    fn malformed_pairs_are_skipped() {
        assert_eq!(parse_pairs(&["novalue".to_string()]), []);
    }
}
