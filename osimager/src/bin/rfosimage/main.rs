/*!
`rfosimage` re-runs provisioning for a `<platform>/<location>/<spec>` target
against an existing host.

The resolution pipeline is the same one `mkosimage` uses; the difference is
that the assembled document's builder is replaced with a `null` builder that
connects to the named host, and no installer files are generated, so Packer
only runs the provisioners.

Exit codes match `mkosimage`: 0 success, 1 configuration/resolution error,
2 missing required file, 3 credential failure, 4 build failure, 5 cancelled,
6 timed out.
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
use std::process;
use std::time::Duration;

/// Reprovisions an existing host using a spec's provisioners.
#[derive(Debug, Parser)]
#[clap(version, about)]
struct Args {
    /// How much detail to log; from least to most: ERROR, WARN, INFO, DEBUG, TRACE
    #[clap(long, global = true, default_value = "INFO")]
    log_level: LevelFilter,

    /// Override defs: key=value[,key=value...]; may be repeated
    #[clap(long)]
    define: Vec<String>,

    /// Override Packer user variables: key=value; may be repeated
    #[clap(long = "set")]
    set: Vec<String>,

    /// Dump the assembled Packer document as JSON and exit
    #[clap(long)]
    dump_config: bool,

    /// Keep the build workspace after the run terminates
    #[clap(long)]
    keep: bool,

    /// Pass -debug to Packer and enable PACKER_LOG
    #[clap(long)]
    debug: bool,

    /// Shorthand for --log-level DEBUG
    #[clap(long)]
    verbose: bool,

    /// Pass -on-error=<mode> to Packer
    #[clap(long = "on_error")]
    on_error: Option<String>,

    /// Pass -timestamp-ui to Packer
    #[clap(long)]
    timestamp: bool,

    /// Per-build timeout in seconds
    #[clap(long)]
    timeout: Option<u64>,

    /// The build target: <platform>/<location>/<spec>
    target: String,

    /// The existing host to provision
    host: String,

    /// The host's IP address; resolved from DNS when omitted
    ip: Option<String>,
}

fn main() {
    let args = Args::parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        args.log_level
    };
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
    let settings = match Settings::from_user_dir() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

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

    let target: BuildTarget = match args.target.parse() {
        Ok(target) => target,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

    let options = AssemblyOptions {
        name: None,
        ip: args.ip.clone(),
        defines: parse_pairs(&args.define),
        variables: parse_pairs(&args.set),
        fqdn: None,
        local_only: false,
        workspace: None,
        reprovision_host: Some(args.host.clone()),
    };

    let creds = match creds::provider_from_settings(&settings) {
        Ok(creds) => creds,
        Err(e) => {
            eprintln!("{}", e);
            return 3;
        }
    };

    if args.dump_config {
        let assembled =
            match assembly::assemble(&settings, &index, &target, &options, creds.as_deref()) {
                Ok(assembled) => assembled,
                Err(e) => {
                    eprintln!("{}", e);
                    return e.exit_code();
                }
            };
        match serde_json::to_string_pretty(&assembled.document) {
            Ok(rendered) => println!("{}", rendered),
            Err(e) => {
                eprintln!("{}", e);
                return 1;
            }
        }
        return 0;
    }

    let mut request = BuildRequest::new(target);
    request.options = options;
    request.timeout = args.timeout.map(Duration::from_secs);
    request.keep_workspace = args.keep;
    request.debug = args.debug;
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
    log::info!("Reprovisioning {} as build {}", args.host, submitted.id);

    stream_build(&orchestrator, &submitted.id).await
}

/// Follows the build to termination, echoing log events; Ctrl-C cancels.
async fn stream_build(orchestrator: &Orchestrator, id: &str) -> i32 {
    let (_, mut subscription) = match orchestrator.subscribe_build(id) {
        Ok(subscribed) => subscribed,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

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
                log::warn!("Interrupt received; cancelling");
                let _ = orchestrator.cancel(id);
            }
        }
    }

    let finished = match orchestrator.get(id) {
        Some(snapshot) => snapshot,
        None => return 1,
    };
    match finished.state {
        BuildState::Completed => 0,
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
