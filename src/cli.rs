//! Kommandozeile und Logging-Konfiguration

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Duplex voice streaming client for speech agent endpoints
#[derive(Parser, Debug)]
#[command(name = "voice-client")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Base WebSocket URL of the speech endpoint (ws:// or wss://)
    #[arg(short, long, env = "VOICE_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Increase logging verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Log-Level für die eigenen Module
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "error";
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Baut den Log-Filter
///
/// Ohne `RUST_LOG` gilt global `warn` und `info` (bzw. `-v`/`-q`) für die
/// eigenen Module. Ein gesetztes `RUST_LOG` wird vollständig übernommen; nur
/// explizite `-v`/`-q` Flags überschreiben dann die eigenen Module.
pub fn build_filter(args: &Args, rust_log: Option<&str>) -> EnvFilter {
    let mut filter = match rust_log {
        Some(directives) => EnvFilter::try_new(directives).unwrap_or_else(|e| {
            eprintln!("Ignoring invalid {}: {}", EnvFilter::DEFAULT_ENV, e);
            EnvFilter::new("warn")
        }),
        None => EnvFilter::new("warn"),
    };

    if rust_log.is_some() && args.verbose == 0 && !args.quiet {
        return filter;
    }

    for target in ["voice_client", "voice_client_lib"] {
        match format!("{}={}", target, args.log_level()).parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Invalid log directive for {}: {}", target, e),
        }
    }
    filter
}

/// Initialisiert tracing
pub fn init_logging(args: &Args) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty());
    let filter = build_filter(args, rust_log.as_deref());

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
