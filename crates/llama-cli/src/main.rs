use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};
use llama_cli::{
    embed, format_vector, generate_streaming, open_session, overrides, tokenize, CliError, LoadOptions, ModelInfo,
};
use llama_runtime::ReferenceEngine;
use tracing::Level;

/// llama-bridge: drive a single inference session from the command line
#[derive(Parser)]
#[command(name = "llama-cli", version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Session configuration file (JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Generate text from a prompt, streaming it to stdout.
    Generate {
        /// Model manifest to load.
        #[arg(short, long)]
        model: PathBuf,

        /// Input prompt text.
        #[arg(short, long)]
        prompt: String,

        /// Maximum number of tokens to generate (0 = session default).
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Sampling temperature (0 = greedy, negative = session default).
        #[arg(short, long, allow_negative_numbers = true)]
        temperature: Option<f32>,

        /// Context window in tokens.
        #[arg(long)]
        ctx: Option<usize>,

        /// Worker threads for decoding.
        #[arg(long)]
        threads: Option<usize>,

        /// Stop generation after this many milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Print the normalized embedding of a text.
    Embed {
        #[arg(short, long)]
        model: PathBuf,

        #[arg(long)]
        text: String,
    },

    /// Print the token ids of a text.
    Tokenize {
        #[arg(short, long)]
        model: PathBuf,

        #[arg(long)]
        text: String,

        /// Prepend the beginning-of-sequence token.
        #[arg(long)]
        bos: bool,
    },

    /// Print model and context details.
    Info {
        #[arg(short, long)]
        model: PathBuf,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<(), CliError> {
    let load = |model: PathBuf, ctx: Option<usize>, threads: Option<usize>| LoadOptions {
        model,
        config: cli.config.clone(),
        context_size: ctx,
        thread_count: threads,
    };

    match cli.command {
        Command::Generate {
            model,
            prompt,
            max_tokens,
            temperature,
            ctx,
            threads,
            timeout_ms,
        } => {
            let session = Arc::new(open_session(ReferenceEngine::new(), &load(model, ctx, threads))?);
            let stdout = std::io::stdout();
            let generation = generate_streaming(
                session,
                &prompt,
                overrides(max_tokens, temperature),
                timeout_ms.map(Duration::from_millis),
                |text| {
                    let mut out = stdout.lock();
                    let _ = out.write_all(text.as_bytes());
                    let _ = out.flush();
                },
            )?;
            println!();
            eprintln!("[{}]", generation.metrics);
        }
        Command::Embed { model, text } => {
            let session = open_session(ReferenceEngine::new(), &load(model, None, None))?;
            println!("{}", format_vector(&embed(&session, &text)?));
        }
        Command::Tokenize { model, text, bos } => {
            let session = open_session(ReferenceEngine::new(), &load(model, None, None))?;
            let ids: Vec<String> = tokenize(&session, &text, bos)?.iter().map(|t| t.to_string()).collect();
            println!("{}", ids.join(" "));
        }
        Command::Info { model } => {
            let session = open_session(ReferenceEngine::new(), &load(model.clone(), None, None))?;
            println!("{}", ModelInfo::collect(&session, &model));
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
