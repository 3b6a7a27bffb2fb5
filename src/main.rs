use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use engram::search::{SearchFilter, UnifiedSource};
use engram::sync::{SyncOptions, SyncStep};
use engram::Memory;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "engram")]
#[command(version)]
#[command(about = "Project-scoped agent memory: hybrid search over past AI sessions and your code")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the .engram state directory and default config
    Init,

    /// Index new checkpoints (and changed source files) into the store
    Sync {
        /// Skip the source-code indexing phase
        #[arg(long)]
        no_code: bool,
    },

    /// Store a session capture (JSON payload from a file, or stdin with -)
    Capture {
        /// Path to the capture JSON; `-` reads stdin
        #[arg(default_value = "-")]
        input: String,
    },

    /// Search the memory (transcripts + code)
    Search {
        query: String,

        /// Max results
        #[arg(long, short = 'k', default_value_t = 5)]
        top_k: usize,

        /// Restrict to one source: all, transcript, code
        #[arg(long, default_value = "all")]
        source: String,

        /// Only results captured by this agent
        #[arg(long)]
        agent: Option<String>,

        /// Only results touching these files (substring match)
        #[arg(long, num_args = 1..)]
        files: Vec<String>,

        /// Drop results scoring below this
        #[arg(long)]
        min_score: Option<f32>,

        /// Disable the recency/keyword re-ranker
        #[arg(long)]
        no_rerank: bool,

        /// Emit raw JSON instead of the human listing
        #[arg(long)]
        json: bool,
    },

    /// Show a symbol's definition, callers, callees and importers
    Context { symbol: String },

    /// Repository-level code insights (complexity, dead code, hotspots)
    Insights {
        #[arg(long)]
        json: bool,
    },

    /// Store counts and coverage
    Stats,

    /// Drop the stores (both tables unless narrowed)
    Reset {
        /// Only the code table
        #[arg(long)]
        code: bool,
        /// Only the transcript table
        #[arg(long)]
        solutions: bool,
    },
}

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb.set_message(msg.to_string());
    pb
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let root = std::env::current_dir().context("Failed to get current dir")?;

    if matches!(cli.cmd, Command::Init) {
        let mem = Memory::init(&root)?;
        println!(
            "Initialised {} (provider: {}, model: {})",
            mem.workspace().state_dir().display(),
            mem.config().provider,
            mem.config().embedding_model
        );
        return Ok(());
    }

    let mut mem = Memory::open(&root)?;
    let rt = tokio::runtime::Runtime::new()?;

    match cli.cmd {
        Command::Init => unreachable!("handled above"),

        Command::Sync { no_code } => {
            let (tx, mut rx) = mpsc::channel(256);
            let cancel = CancellationToken::new();
            let pb = spinner("starting sync...");

            let report = rt.block_on(async {
                let sync_fut = mem.sync(
                    SyncOptions {
                        code_index: !no_code,
                    },
                    &cancel,
                    &tx,
                );
                tokio::pin!(sync_fut);
                loop {
                    tokio::select! {
                        ev = rx.recv() => {
                            if let Some(ev) = ev {
                                if ev.step != SyncStep::Done {
                                    pb.set_message(format!("{:?}: {}", ev.step, ev.message));
                                }
                            }
                        }
                        result = &mut sync_fut => break result,
                    }
                }
            })?;

            pb.finish_with_message(format!(
                "synced: {} chunks ({} new / {} updated checkpoints), {} code files",
                report.chunks_indexed,
                report.checkpoints_inserted,
                report.checkpoints_upserted,
                report.code_files_indexed
            ));
            for w in &report.warnings {
                eprintln!("warning: {w}");
            }
        }

        Command::Capture { input } => {
            let text = if input == "-" {
                use std::io::Read;
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                std::fs::read_to_string(&input).with_context(|| format!("Failed to read {input}"))?
            };
            let payload: serde_json::Value =
                serde_json::from_str(&text).context("Capture payload is not valid JSON")?;
            let id = mem.capture(&payload)?;
            println!("captured {id} (run `engram sync` to index it)");
        }

        Command::Search {
            query,
            top_k,
            source,
            agent,
            files,
            min_score,
            no_rerank,
            json,
        } => {
            let source = match source.as_str() {
                "transcript" => UnifiedSource::Transcript,
                "code" => UnifiedSource::Code,
                _ => UnifiedSource::All,
            };
            let filter = SearchFilter {
                agent,
                files,
                min_score,
                query_text: None, // set by Memory::search
                rerank: if no_rerank { Some(false) } else { None },
            };
            let results = rt.block_on(mem.search(&query, top_k, source, filter))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                println!("no results");
            } else {
                for (i, r) in results.iter().enumerate() {
                    println!(
                        "{}. [{:.3}] ({}) {}\n   {}",
                        i + 1,
                        r.score,
                        match r.source {
                            engram::search::ResultSource::Transcript => "session",
                            engram::search::ResultSource::Code => "code",
                        },
                        r.headline.replace('\n', " "),
                        r.summary.replace('\n', " "),
                    );
                }
            }
        }

        Command::Context { symbol } => {
            let ctx = mem.symbol_context(&symbol)?;
            println!(
                "{} {} — {}:{}",
                ctx.definition.symbol_type,
                ctx.definition.symbol,
                ctx.definition.path,
                ctx.definition.start_line
            );
            if !ctx.definition.summary.is_empty() {
                println!("  {}", ctx.definition.summary);
            }
            println!("\ncallers ({}):", ctx.callers.len());
            for c in &ctx.callers {
                println!("  {} ({})", c.symbol, c.path);
            }
            println!("callees ({}):", ctx.callees.len());
            for c in &ctx.callees {
                println!("  {c}");
            }
            println!("importers ({}):", ctx.importers.len());
            for c in &ctx.importers {
                println!("  {} ({})", c.symbol, c.path);
            }
        }

        Command::Insights { json } => match mem.code_insights() {
            None => println!("no code index yet — run `engram sync` first"),
            Some(report) => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    println!(
                        "{} symbols across {} files ({:.1} per file, avg complexity {:.1})",
                        report.total_symbols,
                        report.total_files,
                        report.avg_symbols_per_file,
                        report.avg_complexity
                    );
                    println!(
                        "documentation coverage: {:.0}%",
                        report.documentation_coverage * 100.0
                    );
                    println!("\nmost connected:");
                    for c in report.most_connected.iter().take(5) {
                        println!(
                            "  {} ({}) — {} connections",
                            c.symbol, c.path, c.total_connections
                        );
                    }
                    if !report.dead_code.is_empty() {
                        println!("\ndead code ({}):", report.dead_code.len());
                        for id in report.dead_code.iter().take(10) {
                            println!("  {id}");
                        }
                    }
                    if !report.duplicate_clusters.is_empty() {
                        println!("\nduplicate clusters:");
                        for cluster in report.duplicate_clusters.iter().take(5) {
                            println!(
                                "  {:.0}% similar: {}",
                                cluster.similarity * 100.0,
                                cluster.members.join(", ")
                            );
                        }
                    }
                }
            }
        },

        Command::Stats => {
            let stats = mem.stats();
            let code = mem.code_stats();
            println!(
                "transcripts: {} chunks{}",
                stats.records,
                if stats.has_table { "" } else { " (no table)" }
            );
            for (agent, count) in stats.agents.iter().take(5) {
                println!("  {agent}: {count}");
            }
            if !stats.top_files.is_empty() {
                println!("  top files:");
                for (file, count) in stats.top_files.iter().take(5) {
                    println!("    {file} ({count})");
                }
            }
            println!(
                "code: {} symbols in {} files{}",
                code.records,
                code.files,
                if code.has_table { "" } else { " (no table)" }
            );
            for (lang, count) in &code.by_language {
                println!("  {lang}: {count}");
            }
        }

        Command::Reset { code, solutions } => {
            let both = !code && !solutions;
            if code || both {
                mem.reset_code()?;
                println!("dropped code table");
            }
            if solutions || both {
                mem.reset_solutions()?;
                println!("dropped solutions table");
            }
        }
    }

    Ok(())
}
