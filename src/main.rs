use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use supplier_mailer::{BatchSender, ProgressEvent};
use supplier_mailer::audit::DEFAULT_TAIL_LINES;

#[derive(Parser, Debug)]
#[command(name = "supplier-mailer")]
#[command(version)]
#[command(about = "Rate-limited batch mailer for supplier attachments")]
struct Cli {
    /// Work root containing project folders, EmailAddress.csv and smtp_config.ini
    #[arg(long, env = "SUPPLIER_MAILER_ROOT", default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send all pending attachments (Ctrl-C cancels)
    Send {
        /// Restrict to these project folders (repeatable)
        #[arg(short, long = "project")]
        projects: Vec<String>,
        /// Print progress events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Count emails a send would produce
    Count {
        #[arg(short, long = "project")]
        projects: Vec<String>,
    },
    /// Show the tail of the audit log
    Log {
        #[arg(short = 'n', long, default_value_t = DEFAULT_TAIL_LINES)]
        lines: usize,
    },
    /// Verify the stored SMTP credentials
    TestSmtp,
    /// Store SMTP username and password
    SetCredentials {
        #[arg(long)]
        username: String,
        #[arg(long, env = "SUPPLIER_MAILER_PASSWORD")]
        password: String,
    },
    /// Replace the email signature with the contents of a file
    SetSignature { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let sender = Arc::new(BatchSender::new(cli.root.clone()));

    match cli.command {
        Command::Send { projects, json } => send(sender, projects, json).await?,
        Command::Count { projects } => {
            println!("{}", sender.count_pending(&projects));
        }
        Command::Log { lines } => {
            println!("{}", sender.load_log(lines));
        }
        Command::TestSmtp => {
            let message = sender.test_smtp_connection().await?;
            println!("{message}");
        }
        Command::SetCredentials { username, password } => {
            let message = sender.save_smtp_credentials(&username, &password)?;
            println!("{message}");
        }
        Command::SetSignature { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let message = sender.save_signature(&content)?;
            println!("{message}");
        }
    }

    Ok(())
}

async fn send(sender: Arc<BatchSender>, projects: Vec<String>, json: bool) -> Result<()> {
    eprintln!("📨 Supplier mailer v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Work root: {}", sender.work_root().display());
    eprintln!("   Pending emails: {}", sender.count_pending(&projects));
    eprintln!("   Press Ctrl-C to cancel.\n");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ProgressEvent>();

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!("Failed to encode progress event: {e}"),
                }
            } else {
                let eta = event
                    .eta_seconds
                    .map(|s| format!("{s:.0}s"))
                    .unwrap_or_else(|| "-".to_string());
                eprintln!(
                    "   [{:>5.1}%] {}/{} {} ({}) ok={} failed={} rate={:.3}/s eta={}",
                    event.percent,
                    event.completed,
                    event.total,
                    event.current_supplier,
                    event.current_project,
                    event.success,
                    event.failed,
                    event.rate,
                    eta,
                );
            }
        }
    });

    let ctrl_c = {
        let sender = Arc::clone(&sender);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n   Cancelling after the current step ...");
                sender.cancel();
            }
        })
    };

    let summary = sender.send_batch(&projects, Some(tx)).await;
    ctrl_c.abort();
    printer.await.ok();

    if json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        eprintln!(
            "\n   Done: success={} failed={} skipped={} cancelled={}",
            summary.success, summary.failed, summary.skipped, summary.cancelled
        );
    }
    Ok(())
}
