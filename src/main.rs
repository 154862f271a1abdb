use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

// Added for tracing file logging
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use lanferry::config::AppConfig;
use lanferry::listing::{self, DirectoryEntry, DirectoryListing};
use lanferry::navigation::{NavigationState, PathStyle, join_child, parent_of};
use lanferry::session::SessionManager;
use lanferry::session::events::Event;
use lanferry::utils::format_speed;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Optional path to a JSON config file
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for a peer to connect
    Listen {
        /// Port to listen on (defaults to the config value)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Connect to a listening peer
    Connect {
        /// Peer address, e.g. 192.168.1.20
        address: String,

        /// Port the peer listens on (defaults to the config value)
        #[arg(short, long)]
        port: Option<u16>,
    },
}

// Function to initialize tracing and file logging
// Returns a WorkerGuard that must be kept alive for logs to be written
fn init_logging(log_file_prefix: &str) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::daily("logs", log_file_prefix);
    let (non_blocking_appender, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_appender)
        .with_ansi(false); // Don't use ANSI codes in files

    // Use RUST_LOG env var, default to info
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Shared view of the remote side, updated by the event task and read by
/// the command loop.
struct RemoteView {
    listing: DirectoryListing,
    style: PathStyle,
}

impl RemoteView {
    fn new() -> Self {
        Self {
            listing: DirectoryListing::default(),
            style: PathStyle::Posix,
        }
    }
}

/// Guess the path style the remote side uses from its listing.
fn detect_style(listing: &DirectoryListing) -> PathStyle {
    let windowsish = listing.path.contains('\\')
        || listing
            .entries
            .iter()
            .any(|e| matches!(e, DirectoryEntry::Drive(p) if p.contains(':')));
    if windowsish {
        PathStyle::Windows
    } else {
        PathStyle::Posix
    }
}

fn print_listing(listing: &DirectoryListing, label: &str) {
    let location = if listing.path.is_empty() {
        "(drive roots)"
    } else {
        listing.path.as_str()
    };
    println!("{label} {location}:");
    if listing.entries.is_empty() {
        println!("  (empty)");
    }
    for entry in &listing.entries {
        println!("  {}", entry.to_wire());
    }
}

/// Consume core events and render them: listings, a progress bar for the
/// active transfer, and error lines.
fn spawn_event_task(
    mut event_rx: tokio::sync::mpsc::UnboundedReceiver<Event>,
    remote: Arc<Mutex<RemoteView>>,
) {
    tokio::spawn(async move {
        let mut bar: Option<ProgressBar> = None;
        while let Some(event) = event_rx.recv().await {
            match event {
                Event::Connected { addr, role } => {
                    println!("Connected to {addr} ({role:?}). Type `help` for commands.");
                }
                Event::Disconnected => {
                    if let Some(b) = bar.take() {
                        b.abandon();
                    }
                    println!("Disconnected. Waiting for a peer...");
                }
                Event::RemoteListingUpdated(listing) => {
                    {
                        let mut view = remote.lock().unwrap();
                        view.style = detect_style(&listing);
                        view.listing = listing.clone();
                    }
                    print_listing(&listing, "remote");
                }
                Event::TransferStarted { name, direction } => {
                    let b = ProgressBar::new(100);
                    b.set_style(
                        ProgressStyle::default_bar()
                            .template("{prefix} [{bar:40.cyan/blue}] {pos}% {msg}")
                            .unwrap(),
                    );
                    b.set_prefix(format!("{direction:?} {name}"));
                    bar = Some(b);
                }
                Event::ProgressUpdated { percent } => {
                    if let Some(b) = &bar {
                        b.set_position(percent as u64);
                    }
                }
                Event::SpeedUpdated { bytes_per_sec } => {
                    if let Some(b) = &bar {
                        if bytes_per_sec > 0.0 {
                            b.set_message(format_speed(bytes_per_sec));
                        }
                    }
                }
                Event::Completed { label } => {
                    if let Some(b) = bar.take() {
                        b.finish_and_clear();
                    }
                    println!("{label}");
                }
                Event::Cancelled { name } => {
                    if let Some(b) = bar.take() {
                        b.abandon();
                    }
                    println!("cancelled {name}");
                }
                Event::RecentPeersUpdated(peers) => {
                    info!(?peers, "recent peer list updated");
                }
                Event::Error { kind, message } => {
                    if let Some(b) = bar.take() {
                        b.abandon();
                    }
                    // Friendlier wording for the common connection cases.
                    if message.contains("refused") {
                        eprintln!("error: the peer refused the connection");
                    } else if message.contains("reset") {
                        eprintln!("error: the connection was reset");
                    } else {
                        eprintln!("error ({kind:?}): {message}");
                    }
                }
            }
        }
    });
}

async fn show_local(nav: &NavigationState) -> DirectoryListing {
    let drives = listing::platform_drives();
    let result = listing::list(nav.current_dir(), drives.as_ref()).await;
    print_listing(&result, "local");
    result
}

fn help() {
    println!("commands:");
    println!("  ls              refresh the remote listing");
    println!("  cd <name>       enter a remote folder or drive");
    println!("  up              go to the remote parent directory");
    println!("  lls             show the local listing");
    println!("  lcd <name>      enter a local folder or drive");
    println!("  lup             go to the local parent directory");
    println!("  get <file>      pull a remote file into the local directory");
    println!("  put <file>      push a local file into the remote directory");
    println!("  cancel          cancel the active transfer");
    println!("  recent          show recently used peer addresses");
    println!("  quit            disconnect and exit");
}

async fn command_loop(
    session: Arc<SessionManager>,
    remote: Arc<Mutex<RemoteView>>,
    config: &AppConfig,
) {
    let mut local_nav = NavigationState::new(PathStyle::native());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        let (cmd, arg) = match line.split_once(' ') {
            Some((c, a)) => (c, a.trim()),
            None => (line, ""),
        };
        match cmd {
            "" => {}
            "help" => help(),
            "ls" => {
                let path = remote.lock().unwrap().listing.path.clone();
                session.request_listing(&path).await;
            }
            "cd" => {
                let target = {
                    let view = remote.lock().unwrap();
                    join_child(&view.listing.path, arg, view.style)
                };
                session.request_listing(&target).await;
            }
            "up" => {
                let target = {
                    let view = remote.lock().unwrap();
                    parent_of(&view.listing.path, view.style)
                };
                session.request_listing(&target).await;
            }
            "lls" => {
                show_local(&local_nav).await;
            }
            "lcd" => {
                let target = local_nav.child(arg);
                let drives = listing::platform_drives();
                let result = listing::list(&target, drives.as_ref()).await;
                // The effective path may differ if the directory vanished.
                local_nav.enter(&result.path);
                print_listing(&result, "local");
            }
            "lup" => {
                let target = local_nav.parent();
                local_nav.enter(&target);
                show_local(&local_nav).await;
            }
            "get" => {
                if arg.is_empty() {
                    println!("usage: get <file>");
                    continue;
                }
                let remote_dir = remote.lock().unwrap().listing.path.clone();
                let save_dir = if local_nav.is_at_root() {
                    config.download_directory.clone()
                } else {
                    local_nav.current_dir().to_string()
                };
                session.pull_file(arg, &remote_dir, &save_dir).await;
            }
            "put" => {
                if arg.is_empty() {
                    println!("usage: put <file>");
                    continue;
                }
                let local_path = if Path::new(arg).is_absolute() || local_nav.is_at_root() {
                    PathBuf::from(arg)
                } else {
                    PathBuf::from(local_nav.child(arg))
                };
                let remote_dir = remote.lock().unwrap().listing.path.clone();
                session.push_file(&local_path, &remote_dir).await;
            }
            "cancel" => session.cancel_transfer().await,
            "recent" => {
                for peer in session.recent_peers() {
                    println!("  {peer}");
                }
            }
            "quit" | "exit" => {
                session.disconnect().await;
                break;
            }
            other => println!("unknown command {other:?}, try `help`"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // This guard needs to stay in scope, otherwise logs stop writing.
    let _guard = init_logging("lanferry")?;

    let cli = Cli::parse();
    let config = AppConfig::load_or_default(cli.config.as_deref());
    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    config.ensure_directories()?;

    let (session, event_rx) = SessionManager::new(&config);
    let session = Arc::new(session);
    let remote = Arc::new(Mutex::new(RemoteView::new()));
    spawn_event_task(event_rx, remote.clone());

    match cli.command {
        Commands::Listen { port } => {
            let port = port.unwrap_or(config.port);
            session.start_listening(port);
            println!("Listening on port {port}. Waiting for a peer...");
        }
        Commands::Connect { address, port } => {
            let port = port.unwrap_or(config.port);
            println!("Connecting to {address}:{port}...");
            session.connect(&address, port).await;
            if !session.is_connected().await {
                anyhow::bail!("connection failed");
            }
        }
    }

    command_loop(session, remote, &config).await;
    Ok(())
}
