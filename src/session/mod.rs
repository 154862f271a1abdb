//! One active peer connection: symmetric listener/dialer roles, the framed
//! receive loop, and dispatch into the lister and the transfer engine.

pub mod events;

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::CoreError;
use crate::listing::{self, DirectoryListing, DriveProvider};
use crate::protocol::framing::{Frame, FrameReader, encode_control};
use crate::protocol::message::{ControlMessage, TransferHeader, validate_bare_name};
use crate::transfer::{self, Outcome, TransferSettings};
use events::{Event, EventSender};

const MAX_RECENT_PEERS: usize = 10;

/// Which side opened the connection. Both roles speak the identical
/// protocol once connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listener,
    Dialer,
}

/// State for one live peer connection, owned by the manager.
struct Connection {
    id: u64,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    peer: SocketAddr,
    /// Cooperative cancel flag for the active transfer; also raised during
    /// teardown so an in-flight task stops promptly.
    cancel: Arc<AtomicBool>,
    /// Guards the one-transfer-at-a-time rule.
    transfer_busy: Arc<AtomicBool>,
    loop_abort: Option<AbortHandle>,
}

struct Inner {
    events: EventSender,
    settings: TransferSettings,
    download_dir: PathBuf,
    drives: Arc<dyn DriveProvider>,
    conn: Mutex<Option<Connection>>,
    listening: AtomicBool,
    next_conn_id: AtomicU64,
    recent: std::sync::Mutex<Vec<String>>,
}

/// Owns at most one peer session and exposes the operations the UI layer
/// drives. All failures surface as typed events; nothing here ever
/// terminates the process.
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(config: &AppConfig) -> (Self, mpsc::UnboundedReceiver<Event>) {
        Self::with_drive_provider(config, listing::platform_drives())
    }

    /// Construct with an explicit drive provider (used by tests).
    pub fn with_drive_provider(
        config: &AppConfig,
        drives: Arc<dyn DriveProvider>,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, event_rx) = events::channel();
        let inner = Arc::new(Inner {
            events,
            settings: TransferSettings::from_config(config),
            download_dir: config.download_dir_path(),
            drives,
            conn: Mutex::new(None),
            listening: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            recent: std::sync::Mutex::new(config.recent_peers.clone()),
        });
        (Self { inner }, event_rx)
    }

    /// Bind and accept in the background; never blocks the caller. Bind and
    /// accept failures are reported on the event channel.
    pub fn start_listening(&self, port: u16) {
        if self.inner.listening.swap(true, Ordering::SeqCst) {
            debug!("listener already running");
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let listener = match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(l) => l,
                Err(e) => {
                    inner.listening.store(false, Ordering::SeqCst);
                    inner.events.error(&CoreError::Connection(e));
                    return;
                }
            };
            info!(port, "listening for peers");
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!(%addr, "inbound connection");
                        install(&inner, stream, Role::Listener).await;
                    }
                    Err(e) => {
                        inner.listening.store(false, Ordering::SeqCst);
                        inner.events.error(&CoreError::Connection(e));
                        break;
                    }
                }
            }
        });
    }

    /// Dial a peer, suspending the caller until the attempt resolves. On
    /// success the receive loop starts and a root listing is requested so
    /// the UI has a remote view immediately; on failure an error event is
    /// emitted and the manager stays idle.
    pub async fn connect(&self, address: &str, port: u16) {
        if self.inner.conn.lock().await.is_some() {
            self.inner.events.error(&CoreError::Connection(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "already connected to a peer",
            )));
            return;
        }
        match TcpStream::connect((address, port)).await {
            Ok(stream) => {
                if install(&self.inner, stream, Role::Dialer).await {
                    self.remember_peer(address);
                    if let Err(e) = self
                        .inner
                        .send_control(&ControlMessage::ListRequest { path: None })
                        .await
                    {
                        self.fail(e).await;
                    }
                }
            }
            Err(e) => self.inner.events.error(&CoreError::Connection(e)),
        }
    }

    /// Close the active session, if any. Idempotent and safe to call from
    /// error handlers; cancels the active transfer and closes both stream
    /// directions.
    pub async fn disconnect(&self) {
        let id = self.inner.conn.lock().await.as_ref().map(|c| c.id);
        if let Some(id) = id {
            teardown(&self.inner, id).await;
        }
    }

    /// Ask the peer for a listing of `path` (empty = drive roots).
    pub async fn request_listing(&self, path: &str) {
        let msg = ControlMessage::ListRequest {
            path: (!path.is_empty()).then(|| path.to_string()),
        };
        if let Err(e) = self.inner.send_control(&msg).await {
            self.fail(e).await;
        }
    }

    /// Push a local file into `remote_dir` on the peer.
    pub async fn push_file(&self, local_path: &Path, remote_dir: &str) {
        if let Err(e) = self.try_push(local_path, remote_dir).await {
            self.fail(e).await;
        }
    }

    async fn try_push(&self, local_path: &Path, remote_dir: &str) -> Result<(), CoreError> {
        let metadata = tokio::fs::metadata(local_path)
            .await
            .map_err(CoreError::FileSystem)?;
        if !metadata.is_file() {
            return Err(CoreError::FileSystem(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a file", local_path.display()),
            )));
        }
        if metadata.len() == 0 {
            // Rejected before any header goes on the wire.
            return Err(CoreError::IntegrityPolicy(format!(
                "refusing to push empty file {}",
                local_path.display()
            )));
        }
        spawn_send(&self.inner, local_path.to_path_buf(), remote_dir.to_string(), true).await
    }

    /// Ask the peer to send us `file_name` from its `remote_dir`, saved
    /// locally under `save_dir`.
    pub async fn pull_file(&self, file_name: &str, remote_dir: &str, save_dir: &str) {
        let msg = ControlMessage::PullRequest {
            file_name: file_name.to_string(),
            path: remote_dir.to_string(),
            save_path: save_dir.to_string(),
        };
        if let Err(e) = self.inner.send_control(&msg).await {
            self.fail(e).await;
        }
    }

    /// Request cancellation of the active transfer. Cooperative: the flag
    /// is observed between chunks.
    pub async fn cancel_transfer(&self) {
        if let Some(conn) = self.inner.conn.lock().await.as_ref() {
            if conn.transfer_busy.load(Ordering::Acquire) {
                conn.cancel.store(true, Ordering::Relaxed);
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.conn.lock().await.is_some()
    }

    pub fn recent_peers(&self) -> Vec<String> {
        self.inner.recent.lock().unwrap().clone()
    }

    fn remember_peer(&self, address: &str) {
        let updated = {
            let mut recent = self.inner.recent.lock().unwrap();
            recent.retain(|a| a != address);
            recent.insert(0, address.to_string());
            recent.truncate(MAX_RECENT_PEERS);
            recent.clone()
        };
        self.inner.events.emit(Event::RecentPeersUpdated(updated));
    }

    async fn fail(&self, err: CoreError) {
        let fatal = err.is_connection_fatal();
        self.inner.events.error(&err);
        if fatal {
            self.disconnect().await;
        }
    }
}

impl Inner {
    async fn send_control(&self, msg: &ControlMessage) -> Result<(), CoreError> {
        let writer = self
            .conn
            .lock()
            .await
            .as_ref()
            .map(|c| c.writer.clone())
            .ok_or_else(|| {
                CoreError::Connection(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "not connected to a peer",
                ))
            })?;
        let frame = encode_control(msg)?;
        let mut w = writer.lock().await;
        w.write_all(&frame).await.map_err(CoreError::Connection)?;
        w.flush().await.map_err(CoreError::Connection)
    }
}

/// Adopt a freshly opened stream as the active session. Returns false (and
/// closes the stream) when a session is already active: a listener that is
/// connected refuses further peers without disturbing the current one.
async fn install(inner: &Arc<Inner>, stream: TcpStream, role: Role) -> bool {
    let peer = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(error = %e, "dropping connection without a peer address");
            return false;
        }
    };
    let (read_half, write_half) = stream.into_split();

    let mut guard = inner.conn.lock().await;
    if guard.is_some() {
        debug!(%peer, "refusing connection while a session is active");
        // Dropping both halves closes the socket immediately.
        return false;
    }

    let id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
    *guard = Some(Connection {
        id,
        writer: Arc::new(Mutex::new(write_half)),
        peer,
        cancel: Arc::new(AtomicBool::new(false)),
        transfer_busy: Arc::new(AtomicBool::new(false)),
        loop_abort: None,
    });

    let handle = tokio::spawn(receive_loop(inner.clone(), FrameReader::new(read_half), id));
    if let Some(conn) = guard.as_mut() {
        conn.loop_abort = Some(handle.abort_handle());
    }
    drop(guard);

    info!(%peer, ?role, "peer connected");
    inner.events.emit(Event::Connected { addr: peer, role });
    true
}

/// Close the connection identified by `conn_id`, if it is still the active
/// one. Later calls (or calls racing a newer session) are no-ops, which
/// makes disconnect idempotent.
async fn teardown(inner: &Arc<Inner>, conn_id: u64) {
    let conn = {
        let mut guard = inner.conn.lock().await;
        match guard.as_ref() {
            Some(c) if c.id == conn_id => guard.take(),
            _ => None,
        }
    };
    let Some(conn) = conn else { return };

    conn.cancel.store(true, Ordering::Relaxed);
    if let Ok(mut writer) = conn.writer.try_lock() {
        let _ = writer.shutdown().await;
    }
    info!(peer = %conn.peer, "session closed");
    inner.events.emit(Event::Disconnected);
    if let Some(abort) = conn.loop_abort {
        abort.abort();
    }
}

/// Decode one message at a time off the stream and dispatch it. Runs until
/// EOF, a read error, or a protocol violation, then tears the session down.
async fn receive_loop(inner: Arc<Inner>, mut framer: FrameReader<OwnedReadHalf>, conn_id: u64) {
    let timeout = inner.settings.receive_timeout;
    loop {
        match framer.read_frame(timeout).await {
            Ok(Frame::Control(msg)) => {
                if let Err(e) = dispatch_control(&inner, msg).await {
                    let fatal = e.is_connection_fatal();
                    inner.events.error(&e);
                    if fatal {
                        break;
                    }
                }
            }
            Ok(Frame::Header(header)) => {
                match run_receive_transfer(&inner, framer, header).await {
                    Some(returned) => framer = returned,
                    None => break,
                }
            }
            Err(e) => {
                match &e {
                    CoreError::Connection(io_err)
                        if io_err.kind() == io::ErrorKind::UnexpectedEof =>
                    {
                        info!("peer closed the connection");
                    }
                    _ => inner.events.error(&e),
                }
                break;
            }
        }
    }
    teardown(&inner, conn_id).await;
}

async fn dispatch_control(inner: &Arc<Inner>, msg: ControlMessage) -> Result<(), CoreError> {
    match msg {
        ControlMessage::ListRequest { path } => {
            let path = path.unwrap_or_default();
            debug!(path = %path, "peer requested listing");
            let result = listing::list(&path, inner.drives.as_ref()).await;
            let reply = ControlMessage::FileList {
                files: result.wire_files(),
                path: result.path,
            };
            inner.send_control(&reply).await
        }
        ControlMessage::FileList { files, path } => {
            let result = DirectoryListing::from_wire(&files, path);
            inner.events.emit(Event::RemoteListingUpdated(result));
            Ok(())
        }
        ControlMessage::PullRequest {
            file_name,
            path,
            save_path,
        } => serve_pull(inner, &file_name, &path, &save_path).await,
    }
}

/// Serve a peer's pull request by sending the file back. No checksum goes
/// into the header on this path. If the file does not exist the error is
/// task-fatal and no header is ever sent.
async fn serve_pull(
    inner: &Arc<Inner>,
    file_name: &str,
    path: &str,
    save_path: &str,
) -> Result<(), CoreError> {
    validate_bare_name(file_name)?;
    let full_path = Path::new(path).join(file_name);
    let metadata = tokio::fs::metadata(&full_path)
        .await
        .map_err(CoreError::FileSystem)?;
    if !metadata.is_file() {
        return Err(CoreError::FileSystem(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a file", full_path.display()),
        )));
    }
    spawn_send(inner, full_path, save_path.to_string(), false).await
}

/// Start a send transfer on its own task. The task holds the write half
/// for the whole transfer so control frames cannot interleave with the
/// header and file bytes.
async fn spawn_send(
    inner: &Arc<Inner>,
    local_path: PathBuf,
    dest_dir: String,
    with_checksum: bool,
) -> Result<(), CoreError> {
    let (writer, cancel, busy, conn_id) = {
        let guard = inner.conn.lock().await;
        let conn = guard.as_ref().ok_or_else(|| {
            CoreError::Connection(io::Error::new(
                io::ErrorKind::NotConnected,
                "not connected to a peer",
            ))
        })?;
        (
            conn.writer.clone(),
            conn.cancel.clone(),
            conn.transfer_busy.clone(),
            conn.id,
        )
    };
    if busy
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(CoreError::IntegrityPolicy(
            "a transfer is already in progress".into(),
        ));
    }

    let inner = inner.clone();
    tokio::spawn(async move {
        let result = {
            let mut w = writer.lock().await;
            transfer::send_file(
                &mut *w,
                &local_path,
                &dest_dir,
                with_checksum,
                &inner.settings,
                &inner.events,
                &cancel,
            )
            .await
        };
        busy.store(false, Ordering::Release);
        cancel.store(false, Ordering::Relaxed);
        match result {
            Ok(Outcome::Completed) => {}
            Ok(Outcome::Cancelled) => {
                // The peer still expects the remaining body bytes and the
                // wire protocol has no abort frame, so the stream cannot
                // be reused after a cancelled send.
                teardown(&inner, conn_id).await;
            }
            Err(e) => {
                let fatal = e.is_connection_fatal();
                inner.events.error(&e);
                if fatal {
                    teardown(&inner, conn_id).await;
                }
            }
        }
    });
    Ok(())
}

/// Run a receive transfer on its own task, lending it the read half. The
/// frame reader comes back once the body has been fully consumed; `None`
/// means the connection is no longer usable.
async fn run_receive_transfer(
    inner: &Arc<Inner>,
    mut framer: FrameReader<OwnedReadHalf>,
    header: TransferHeader,
) -> Option<FrameReader<OwnedReadHalf>> {
    let (cancel, busy) = {
        let guard = inner.conn.lock().await;
        let conn = guard.as_ref()?;
        (conn.cancel.clone(), conn.transfer_busy.clone())
    };
    if busy
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // The body bytes already trail this header; with a transfer active
        // there is no way to stay in sync.
        inner
            .events
            .error(&CoreError::protocol("transfer header while a transfer is active"));
        return None;
    }

    let task_inner = inner.clone();
    let task_cancel = cancel.clone();
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(async move {
        let result = transfer::receive_file(
            &mut framer,
            &header,
            &task_inner.download_dir,
            &task_inner.settings,
            &task_inner.events,
            &task_cancel,
        )
        .await;
        let _ = done_tx.send((framer, result));
    });

    let outcome = done_rx.await;
    busy.store(false, Ordering::Release);
    cancel.store(false, Ordering::Relaxed);
    match outcome {
        Ok((framer, Ok(_))) => Some(framer),
        Ok((framer, Err(e))) => {
            let fatal = e.is_connection_fatal();
            inner.events.error(&e);
            if fatal { None } else { Some(framer) }
        }
        // The transfer task died without reporting back.
        Err(_) => None,
    }
}
