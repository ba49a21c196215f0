//! mpv-backed `MediaEngine`.
//!
//! mpv runs as a child process in idle mode and is driven over its JSON IPC
//! socket, with separate reader/writer tasks:
//!
//! ```text
//!   MpvDriver::spawn_and_connect()
//!         │
//!         ├── writer_task   ← receives PendingRequest via mpsc, writes → socket
//!         └── reader_task   ← reads JSON lines from socket
//!                                ├── response (has request_id) → matching oneshot
//!                                └── event (end-file, ...)     → event channel
//! ```
//!
//! The process is started lazily on the first `load` and killed on `release`.
use async_trait::async_trait;
use audivel_core::MediaEngine;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// How long a single IPC round trip may take.
const IPC_TIMEOUT: Duration = Duration::from_secs(5);
/// How long `load` waits for mpv to report a duration.
const LOAD_TIMEOUT: Duration = Duration::from_secs(20);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line, '\n' terminated
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// Unsolicited mpv event (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// e.g. "file-loaded", "end-file".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// For "end-file": the reason ("eof", "stop", "error", ...).
    pub fn end_reason(&self) -> Option<&str> {
        self.raw.get("reason")?.as_str()
    }

    pub fn file_error(&self) -> Option<&str> {
        self.raw.get("file_error")?.as_str()
    }
}

// ── handle ────────────────────────────────────────────────────────────────────

/// Cloneable handle to the writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(IPC_TIMEOUT, reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub async fn set_property(&self, name: &str, value: Value) -> anyhow::Result<()> {
        self.send(json!(["set_property", name, value])).await?;
        Ok(())
    }

    pub async fn get_f64(&self, name: &str) -> anyhow::Result<f64> {
        let resp = self.send(json!(["get_property", name])).await?;
        resp["data"]
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("mpv property {} is not a number", name))
    }

    pub async fn get_bool(&self, name: &str) -> anyhow::Result<bool> {
        let resp = self.send(json!(["get_property", name])).await?;
        resp["data"]
            .as_bool()
            .ok_or_else(|| anyhow::anyhow!("mpv property {} is not a flag", name))
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
}

impl MpvDriver {
    pub fn new() -> Self {
        Self {
            socket_name: audivel_core::platform::mpv_socket_name(),
            process: None,
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
        #[cfg(unix)]
        let _ = tokio::fs::remove_file(&self.socket_name).await;
    }

    fn spawn_process(&mut self) -> anyhow::Result<()> {
        let mpv_binary = audivel_core::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found (install mpv or set MPV_PATH)"))?;

        info!("mpv: spawning {}", mpv_binary.display());
        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--keep-open=yes")
            .arg("--pause=yes")
            .arg(audivel_core::platform::mpv_socket_arg())
            .arg("--quiet")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;
        self.spawn_process()?;

        let socket_path = std::path::PathBuf::from(&self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;
        self.spawn_process()?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(read_half, write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // req_id → reply channel; the writer inserts, the reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

async fn fail_all(pending: &PendingMap, why: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", why)));
    }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_all(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error").to_string();
                            debug!("mpv reader: req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    }
                } else {
                    debug!("mpv reader: event {}", trimmed);
                    // Nobody listening outside of `load` is fine.
                    let _ = event_tx.try_send(MpvEvent { raw: val });
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_all(&pending, &format!("mpv IPC read error: {}", e)).await;
                break;
            }
        }
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register before writing so the reader can always match the reply
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

/// Wait for `file-loaded`, then poll `duration` until mpv knows it.  Fails
/// fast on an `end-file` error.
async fn wait_for_duration(
    handle: &MpvHandle,
    mut events: Option<&mut mpsc::Receiver<MpvEvent>>,
) -> anyhow::Result<Duration> {
    let mut file_loaded = events.is_none();
    loop {
        if let Some(events) = events.as_mut() {
            while let Ok(evt) = events.try_recv() {
                match evt.event_name() {
                    Some("file-loaded") => file_loaded = true,
                    Some("end-file") if evt.end_reason() == Some("error") => {
                        anyhow::bail!(
                            "mpv could not open the file: {}",
                            evt.file_error().unwrap_or("unknown error")
                        );
                    }
                    _ => {}
                }
            }
        }
        if file_loaded {
            if let Ok(secs) = handle.get_f64("duration").await {
                if secs.is_finite() && secs > 0.0 {
                    return Ok(Duration::from_secs_f64(secs));
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// ── MediaEngine ───────────────────────────────────────────────────────────────

pub struct MpvEngine {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    events: Option<mpsc::Receiver<MpvEvent>>,
}

impl MpvEngine {
    pub fn new() -> Self {
        Self {
            driver: MpvDriver::new(),
            handle: None,
            events: None,
        }
    }

    async fn connected(&mut self) -> anyhow::Result<MpvHandle> {
        if let Some(handle) = &self.handle {
            if handle.send(json!(["get_property", "idle-active"])).await.is_ok() {
                return Ok(handle.clone());
            }
            warn!("mpv: IPC unresponsive, restarting");
        }
        let (event_tx, event_rx) = mpsc::channel(64);
        let handle = self.driver.spawn_and_connect(event_tx).await?;
        self.handle = Some(handle.clone());
        self.events = Some(event_rx);
        Ok(handle)
    }

    fn handle(&self) -> anyhow::Result<&MpvHandle> {
        self.handle
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no media loaded"))
    }
}

#[async_trait]
impl MediaEngine for MpvEngine {
    async fn load(&mut self, url: &str) -> anyhow::Result<Duration> {
        let handle = self.connected().await?;
        if let Some(events) = self.events.as_mut() {
            while events.try_recv().is_ok() {}
        }
        handle.set_property("pause", json!(true)).await?;
        handle.send(json!(["loadfile", url, "replace"])).await?;

        let duration = tokio::time::timeout(
            LOAD_TIMEOUT,
            wait_for_duration(&handle, self.events.as_mut()),
        )
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for audio metadata"))??;
        info!("mpv: loaded {} ({:.1}s)", url, duration.as_secs_f64());
        Ok(duration)
    }

    async fn play(&mut self) -> anyhow::Result<()> {
        self.handle()?.set_property("pause", json!(false)).await
    }

    async fn pause(&mut self) -> anyhow::Result<()> {
        self.handle()?.set_property("pause", json!(true)).await
    }

    async fn seek(&mut self, to: Duration) -> anyhow::Result<()> {
        self.handle()?
            .set_property("time-pos", json!(to.as_secs_f64()))
            .await
    }

    async fn set_rate(&mut self, rate: f64) -> anyhow::Result<()> {
        self.handle()?.set_property("speed", json!(rate)).await
    }

    async fn position(&mut self) -> anyhow::Result<Duration> {
        let secs = self.handle()?.get_f64("time-pos").await?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }

    async fn is_stopped(&mut self) -> anyhow::Result<bool> {
        let handle = self.handle()?;
        // With --keep-open mpv parks on the last frame and raises eof-reached.
        let eof = handle.get_bool("eof-reached").await.unwrap_or(false);
        Ok(eof || handle.get_bool("idle-active").await.unwrap_or(false))
    }

    async fn release(&mut self) -> anyhow::Result<()> {
        if let Some(handle) = self.handle.take() {
            let _ = handle.send(json!(["stop"])).await;
        }
        self.events = None;
        self.driver.kill().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fake mpv on the other end of an in-memory pipe: echoes every request as
    /// a success carrying `data`, after emitting one event.
    async fn fake_mpv(stream: tokio::io::DuplexStream, data: Value) {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let req: Value = serde_json::from_str(&line).unwrap();
            let event = json!({ "event": "file-loaded" });
            let reply = json!({ "request_id": req["request_id"], "error": "success", "data": data.clone() });
            let out = format!("{}\n{}\n", event, reply);
            write_half.write_all(out.as_bytes()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_request_reply_and_events() {
        let (ours, theirs) = tokio::io::duplex(4096);
        tokio::spawn(fake_mpv(theirs, json!(187.5)));

        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (read_half, write_half) = tokio::io::split(ours);
        let handle = start_io_tasks(read_half, write_half, event_tx);

        assert_eq!(handle.get_f64("duration").await.unwrap(), 187.5);

        // The file-loaded event queued by the first exchange unblocks the wait.
        let duration = wait_for_duration(&handle, Some(&mut event_rx)).await.unwrap();
        assert_eq!(duration, Duration::from_secs_f64(187.5));
    }

    #[tokio::test]
    async fn test_end_file_error_fails_load() {
        let (ours, theirs) = tokio::io::duplex(4096);
        tokio::spawn(fake_mpv(theirs, json!(null)));

        let (event_tx, mut event_rx) = mpsc::channel(8);
        event_tx
            .send(MpvEvent {
                raw: json!({ "event": "end-file", "reason": "error", "file_error": "unrecognized file format" }),
            })
            .await
            .unwrap();
        let (read_half, write_half) = tokio::io::split(ours);
        let handle = start_io_tasks(read_half, write_half, event_tx);

        let err = wait_for_duration(&handle, Some(&mut event_rx)).await.unwrap_err();
        assert!(err.to_string().contains("unrecognized file format"));
    }

    #[tokio::test]
    async fn test_closed_connection_fails_pending() {
        let (ours, theirs) = tokio::io::duplex(4096);
        drop(theirs);
        let (event_tx, _event_rx) = mpsc::channel(8);
        let (read_half, write_half) = tokio::io::split(ours);
        let handle = start_io_tasks(read_half, write_half, event_tx);
        assert!(handle.send(json!(["get_property", "pause"])).await.is_err());
    }
}
