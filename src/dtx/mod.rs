//! The DTX message bus: a symmetric, multiplexed RPC used by the
//! instruments and testmanagerd services.
//!
//! One connection owns exactly one reader task and one writer task. Callers
//! post requests through the writer queue and park on a oneshot keyed by
//! message id; the reader routes replies by id, fans server-initiated
//! messages out to selector subscribers, and acknowledges whatever the
//! device expects an answer to. Closing is idempotent: every parked caller
//! wakes with `ConnectionClosed` and `:finished:` subscribers get a final
//! event before their streams end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};

pub mod message;

pub use message::{AuxValue, DtxMessage, DtxPayload};
use message::{build_frame, DtxMessageHeader, FragmentPool};

use crate::nskeyed::NsValue;
use crate::{DeviceError, ReadWrite};

/// Pseudo-selector delivered every server message that expects no reply.
pub const NOTIFICATION_KEY: &str = ":notification:";
/// Pseudo-selector fired once when the connection closes.
pub const FINISHED_KEY: &str = ":finished:";

/// Default wait for a correlated reply.
pub const DTX_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Channel numbers the device uses for unsolicited messages on an
/// allocated channel: `2^32 - code`.
pub fn reply_channel(code: u32) -> u32 {
    0u32.wrapping_sub(code)
}

enum WriterCommand {
    Frame(Vec<u8>),
    Shutdown,
}

struct Shared {
    pending: Mutex<HashMap<u32, oneshot::Sender<DtxMessage>>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<DtxMessage>>>>,
    closed_tx: watch::Sender<bool>,
}

impl Shared {
    /// Tears the connection state down exactly once.
    fn shutdown(&self) {
        if self.closed_tx.send_replace(true) {
            return;
        }
        // Dropping the oneshot senders wakes every parked caller.
        self.pending.lock().unwrap().clear();

        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(finished) = subscribers.get(FINISHED_KEY) {
            let event = DtxMessage {
                channel: 0,
                message_id: 0,
                conversation_index: 0,
                expects_reply: false,
                flags: 0,
                payload: DtxPayload::Empty,
            };
            for tx in finished {
                let _ = tx.send(event.clone());
            }
        }
        // Dropping the senders ends every subscription stream.
        subscribers.clear();
    }

    /// Sends a server-initiated message to its subscribers. Returns whether
    /// anyone received it.
    fn dispatch(&self, msg: &DtxMessage) -> bool {
        let mut delivered = false;
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(selector) = msg.selector() {
            if let Some(list) = subscribers.get_mut(selector) {
                list.retain(|tx| tx.send(msg.clone()).is_ok());
                delivered |= !list.is_empty();
            }
        }
        if !msg.expects_reply {
            if let Some(list) = subscribers.get_mut(NOTIFICATION_KEY) {
                list.retain(|tx| tx.send(msg.clone()).is_ok());
                delivered |= !list.is_empty();
            }
        }
        delivered
    }
}

/// A live subscription to server-initiated messages.
///
/// Ends (returns `None`) when the connection closes; closure is never an
/// error on this path.
#[derive(Debug)]
pub struct DtxSubscription {
    rx: mpsc::UnboundedReceiver<DtxMessage>,
}

impl DtxSubscription {
    pub async fn next(&mut self) -> Option<DtxMessage> {
        self.rx.recv().await
    }
}

/// One DTX connection over a device socket.
#[derive(Debug)]
pub struct DtxConnection {
    shared: Arc<Shared>,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    reader_task: tokio::task::JoinHandle<()>,
    next_message_id: AtomicU32,
    next_channel: AtomicU32,
    channels: Mutex<HashMap<String, u32>>,
    closed_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared").finish_non_exhaustive()
    }
}

impl DtxConnection {
    /// Takes ownership of the socket, spawns the reader/writer pair and
    /// performs the capability handshake.
    pub async fn connect(socket: Box<dyn ReadWrite>) -> Result<Self, DeviceError> {
        let (read_half, write_half) = tokio::io::split(socket);
        let (closed_tx, closed_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            closed_tx,
        });

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(write_half, writer_rx));
        let reader_task = tokio::spawn(run_reader(read_half, shared.clone(), writer_tx.clone()));

        let conn = Self {
            shared,
            writer_tx,
            reader_task,
            next_message_id: AtomicU32::new(0),
            next_channel: AtomicU32::new(1),
            channels: Mutex::new(HashMap::new()),
            closed_rx,
        };

        let mut capabilities = HashMap::new();
        capabilities.insert(
            "com.apple.private.DTXConnection".to_string(),
            NsValue::Int(1),
        );
        capabilities.insert(
            "com.apple.private.DTXBlockCompression".to_string(),
            NsValue::Int(2),
        );
        conn.notify(
            0,
            "_notifyOfPublishedCapabilities:",
            &[AuxValue::Object(NsValue::Dictionary(capabilities))],
        )?;
        Ok(conn)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Resolves when the connection has closed for any reason.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Closes the connection. Idempotent; unblocks every waiter.
    pub fn close(&self) {
        self.shared.shutdown();
        let _ = self.writer_tx.send(WriterCommand::Shutdown);
        self.reader_task.abort();
    }

    fn next_message_id(&self) -> u32 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Sends an invocation that expects no reply.
    pub fn notify(
        &self,
        channel: u32,
        selector: &str,
        args: &[AuxValue],
    ) -> Result<(), DeviceError> {
        if self.is_closed() {
            return Err(DeviceError::ConnectionClosed);
        }
        let payload = DtxPayload::build_invocation(selector, args)?;
        let frame = build_frame(self.next_message_id(), 0, channel, false, &payload);
        self.writer_tx
            .send(WriterCommand::Frame(frame))
            .map_err(|_| DeviceError::ConnectionClosed)
    }

    /// Sends an invocation and waits for the correlated reply.
    pub async fn call(
        &self,
        channel: u32,
        selector: &str,
        args: &[AuxValue],
    ) -> Result<DtxMessage, DeviceError> {
        self.call_with_timeout(channel, selector, args, DTX_REPLY_TIMEOUT)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        channel: u32,
        selector: &str,
        args: &[AuxValue],
        timeout: Duration,
    ) -> Result<DtxMessage, DeviceError> {
        if self.is_closed() {
            return Err(DeviceError::ConnectionClosed);
        }
        let message_id = self.next_message_id();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(message_id, tx);

        let payload = DtxPayload::build_invocation(selector, args)?;
        let frame = build_frame(message_id, 0, channel, true, &payload);
        if self.writer_tx.send(WriterCommand::Frame(frame)).is_err() {
            self.shared.pending.lock().unwrap().remove(&message_id);
            return Err(DeviceError::ConnectionClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(DeviceError::ConnectionClosed),
            Err(_) => {
                self.shared.pending.lock().unwrap().remove(&message_id);
                Err(DeviceError::Timeout)
            }
        }
    }

    /// Allocates (or returns the cached) channel for an identifier.
    ///
    /// The device refuses a second `_requestChannelWithCode:identifier:`
    /// for the same identifier, so codes are cached per connection.
    pub async fn make_channel(&self, identifier: &str) -> Result<u32, DeviceError> {
        if let Some(code) = self.channels.lock().unwrap().get(identifier) {
            return Ok(*code);
        }
        let code = self.next_channel.fetch_add(1, Ordering::Relaxed);
        let args = [
            AuxValue::U32(code),
            AuxValue::Object(NsValue::from(identifier)),
        ];
        let reply = self
            .call(0, "_requestChannelWithCode:identifier:", &args)
            .await?;
        match &reply.payload {
            DtxPayload::Empty | DtxPayload::NullReply => {}
            DtxPayload::Object(NsValue::Error { code, domain, .. }) => {
                return Err(DeviceError::ServiceFailure(format!(
                    "channel request refused: {domain} ({code})"
                )));
            }
            other => {
                return Err(DeviceError::ServiceFailure(format!(
                    "channel request answered with {other:?}"
                )));
            }
        }
        self.channels
            .lock()
            .unwrap()
            .insert(identifier.to_string(), code);
        debug!("channel {code} = {identifier}");
        Ok(code)
    }

    /// Subscribes to server-initiated messages.
    ///
    /// `key` is a selector string, or one of [`NOTIFICATION_KEY`] and
    /// [`FINISHED_KEY`].
    pub fn subscribe(&self, key: &str) -> DtxSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.is_closed() {
            self.shared
                .subscribers
                .lock()
                .unwrap()
                .entry(key.to_string())
                .or_default()
                .push(tx);
        }
        DtxSubscription { rx }
    }
}

impl Drop for DtxConnection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_writer(
    mut write_half: WriteHalf<Box<dyn ReadWrite>>,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Frame(buf) => {
                if write_half.write_all(&buf).await.is_err() {
                    break;
                }
                if write_half.flush().await.is_err() {
                    break;
                }
            }
            WriterCommand::Shutdown => break,
        }
    }
    let _ = write_half.shutdown().await;
}

async fn run_reader(
    mut read_half: ReadHalf<Box<dyn ReadWrite>>,
    shared: Arc<Shared>,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
) {
    let mut pool = FragmentPool::new();
    loop {
        let mut head = [0u8; 32];
        if read_half.read_exact(&mut head).await.is_err() {
            break;
        }
        let header = match DtxMessageHeader::parse(&head) {
            Ok(h) => h,
            Err(e) => {
                warn!("unreadable frame header: {e}");
                break;
            }
        };
        let mut body = vec![0u8; header.payload_length as usize];
        if read_half.read_exact(&mut body).await.is_err() {
            break;
        }
        let (first, assembled) = match pool.push(header, body) {
            Some(complete) => complete,
            None => continue,
        };
        let (flags, payload) = match DtxPayload::parse(&assembled) {
            Ok(p) => p,
            Err(e) => {
                warn!("dropping undecodable message {}: {e}", first.message_id);
                continue;
            }
        };
        let msg = DtxMessage {
            channel: first.channel,
            message_id: first.message_id,
            conversation_index: first.conversation_index,
            expects_reply: first.expects_reply,
            flags,
            payload,
        };
        handle_message(&shared, &writer_tx, msg);
    }
    shared.shutdown();
    let _ = writer_tx.send(WriterCommand::Shutdown);
}

fn handle_message(
    shared: &Arc<Shared>,
    writer_tx: &mpsc::UnboundedSender<WriterCommand>,
    msg: DtxMessage,
) {
    match msg.conversation_index {
        // Replies (and error replies) go to whoever is parked on the id.
        1 | 2 => {
            let waiter = shared.pending.lock().unwrap().remove(&msg.message_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(msg);
                }
                None => debug!("reply {} has no waiter", msg.message_id),
            }
        }
        0 => {
            let expects_reply = msg.expects_reply;
            let message_id = msg.message_id;
            let channel = msg.channel;
            let delivered = shared.dispatch(&msg);
            if expects_reply {
                // Whatever happened above, the device is owed an answer.
                let ack = build_frame(message_id, 1, channel, false, &DtxPayload::build_empty());
                let _ = writer_tx.send(WriterCommand::Frame(ack));
            } else if !delivered && msg.selector() != Some("_notifyOfPublishedCapabilities:") {
                debug!("ignoring notification {:?}", msg.selector());
            }
        }
        other => debug!("message with conversation index {other} dropped"),
    }
}
