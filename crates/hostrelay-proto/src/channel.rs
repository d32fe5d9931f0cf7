//! Channel multiplexing and flow control
//!
//! A [`Multiplexer`] owns the channel table of one link (a client session or
//! an execution host pipe). Outbound frames from every channel are funnelled
//! into a single queue that the owner drains into the transport; inbound
//! frames are handed to [`Multiplexer::route_frame`], which never blocks:
//! every channel has its own unbounded inbound queue whose size is capped by
//! credit-based flow control, so a slow consumer only stalls its own peer.

use crate::frame::{FrameFlags, CONTROL_CHANNEL};
use crate::message::{self, ChannelOpen};
use crate::{Frame, ProtocolError};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, trace};

/// Flow control configuration
#[derive(Debug, Clone)]
pub struct FlowControlConfig {
    /// Credits each direction of a new channel starts with, in bytes
    pub initial_window_size: u32,
    /// Upper bound on outstanding send credits for one channel
    pub max_window_size: u32,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            initial_window_size: 256 * 1024, // 256KB
            max_window_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

/// Channel state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Both directions open
    Open,
    /// We sent end-of-stream; the peer may still send
    HalfClosedLocal,
    /// The peer sent end-of-stream; we may still send
    HalfClosedRemote,
    /// Fully closed
    Closed,
}

/// Information about an active channel
struct ChannelEntry {
    /// Channel kind from the open frame
    kind: String,
    /// Channel state
    state: ChannelState,
    /// Inbound queue, dropped once the peer ends the channel
    inbound: Option<mpsc::UnboundedSender<Bytes>>,
    /// Bytes the peer may still send before waiting for a window update
    recv_window: u32,
    /// Credits for our own sends
    send_credits: Arc<Semaphore>,
    /// Reason carried by an error frame from the peer
    error: Arc<Mutex<Option<String>>>,
}

impl ChannelEntry {
    fn shut(&mut self) {
        self.inbound = None;
        self.send_credits.close();
        self.state = ChannelState::Closed;
    }
}

struct MultiplexerInner {
    /// Next locally allocated channel ID
    next_channel_id: AtomicU32,
    /// Active channels
    channels: Mutex<HashMap<u32, ChannelEntry>>,
    /// Outbound frame queue drained by the link writer
    outbound: mpsc::UnboundedSender<Frame>,
    /// Flow control settings
    config: FlowControlConfig,
}

/// Channel table and frame router for one link
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MultiplexerInner>,
}

impl Multiplexer {
    /// Create a multiplexer with default flow control
    ///
    /// The returned receiver yields every frame that must be written to the
    /// link, in the order the channels produced them.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        Self::with_config(FlowControlConfig::default())
    }

    /// Create a multiplexer with custom flow control config
    pub fn with_config(config: FlowControlConfig) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let inner = MultiplexerInner {
            next_channel_id: AtomicU32::new(1),
            channels: Mutex::new(HashMap::new()),
            outbound,
            config,
        };
        (Self { inner: Arc::new(inner) }, outbound_rx)
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<u32, ChannelEntry>> {
        self.inner.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Flow control settings in effect
    pub fn config(&self) -> &FlowControlConfig {
        &self.inner.config
    }

    /// Queue a raw frame for the link writer
    pub fn send_frame(&self, frame: Frame) -> Result<(), ProtocolError> {
        self.inner.outbound.send(frame).map_err(|_| ProtocolError::ChannelClosed)
    }

    /// Open a new locally initiated channel of the given kind
    pub fn open_channel(&self, kind: &str) -> Result<Channel, ProtocolError> {
        let channel_id = self.inner.next_channel_id.fetch_add(1, Ordering::SeqCst);
        let payload = message::encode(&ChannelOpen::new(kind))?;

        let channel = {
            let mut channels = self.channels();
            if channels.contains_key(&channel_id) {
                return Err(ProtocolError::DuplicateChannel(channel_id));
            }
            self.register(&mut channels, channel_id, kind)
        };

        self.send_frame(Frame::open(channel_id, payload))?;
        debug!("Opened channel {} ({})", channel_id, kind);
        Ok(channel)
    }

    fn register(
        &self,
        channels: &mut HashMap<u32, ChannelEntry>,
        channel_id: u32,
        kind: &str,
    ) -> Channel {
        let window = self.inner.config.initial_window_size;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let send_credits = Arc::new(Semaphore::new(window as usize));
        let error = Arc::new(Mutex::new(None));

        channels.insert(channel_id, ChannelEntry {
            kind: kind.to_string(),
            state: ChannelState::Open,
            inbound: Some(inbound_tx),
            recv_window: window,
            send_credits: Arc::clone(&send_credits),
            error: Arc::clone(&error),
        });

        Channel {
            kind: kind.to_string(),
            sender: ChannelSender {
                channel_id,
                multiplexer: self.clone(),
                credits: send_credits,
                max_message: window as usize,
            },
            receiver: ChannelReceiver {
                channel_id,
                multiplexer: self.clone(),
                inbound: inbound_rx,
                error,
            },
        }
    }

    /// Route an incoming frame to the appropriate channel
    ///
    /// Returns the new channel when the frame opens one. Errors for which
    /// [`ProtocolError::is_fatal`] holds must terminate the link.
    pub fn route_frame(&self, frame: Frame) -> Result<Option<Channel>, ProtocolError> {
        let channel_id = frame.channel_id;
        if channel_id == CONTROL_CHANNEL || !frame.flags.is_defined() {
            return Err(ProtocolError::InvalidFrame);
        }

        let mut channels = self.channels();

        if frame.is_open() {
            if channels.contains_key(&channel_id) {
                return Err(ProtocolError::DuplicateChannel(channel_id));
            }
            let open: ChannelOpen = message::decode(&frame.payload)?;
            debug!("Peer opened channel {} ({})", channel_id, open.kind);
            return Ok(Some(self.register(&mut channels, channel_id, &open.kind)));
        }

        let entry = channels
            .get_mut(&channel_id)
            .ok_or(ProtocolError::UnknownChannel(channel_id))?;

        if frame.flags.has_flag(FrameFlags::WINDOW_UPDATE) {
            let delta = frame.window_delta().ok_or(ProtocolError::InvalidFrame)?;
            let available = entry.send_credits.available_permits() as u64;
            if available + delta as u64 > self.inner.config.max_window_size as u64 {
                return Err(ProtocolError::FlowControlViolation(channel_id));
            }
            entry.send_credits.add_permits(delta as usize);
            trace!("Channel {} granted {} bytes", channel_id, delta);
            return Ok(None);
        }

        if frame.is_error() {
            let reason = frame.error_reason();
            debug!("Peer reset channel {}: {}", channel_id, reason);
            *entry.error.lock().unwrap_or_else(|p| p.into_inner()) = Some(reason);
            entry.shut();
            channels.remove(&channel_id);
            return Ok(None);
        }

        if frame.is_end_stream() {
            entry.inbound = None;
            match entry.state {
                ChannelState::HalfClosedLocal | ChannelState::Closed => {
                    entry.shut();
                    channels.remove(&channel_id);
                }
                _ => entry.state = ChannelState::HalfClosedRemote,
            }
            debug!("Peer ended channel {}", channel_id);
            return Ok(None);
        }

        // Plain data
        let size = frame.payload.len() as u32;
        let inbound = entry.inbound.as_ref().ok_or(ProtocolError::ChannelClosed)?;
        if size > entry.recv_window {
            return Err(ProtocolError::FlowControlViolation(channel_id));
        }

        if inbound.send(frame.payload).is_ok() {
            entry.recv_window -= size;
        } else {
            // Nobody reads this channel anymore; hand the credits straight back
            drop(channels);
            let _ = self.send_frame(Frame::window_update(channel_id, size));
        }
        Ok(None)
    }

    /// Return `size` bytes of receive credit for a consumed message
    fn grant(&self, channel_id: u32, size: u32) {
        if size == 0 {
            return;
        }
        let mut channels = self.channels();
        if let Some(entry) = channels.get_mut(&channel_id) {
            if entry.inbound.is_some() {
                entry.recv_window += size;
                let _ = self.inner.outbound.send(Frame::window_update(channel_id, size));
            }
        }
    }

    /// End our side of a channel
    pub fn close_channel(&self, channel_id: u32) -> Result<(), ProtocolError> {
        let mut channels = self.channels();
        let entry = channels
            .get_mut(&channel_id)
            .ok_or(ProtocolError::UnknownChannel(channel_id))?;

        entry.send_credits.close();
        match entry.state {
            ChannelState::Open => {
                entry.state = ChannelState::HalfClosedLocal;
                self.send_frame(Frame::end_stream(channel_id))?;
            }
            ChannelState::HalfClosedRemote => {
                entry.shut();
                channels.remove(&channel_id);
                self.send_frame(Frame::end_stream(channel_id))?;
            }
            ChannelState::HalfClosedLocal | ChannelState::Closed => {}
        }
        Ok(())
    }

    /// Abort a channel with an error frame carrying `reason`
    pub fn reset_channel(&self, channel_id: u32, reason: &str) -> Result<(), ProtocolError> {
        let mut channels = self.channels();
        let mut entry = channels
            .remove(&channel_id)
            .ok_or(ProtocolError::UnknownChannel(channel_id))?;
        entry.shut();
        self.send_frame(Frame::error(channel_id, reason))
    }

    /// End every channel, sending end-of-stream for those still open locally
    pub fn close_all(&self) {
        let mut channels = self.channels();
        for (channel_id, mut entry) in channels.drain() {
            if matches!(entry.state, ChannelState::Open | ChannelState::HalfClosedRemote) {
                let _ = self.inner.outbound.send(Frame::end_stream(channel_id));
            }
            entry.shut();
        }
    }

    /// Treat every channel as ended by the peer
    ///
    /// Messages already queued are still delivered, then receivers see the
    /// end. Our own sides stay open until closed.
    pub fn end_inbound_all(&self) {
        let mut channels = self.channels();
        channels.retain(|_, entry| {
            entry.inbound = None;
            match entry.state {
                ChannelState::HalfClosedLocal | ChannelState::Closed => {
                    entry.shut();
                    false
                }
                _ => {
                    entry.state = ChannelState::HalfClosedRemote;
                    true
                }
            }
        });
    }

    /// Drop every channel without telling the peer (the link is gone)
    pub fn abort_all(&self) {
        let mut channels = self.channels();
        for (_, mut entry) in channels.drain() {
            entry.shut();
        }
    }

    /// Get the number of active channels
    pub fn channel_count(&self) -> usize {
        self.channels().len()
    }

    /// Get channel state
    pub fn channel_state(&self, channel_id: u32) -> Option<ChannelState> {
        self.channels().get(&channel_id).map(|entry| entry.state)
    }

    /// Kind of an active channel
    pub fn channel_kind(&self, channel_id: u32) -> Option<String> {
        self.channels().get(&channel_id).map(|entry| entry.kind.clone())
    }
}

/// Handle to one channel
pub struct Channel {
    kind: String,
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .finish()
    }
}

impl Channel {
    /// Get the channel ID
    pub fn id(&self) -> u32 {
        self.sender.channel_id
    }

    /// Channel kind from the open frame
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Send a message, waiting for flow control credit
    pub async fn send(&self, payload: Bytes) -> Result<(), ProtocolError> {
        self.sender.send(payload).await
    }

    /// Receive the next message; `None` once the peer ended the channel
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// End our side of the channel
    pub fn close(&self) -> Result<(), ProtocolError> {
        self.sender.close()
    }

    /// Reason given by the peer if it reset the channel
    pub fn error(&self) -> Option<String> {
        self.receiver.error()
    }

    /// Split into independently owned send and receive halves
    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }
}

/// Sending half of a channel
#[derive(Clone)]
pub struct ChannelSender {
    channel_id: u32,
    multiplexer: Multiplexer,
    credits: Arc<Semaphore>,
    max_message: usize,
}

impl ChannelSender {
    /// Get the channel ID
    pub fn id(&self) -> u32 {
        self.channel_id
    }

    /// Send a message, waiting for flow control credit
    ///
    /// A message larger than the initial window can never be sent and fails
    /// with [`ProtocolError::FrameTooLarge`].
    pub async fn send(&self, payload: Bytes) -> Result<(), ProtocolError> {
        if payload.len() > self.max_message {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: self.max_message,
            });
        }

        let permits = self.credits
            .acquire_many(payload.len() as u32)
            .await
            .map_err(|_| ProtocolError::ChannelClosed)?;
        permits.forget();

        self.multiplexer.send_frame(Frame::data(self.channel_id, payload))
    }

    /// End our side of the channel
    pub fn close(&self) -> Result<(), ProtocolError> {
        match self.multiplexer.close_channel(self.channel_id) {
            Err(ProtocolError::UnknownChannel(_)) => Ok(()),
            other => other,
        }
    }

    /// Abort the channel with an error reason
    pub fn reset(&self, reason: &str) -> Result<(), ProtocolError> {
        match self.multiplexer.reset_channel(self.channel_id, reason) {
            Err(ProtocolError::UnknownChannel(_)) => Ok(()),
            other => other,
        }
    }
}

/// Receiving half of a channel
pub struct ChannelReceiver {
    channel_id: u32,
    multiplexer: Multiplexer,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    error: Arc<Mutex<Option<String>>>,
}

impl ChannelReceiver {
    /// Get the channel ID
    pub fn id(&self) -> u32 {
        self.channel_id
    }

    /// Receive the next message; `None` once the peer ended the channel
    pub async fn recv(&mut self) -> Option<Bytes> {
        let payload = self.inbound.recv().await?;
        self.multiplexer.grant(self.channel_id, payload.len() as u32);
        Some(payload)
    }

    /// Reason given by the peer if it reset the channel
    pub fn error(&self) -> Option<String> {
        self.error.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}
