//! In-memory channel transport

use super::{SendHandle, Transport, TransportError, TransportStats};
use crate::core::message::{encode_frame, Envelope, ENVELOPE_SIZE, MESSAGE_SIZE_MAX};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Receiving side of a [`ChannelTransport`]; yields complete frames
pub type FrameReceiver = mpsc::UnboundedReceiver<Bytes>;

/// Transport that hands every frame (envelope + message) to a channel
pub struct ChannelTransport {
    name: String,
    tx: mpsc::UnboundedSender<Bytes>,
    connected: AtomicBool,
    next_handle: AtomicU64,
    bytes_sent: AtomicU64,
    frames_sent: AtomicU64,
    cancels: AtomicU64,
    errors: AtomicU64,
}

impl ChannelTransport {
    /// Create a transport and the receiver its frames arrive on
    pub fn new(name: impl Into<String>) -> (Self, FrameReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            name: name.into(),
            tx,
            connected: AtomicBool::new(true),
            next_handle: AtomicU64::new(1),
            bytes_sent: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            cancels: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        };
        (transport, rx)
    }

    /// Simulate the link going up or down
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Is the link up?
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn fail(&self, err: TransportError) -> Result<SendHandle, TransportError> {
        self.errors.fetch_add(1, Ordering::Relaxed);
        Err(err)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, envelope: &Envelope, message: &[u8]) -> Result<SendHandle, TransportError> {
        if !self.is_connected() {
            return self.fail(TransportError::Disconnected);
        }
        if message.len() > MESSAGE_SIZE_MAX {
            return self.fail(TransportError::FrameTooLarge(message.len()));
        }

        let frame = encode_frame(envelope, message);
        if self.tx.send(frame).is_err() {
            self.connected.store(false, Ordering::SeqCst);
            return self.fail(TransportError::Disconnected);
        }

        self.bytes_sent
            .fetch_add((ENVELOPE_SIZE + message.len()) as u64, Ordering::Relaxed);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);

        Ok(SendHandle(self.next_handle.fetch_add(1, Ordering::Relaxed)))
    }

    fn cancel(&self, handle: SendHandle) {
        // Frames land in the channel immediately, nothing left to pull back
        tracing::trace!(transport = %self.name, %handle, "cancel after delivery");
        self.cancels.fetch_add(1, Ordering::Relaxed);
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            cancels: self.cancels.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn describe(&self) -> String {
        format!("channel:{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::decode_frame;

    #[test]
    fn test_send_delivers_frame() {
        let (transport, mut rx) = ChannelTransport::new("m3");
        let env = Envelope { size: 3, dest_cport: 2, src_cport: 5 };

        let h1 = transport.send(&env, &[1, 2, 3]).unwrap();
        let h2 = transport.send(&env, &[1, 2, 3]).unwrap();
        assert_ne!(h1, h2);

        let frame = rx.try_recv().unwrap();
        let (parsed, body) = decode_frame(&frame).unwrap();
        assert_eq!(parsed.dest_cport, 2);
        assert_eq!(&body[..], &[1, 2, 3]);
        assert_eq!(transport.stats().frames_sent, 2);
    }

    #[test]
    fn test_disconnected_send_fails() {
        let (transport, _rx) = ChannelTransport::new("m4");
        transport.set_connected(false);

        let err = transport.send(&Envelope::default(), &[]).unwrap_err();
        assert_eq!(err, TransportError::Disconnected);
        assert_eq!(transport.stats().errors, 1);
    }

    #[test]
    fn test_dropped_receiver_marks_link_down() {
        let (transport, rx) = ChannelTransport::new("m5");
        drop(rx);

        assert!(transport.send(&Envelope::default(), &[0]).is_err());
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_cancel_unknown_handle_is_safe() {
        let (transport, _rx) = ChannelTransport::new("m6");
        transport.cancel(SendHandle(999));
        assert_eq!(transport.stats().cancels, 1);
    }
}
