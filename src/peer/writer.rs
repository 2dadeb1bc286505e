//! Outbound writer
//!
//! Writes one message at a time and reports completion back to the
//! scheduler. Also owns the keepalive timer: when nothing expecting a reply
//! has been sent for a ping interval, a ping is queued.

use crate::peer::connection::Peer;
use crate::peer::envelope::OutboundEnvelope;
use crate::peer::wire::{BoxedWriter, Message};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

pub(crate) async fn run(
    peer: Arc<Peer>,
    mut writer: BoxedWriter,
    mut send_rx: mpsc::Receiver<OutboundEnvelope>,
    done_tx: mpsc::Sender<()>,
) {
    let ping_interval = peer.ctx.config.ping_interval;
    let keepalive = tokio::time::sleep(ping_interval);
    tokio::pin!(keepalive);

    loop {
        tokio::select! {
            biased;
            _ = peer.cancel.cancelled() => break,
            envelope = send_rx.recv() => {
                let Some(envelope) = envelope else { break };
                let message = envelope.message();

                if admits(&peer, message) {
                    if message.expects_reply() {
                        keepalive.as_mut().reset(Instant::now() + ping_interval);
                    }
                    // Recorded before the write so a fast reply always finds it.
                    note_outgoing(&peer, message);

                    if write_message(&peer, &mut writer, message).await
                        && matches!(message, Message::VerAck)
                    {
                        peer.stats.lock().verack_sent = true;
                        peer.note_negotiated();
                    }
                }
                peer.stats.lock().last_send = Some(SystemTime::now());

                envelope.complete();
                // The scheduler may be gone; its drain handles the rest.
                let _ = done_tx.send(()).await;
            }
            _ = &mut keepalive => {
                let nonce: u64 = rand::random();
                if peer.output_tx.try_send(Message::Ping { nonce }.into()).is_err() {
                    debug!(peer = %peer, "Output queue full; skipping keepalive ping");
                }
                keepalive.as_mut().reset(Instant::now() + ping_interval);
            }
        }
    }

    // Drain until the scheduler exits and drops its sender, so nobody
    // blocks handing us a message.
    while let Some(envelope) = send_rx.recv().await {
        envelope.complete();
    }

    let _ = writer.shutdown().await;
    drop(writer);
    trace!(peer = %peer, "Peer output handler done");
    peer.task_exited();
}

/// Bookkeeping done for a message about to be written
fn note_outgoing(peer: &Peer, message: &Message) {
    match message {
        Message::Version(_) => peer.stats.lock().version_sent = true,
        Message::Ping { nonce } => peer.record_ping(*nonce),
        _ => {}
    }
}

/// Whether `message` may go on the wire right now
fn admits(peer: &Peer, message: &Message) -> bool {
    if message.is_handshake_control() {
        return true;
    }
    if peer.is_disconnecting() {
        return false;
    }

    // Only version and reject may go out before the peer's version is known.
    if !peer.version_known() {
        trace!(peer = %peer, command = message.command(), "Dropping message before handshake");
        return false;
    }
    true
}

/// Put one message on the wire. Returns whether it was written.
async fn write_message(peer: &Arc<Peer>, writer: &mut BoxedWriter, message: &Message) -> bool {
    debug!(
        peer = %peer,
        command = message.command(),
        summary = %message.summary(),
        "Sending message"
    );

    let protocol_version = peer.protocol_version();
    let result = tokio::select! {
        result = peer.ctx.codec.write_message(writer, message, protocol_version) => result,
        _ = peer.cancel.cancelled() => return false,
    };

    match result {
        Ok(bytes) => {
            peer.stats.lock().bytes_sent += bytes as u64;
            true
        }
        Err(err) => {
            peer.disconnect();
            peer.log_error(&format!("Can't send message to {}: {}", peer, err));
            false
        }
    }
}
