//! Outbound queue handler
//!
//! Multiplexes direct messages and trickled inventory onto the writer,
//! keeping at most one message in flight. A message is handed over only
//! after the writer reports the previous one done; everything else waits in
//! the pending FIFO, which is capped so producers feel the writer's pace.

use crate::peer::connection::{Peer, SessionIo};
use crate::peer::envelope::OutboundEnvelope;
use crate::peer::known_inventory::KnownInventory;
use crate::peer::wire::{InvVect, Message};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::trace;

/// Split queued inventory into announcement batches of at most
/// `max_per_message` entries, skipping anything the peer already knows.
/// Every announced entry is recorded as known.
pub(crate) fn drain_inventory(
    queue: &mut VecDeque<InvVect>,
    max_per_message: usize,
    known: &mut KnownInventory,
) -> Vec<Vec<InvVect>> {
    let max = max_per_message.max(1);
    let mut batches = Vec::new();
    let mut batch = Vec::with_capacity(queue.len().min(max));

    while let Some(inv) = queue.pop_front() {
        if known.exists(&inv) {
            continue;
        }
        batch.push(inv);
        known.add(inv);
        if batch.len() >= max {
            batches.push(std::mem::replace(
                &mut batch,
                Vec::with_capacity(queue.len().min(max)),
            ));
        }
    }
    if !batch.is_empty() {
        batches.push(batch);
    }
    batches
}

pub(crate) async fn run(
    peer: Arc<Peer>,
    io: SessionIo,
    send_tx: mpsc::Sender<OutboundEnvelope>,
    mut done_rx: mpsc::Receiver<()>,
) {
    let SessionIo {
        mut output_rx,
        mut inv_rx,
    } = io;
    let config = &peer.ctx.config;

    let mut pending: VecDeque<OutboundEnvelope> = VecDeque::new();
    let mut inventory: VecDeque<InvVect> = VecDeque::new();
    let mut waiting = false;

    let period = config.trickle_interval;
    let mut trickle = interval_at(Instant::now() + period, period);
    trickle.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Past this many queued messages producers wait on the output channel.
    let max_pending = config.output_buffer_size.max(1);

    loop {
        tokio::select! {
            biased;
            _ = peer.cancel.cancelled() => break,
            // Completions outrank new output.
            Some(()) = done_rx.recv() => {
                match pending.pop_front() {
                    Some(next) => hand_off(&send_tx, next).await,
                    None => waiting = false,
                }
            }
            Some(envelope) = output_rx.recv(), if pending.len() < max_pending => {
                queue_packet(&send_tx, envelope, &mut pending, &mut waiting).await;
            }
            Some(inv) = inv_rx.recv() => {
                // Nothing is announced before the peer's version is known.
                if peer.version_known() {
                    inventory.push_back(inv);
                }
            }
            _ = trickle.tick() => {
                if peer.is_disconnecting() || inventory.is_empty() {
                    continue;
                }
                let batches = {
                    let mut known = peer.known_inventory.lock();
                    drain_inventory(&mut inventory, config.max_inv_trickle_size, &mut known)
                };
                for batch in batches {
                    trace!(peer = %peer, count = batch.len(), "Trickling inventory");
                    queue_packet(&send_tx, Message::Inv(batch).into(), &mut pending, &mut waiting)
                        .await;
                }
            }
        }
    }

    // Release every waiter before exiting, including messages that raced in
    // after the cancel.
    for envelope in pending.drain(..) {
        envelope.complete();
    }
    output_rx.close();
    while let Ok(envelope) = output_rx.try_recv() {
        envelope.complete();
    }
    inv_rx.close();
    while inv_rx.try_recv().is_ok() {}

    // Lets the writer finish its own drain.
    drop(send_tx);
    trace!(peer = %peer, "Peer queue handler done");
    peer.task_exited();
}

async fn queue_packet(
    send_tx: &mpsc::Sender<OutboundEnvelope>,
    envelope: OutboundEnvelope,
    pending: &mut VecDeque<OutboundEnvelope>,
    waiting: &mut bool,
) {
    if *waiting {
        pending.push_back(envelope);
        return;
    }
    *waiting = true;
    hand_off(send_tx, envelope).await;
}

async fn hand_off(send_tx: &mpsc::Sender<OutboundEnvelope>, envelope: OutboundEnvelope) {
    if let Err(mpsc::error::SendError(envelope)) = send_tx.send(envelope).await {
        envelope.complete();
    }
}
