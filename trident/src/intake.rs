//! Bounded command intake queue.
//!
//! A single producer (the parser/transport thread) feeds the engine
//! thread through a fixed-capacity channel. A full queue blocks the
//! producer — that backpressure is the flow-control contract with the
//! transport. Emergency stop bypasses the queue entirely via the shared
//! abort flag, so a full queue can never delay it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SendError, SyncSender};
use std::sync::Arc;
use trident_common::command::MachineCommand;
use trident_common::consts::COMMAND_QUEUE_DEPTH;

/// Producer half of the intake queue.
#[derive(Clone)]
pub struct CommandSender {
    tx: SyncSender<MachineCommand>,
    abort: Arc<AtomicBool>,
}

impl CommandSender {
    /// Enqueue a command, blocking while the queue is full.
    ///
    /// `EmergencyStop` additionally raises the abort flag immediately so
    /// the engine reacts between event pops, ahead of everything queued.
    pub fn send(&self, command: MachineCommand) -> Result<(), SendError<MachineCommand>> {
        if matches!(command, MachineCommand::EmergencyStop) {
            self.abort.store(true, Ordering::SeqCst);
        }
        self.tx.send(command)
    }
}

/// Build the intake queue. The abort flag is shared with the engine.
pub fn command_queue(
    abort: Arc<AtomicBool>,
) -> (CommandSender, Receiver<MachineCommand>) {
    let (tx, rx) = sync_channel(COMMAND_QUEUE_DEPTH);
    (CommandSender { tx, abort }, rx)
}
