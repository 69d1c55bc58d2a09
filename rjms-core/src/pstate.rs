//! Pstate switcher (C4, §4.4): per-machine task driving an OFF→ON or ON→OFF
//! transition and reporting completion back to the server mailbox.
//!
//! Grounded on `original_source/src/server.cpp`'s SWITCHED_ON/SWITCHED_OFF
//! handling and the PSTATE_MODIFICATION branch that spawns switcher processes.

use tokio::sync::mpsc::Sender;

use crate::clock::SimClock;
use crate::events::ServerMessage;
use crate::machine_range::MachineId;

/// Sleeps for the platform-declared transition time, then posts `SwitchedOn` (or
/// `SwitchedOff`) to the server mailbox. Must be the only task mutating this
/// machine's pstate while it runs — enforced by C1's TRANSIT_* state gate, not by
/// anything in this function.
pub async fn run_switch(
    clock: SimClock,
    mailbox: Sender<ServerMessage>,
    machine: MachineId,
    target_pstate: u32,
    transition_seconds: f64,
    turning_on: bool,
) {
    clock.sleep_for(transition_seconds).await;
    let message = if turning_on {
        ServerMessage::SwitchedOn { id: machine, pstate: target_pstate }
    } else {
        ServerMessage::SwitchedOff { id: machine, pstate: target_pstate }
    };
    // The mailbox receiver outliving every switcher is a server-loop invariant
    // (the server does not exit while machines_switching > 0); a send failure
    // here would mean that invariant broke, so it is logged rather than ignored.
    if mailbox.send(message).await.is_err() {
        tracing::error!(machine, "server mailbox closed while a pstate switch was in flight");
    }
}
