//! Protocol adapter (C5, SPEC_FULL.md §4.5): wire encoding/decoding plus the
//! length-prefixed Unix-domain-socket transport.

pub mod transport;
pub mod wire;

pub use wire::{InboundEvent, ProtocolError, WireFormat};

use crate::events::{Allocation, ServerMessage};

/// Translates one decoded inbound event into the mailbox message it produces
/// (§4.1/§4.5). `Nop` carries no server-visible effect and translates to
/// nothing; every other accepted event type maps to exactly one `ServerMessage`.
pub fn to_server_message(event: InboundEvent) -> Option<ServerMessage> {
    match event {
        InboundEvent::QueryRequestEnergy => Some(ServerMessage::SchedQueryEnergy),
        InboundEvent::RejectJob { job_id } => Some(ServerMessage::SchedRejection { job_id }),
        InboundEvent::ExecuteJob { job_id, alloc } => Some(ServerMessage::SchedAllocation {
            allocations: vec![Allocation { job_id, machines: alloc }],
        }),
        InboundEvent::CallMeLater { at } => Some(ServerMessage::SchedCallMeLater { at }),
        InboundEvent::SetResourceState { resources, state } => {
            Some(ServerMessage::SchedPstateChange { target: resources, new_pstate: state })
        }
        InboundEvent::Nop => None,
    }
}
