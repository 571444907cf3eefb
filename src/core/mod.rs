//! Core data model: parsed packets and flow records

pub mod flow;
pub mod packet;

pub use flow::{FlowCounters, FlowDetection, FlowFlags, FlowRecord, Origin};
pub use packet::{MacAddr, PacketError, PacketMeta, TcpFlags, TunnelType};
