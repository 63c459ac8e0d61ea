//! The [`PacketSource`] trait.
use std::collections::VecDeque;

use crate::{ConnectionLost, Result, tds::Packet};

/// A source of packets addressed to one logical stream.
pub trait PacketSource: Send {
    /// Receive the next packet of this logical stream.
    ///
    /// Implementor should wait until a packet arrives, and return
    /// [`ConnectionLost`] when no packet will ever arrive.
    fn recv_packet(&mut self) -> impl Future<Output = Result<Packet>> + Send;
}

impl<P> PacketSource for &mut P where P: PacketSource {
    fn recv_packet(&mut self) -> impl Future<Output = Result<Packet>> + Send {
        P::recv_packet(self)
    }
}

/// Packets already in memory.
impl PacketSource for VecDeque<Packet> {
    fn recv_packet(&mut self) -> impl Future<Output = Result<Packet>> + Send {
        let packet = self.pop_front();
        async move { packet.ok_or_else(|| ConnectionLost.into()) }
    }
}
