//! The unit exchanged over a channel: a bounded payload plus transferred handles.

use crate::error::{KernelResult, Status};
use crate::object::handle::HandleOwner;
use crate::types::{Txid, CHANNEL_MAX_MSG_BYTES, CHANNEL_MAX_MSG_HANDLES};

/// Bytes of the payload occupied by the transaction id.
pub const TXID_SIZE: usize = std::mem::size_of::<Txid>();

/// A queued message. The packet owns its handles until a reader takes them,
/// at which point they move into the reader's handle table.
#[derive(Debug)]
pub struct MessagePacket {
    data: Vec<u8>,
    handles: Vec<HandleOwner>,
}

impl MessagePacket {
    /// Fails with `OUT_OF_RANGE` past 65536 bytes or 64 handles. On failure
    /// the handles are dropped, which closes them.
    pub fn create(data: Vec<u8>, handles: Vec<HandleOwner>) -> KernelResult<Self> {
        if data.len() > CHANNEL_MAX_MSG_BYTES as usize || handles.len() > CHANNEL_MAX_MSG_HANDLES as usize {
            return Err(Status::OutOfRange);
        }
        Ok(MessagePacket { data, handles })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_size(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn num_handles(&self) -> u32 {
        self.handles.len() as u32
    }

    pub fn handles(&self) -> &[HandleOwner] {
        &self.handles
    }

    /// The little-endian transaction id in the first four bytes, or 0 for
    /// messages too short to carry one.
    pub fn txid(&self) -> Txid {
        match self.data.get(..TXID_SIZE) {
            Some(bytes) => Txid::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            None => 0,
        }
    }

    pub(crate) fn set_txid(&mut self, txid: Txid) {
        if let Some(bytes) = self.data.get_mut(..TXID_SIZE) {
            bytes.copy_from_slice(&txid.to_le_bytes());
        }
    }

    /// Splits the packet, handing ownership of the handles to the caller.
    pub fn into_parts(self) -> (Vec<u8>, Vec<HandleOwner>) {
        (self.data, self.handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_are_inclusive() {
        assert!(MessagePacket::create(vec![0; CHANNEL_MAX_MSG_BYTES as usize], Vec::new()).is_ok());
        assert_eq!(
            MessagePacket::create(vec![0; CHANNEL_MAX_MSG_BYTES as usize + 1], Vec::new()).err(),
            Some(Status::OutOfRange)
        );
    }

    #[test]
    fn txid_occupies_leading_bytes() {
        let mut packet = MessagePacket::create(vec![0xaa; 8], Vec::new()).expect("packet");
        packet.set_txid(0x8000_0102);
        assert_eq!(packet.txid(), 0x8000_0102);
        assert_eq!(&packet.data()[..4], &[0x02, 0x01, 0x00, 0x80]);
        assert_eq!(&packet.data()[4..], &[0xaa; 4]);

        let short = MessagePacket::create(vec![1, 2], Vec::new()).expect("packet");
        assert_eq!(short.txid(), 0);
    }
}
