//!
//! Layout of the payload carried by the bootstrap message.
//!
//! ```text
//! offset  size  field
//! 0       4     protocol magic
//! 4       4     version
//! 8       4     handle count (n)
//! 12      4     argument count
//! 16      4*n   handle info words, one per transferred handle
//! ...           arguments, each NUL-terminated
//! ```
//!
//! Every integer is little-endian.

use crate::error::{KernelResult, Status};
use crate::types::CHANNEL_MAX_MSG_BYTES;

pub const PROTOCOL: u32 = 0x4150_585d;
pub const VERSION: u32 = 0x0000_1000;

/// Handle role: the receiving process itself.
pub const PA_PROC_SELF: u32 = 0x01;
/// Handle role: the job new processes should be created under.
pub const PA_JOB_DEFAULT: u32 = 0x03;

const HEADER_SIZE: usize = 16;

/// Packs a handle role and its argument into one info word.
pub const fn handle_info(kind: u32, arg: u32) -> u32 {
    (kind & 0xff) | ((arg & 0xffff) << 16)
}

/// Role of a handle info word.
pub const fn handle_info_kind(info: u32) -> u32 {
    info & 0xff
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapMessage {
    /// Parallel to the message's handle array.
    pub handle_info: Vec<u32>,
    pub args: Vec<String>,
}

impl BootstrapMessage {
    pub fn encode(&self) -> KernelResult<Vec<u8>> {
        if self.args.iter().any(|arg| arg.as_bytes().contains(&0)) {
            return Err(Status::InvalidArgs);
        }
        let args_len: usize = self.args.iter().map(|arg| arg.len() + 1).sum();
        let size = HEADER_SIZE + 4 * self.handle_info.len() + args_len;
        if size > CHANNEL_MAX_MSG_BYTES as usize {
            return Err(Status::OutOfRange);
        }

        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(&PROTOCOL.to_le_bytes());
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&(self.handle_info.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.args.len() as u32).to_le_bytes());
        for info in &self.handle_info {
            out.extend_from_slice(&info.to_le_bytes());
        }
        for arg in &self.args {
            out.extend_from_slice(arg.as_bytes());
            out.push(0);
        }
        Ok(out)
    }

    /// Fails with `INVALID_ARGS` on a wrong magic or version, truncated
    /// data, or arguments that are not UTF-8.
    pub fn decode(bytes: &[u8]) -> KernelResult<Self> {
        let mut reader = Reader { bytes, pos: 0 };
        if reader.u32()? != PROTOCOL || reader.u32()? != VERSION {
            return Err(Status::InvalidArgs);
        }
        let handle_count = reader.u32()? as usize;
        let arg_count = reader.u32()? as usize;

        let mut handle_info = Vec::with_capacity(handle_count.min(64));
        for _ in 0..handle_count {
            handle_info.push(reader.u32()?);
        }
        let mut args = Vec::with_capacity(arg_count.min(64));
        for _ in 0..arg_count {
            args.push(reader.c_str()?);
        }
        Ok(BootstrapMessage { handle_info, args })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn u32(&mut self) -> KernelResult<u32> {
        let chunk = self
            .bytes
            .get(self.pos..self.pos + 4)
            .ok_or(Status::InvalidArgs)?;
        self.pos += 4;
        Ok(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }

    fn c_str(&mut self) -> KernelResult<String> {
        let rest = self.bytes.get(self.pos..).ok_or(Status::InvalidArgs)?;
        let len = rest.iter().position(|&b| b == 0).ok_or(Status::InvalidArgs)?;
        let arg = std::str::from_utf8(&rest[..len]).map_err(|_| Status::InvalidArgs)?;
        self.pos += len + 1;
        Ok(arg.to_string())
    }
}
