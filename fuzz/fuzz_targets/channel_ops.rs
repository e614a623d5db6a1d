#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use capsule_kernel::types::HandleValue;
use capsule_kernel::Kernel;

#[derive(Debug, Arbitrary)]
enum Op {
    Create,
    Write { channel: u8, bytes: Vec<u8>, transfer: Option<u8> },
    Read { channel: u8, max_bytes: u16, max_handles: u8, discard: bool },
    Close { handle: u8 },
    Duplicate { handle: u8, rights: u32 },
}

// Any sequence of channel operations must keep the arena and the table in
// step, and an exiting process must leave nothing in its table.
fuzz_target!(|ops: Vec<Op>| {
    let kernel = Kernel::new().expect("kernel");
    {
        let ctx = kernel.create_host_process("fuzz").expect("host");
        let mut handles: Vec<HandleValue> = Vec::new();
        let pick = |handles: &Vec<HandleValue>, i: u8| handles.get(i as usize % handles.len().max(1)).copied();

        for op in ops.into_iter().take(256) {
            match op {
                Op::Create => {
                    if let Ok((a, b)) = ctx.sys_channel_create(0) {
                        handles.extend([a, b]);
                    }
                }
                Op::Write { channel, bytes, transfer } => {
                    let Some(channel) = pick(&handles, channel) else { continue };
                    let moved: Vec<HandleValue> = transfer.and_then(|t| pick(&handles, t)).into_iter().collect();
                    let _ = ctx.sys_channel_write(channel, 0, &bytes, &moved);
                }
                Op::Read { channel, max_bytes, max_handles, discard } => {
                    let Some(channel) = pick(&handles, channel) else { continue };
                    let options = if discard { capsule_kernel::types::CHANNEL_READ_MAY_DISCARD } else { 0 };
                    if let Ok(msg) = ctx.sys_channel_read(channel, options, max_bytes.into(), max_handles.into()) {
                        handles.extend(msg.handles);
                    }
                }
                Op::Close { handle } => {
                    if let Some(handle) = pick(&handles, handle) {
                        let _ = ctx.sys_handle_close(handle);
                    }
                }
                Op::Duplicate { handle, rights } => {
                    if let Some(handle) = pick(&handles, handle) {
                        if let Ok(dup) = ctx.sys_handle_duplicate(handle, rights) {
                            handles.push(dup);
                        }
                    }
                }
            }
        }
        assert!(kernel.arena().outstanding() >= ctx.handle_table().len());
        ctx.process().exit(0);
        assert!(ctx.handle_table().is_empty());
    }
});
