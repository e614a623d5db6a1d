use proptest::prelude::*;
use capsule_kernel::error::Status;
use capsule_kernel::Kernel;

proptest! {
    /// Messages written from one endpoint are read from the peer in order.
    #[test]
    fn prop_channel_is_fifo(messages in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..128), 0..32)) {
        let kernel = Kernel::new().expect("kernel");
        let ctx = kernel.create_host_process("fifo").expect("host");
        let (a, b) = ctx.sys_channel_create(0).expect("channel");
        for msg in &messages {
            prop_assert_eq!(ctx.sys_channel_write(a, 0, msg, &[]), Ok(()));
        }
        for msg in &messages {
            let read = ctx.sys_channel_read(b, 0, 128, 0).expect("read");
            prop_assert_eq!(&read.bytes, msg);
        }
        prop_assert_eq!(ctx.sys_channel_read(b, 0, 128, 0).unwrap_err().status, Status::ShouldWait);
    }

    /// Once an endpoint is closed its peer drains what is queued, then sees PEER_CLOSED.
    #[test]
    fn prop_peer_closed_after_drain(queued in 0usize..8) {
        let kernel = Kernel::new().expect("kernel");
        let ctx = kernel.create_host_process("closer").expect("host");
        let (a, b) = ctx.sys_channel_create(0).expect("channel");
        for i in 0..queued {
            ctx.sys_channel_write(a, 0, &[i as u8], &[]).expect("write");
        }
        ctx.sys_handle_close(a).expect("close");

        prop_assert_eq!(ctx.sys_channel_write(b, 0, b"late", &[]), Err(Status::PeerClosed));
        for i in 0..queued {
            prop_assert_eq!(ctx.sys_channel_read(b, 0, 8, 0).expect("queued").bytes, vec![i as u8]);
        }
        prop_assert_eq!(ctx.sys_channel_read(b, 0, 8, 0).unwrap_err().status, Status::PeerClosed);
    }
}
