use std::cell::RefCell;
use std::rc::Rc;

use capsule_kernel::error::Status;
use capsule_kernel::kernel::{InfoTopic, ObjectInfo};
use capsule_kernel::object::{Dispatcher, ProcessState};
use capsule_kernel::testing::{init_tracing, run_local};
use capsule_kernel::types::{signals, HandleBasicInfo, HandleValue, ObjType, TIME_INFINITE};
use capsule_kernel::userboot::{self, message, BootstrapMessage};
use capsule_kernel::{Kernel, KernelConfig, ProcessContext};

// --- Helpers ---

fn basic_info(ctx: &ProcessContext, handle: HandleValue) -> HandleBasicInfo {
    match ctx.sys_object_get_info(handle, InfoTopic::HandleBasic) {
        Ok(ObjectInfo::HandleBasic(info)) => info,
        other => panic!("unexpected info {other:?}"),
    }
}

type Seen = Rc<RefCell<Option<(Vec<HandleBasicInfo>, BootstrapMessage)>>>;

/// Registers a `userboot` program that records what it finds on its bootstrap channel.
fn register_recording_userboot(kernel: &Rc<Kernel>) -> Seen {
    let seen: Seen = Rc::new(RefCell::new(None));
    let record = Rc::clone(&seen);
    kernel.register_program("userboot", move |ctx: ProcessContext, bootstrap: HandleValue| {
        let record = Rc::clone(&record);
        async move {
            let Ok(msg) = ctx.sys_channel_read(bootstrap, 0, 4096, userboot::HANDLE_COUNT as u32) else {
                return 1_i64;
            };
            let Ok(payload) = BootstrapMessage::decode(&msg.bytes) else {
                return 2;
            };
            let infos = msg.handles.iter().map(|&h| basic_info(&ctx, h)).collect();
            *record.borrow_mut() = Some((infos, payload));
            0
        }
    });
    seen
}

// --- Scenarios ---

#[tokio::test]
async fn create_write_read() {
    init_tracing();
    let kernel = Kernel::new().unwrap();
    let ctx = kernel.create_host_process("test").unwrap();

    let (a, b) = ctx.sys_channel_create(0).unwrap();
    assert_eq!(ctx.sys_channel_write(a, 0, &[1, 2, 3], &[]), Ok(()));
    let msg = ctx.sys_channel_read(b, 0, 64, 64).unwrap();
    assert_eq!(msg.bytes, vec![1, 2, 3]);
    assert!(msg.handles.is_empty());
    assert_eq!(ctx.sys_channel_read(b, 0, 64, 64).unwrap_err().status, Status::ShouldWait);
}

#[tokio::test]
async fn oversized_message_stays_queued() {
    let kernel = Kernel::new().unwrap();
    let ctx = kernel.create_host_process("test").unwrap();

    let (a, b) = ctx.sys_channel_create(0).unwrap();
    ctx.sys_channel_write(a, 0, &[7u8; 100], &[]).unwrap();
    let err = ctx.sys_channel_read(b, 0, 10, 0).unwrap_err();
    assert_eq!(err.status, Status::BufferTooSmall);
    assert_eq!((err.actual_bytes, err.actual_handles), (100, 0));
    assert_eq!(ctx.sys_channel_read(b, 0, 100, 0).unwrap().bytes, vec![7u8; 100]);
}

#[tokio::test]
async fn oversized_message_may_be_discarded() {
    let kernel = Kernel::new().unwrap();
    let ctx = kernel.create_host_process("test").unwrap();

    let (a, b) = ctx.sys_channel_create(0).unwrap();
    ctx.sys_channel_write(a, 0, &[7u8; 100], &[]).unwrap();
    ctx.sys_channel_write(a, 0, &[1u8; 4], &[]).unwrap();
    let err = ctx
        .sys_channel_read(b, capsule_kernel::types::CHANNEL_READ_MAY_DISCARD, 10, 0)
        .unwrap_err();
    assert_eq!(err.status, Status::BufferTooSmall);
    assert_eq!(ctx.sys_channel_read(b, 0, 10, 0).unwrap().bytes, vec![1u8; 4]);
}

#[tokio::test]
async fn handle_transfer_moves_the_endpoint() {
    let kernel = Kernel::new().unwrap();
    let ctx = kernel.create_host_process("test").unwrap();

    let (a, b) = ctx.sys_channel_create(0).unwrap();
    let (c, d) = ctx.sys_channel_create(0).unwrap();
    let c_koid = basic_info(&ctx, c).koid;

    ctx.sys_channel_write(a, 0, b"take this", &[c]).unwrap();
    assert_eq!(ctx.sys_handle_close(c), Err(Status::BadHandle));
    let msg = ctx.sys_channel_read(b, 0, 64, 4).unwrap();
    assert_eq!(msg.handles.len(), 1);

    let received = basic_info(&ctx, msg.handles[0]);
    assert_eq!(received.koid, c_koid);
    assert_eq!(received.koid, basic_info(&ctx, d).related_koid);
    assert_eq!(received.obj_type, ObjType::Channel);
    // The received handle reaches the same endpoint.
    ctx.sys_channel_write(msg.handles[0], 0, b"hi", &[]).unwrap();
    assert_eq!(ctx.sys_channel_read(d, 0, 8, 0).unwrap().bytes, b"hi");
}

#[tokio::test]
async fn bootstrap_delivers_self_and_root_job() {
    let kernel = Kernel::new().unwrap();
    let seen = register_recording_userboot(&kernel);
    kernel
        .run_until(async {
            let process = userboot::init(&kernel).unwrap();
            let children = kernel.root_job().child_processes();
            assert_eq!(children.len(), 1);
            assert!(Rc::ptr_eq(&children[0], &process));
            assert_eq!(process.state(), ProcessState::Running);
            // Only the bootstrap channel until the message is read.
            assert_eq!(process.handle_table().len(), 1);

            assert_eq!(process.wait_terminated().await, 0);
            let (infos, payload) = seen.borrow_mut().take().expect("userboot ran");
            assert_eq!(infos.len(), userboot::HANDLE_COUNT);
            assert_eq!(infos[userboot::PROC_SELF].obj_type, ObjType::Process);
            assert_eq!(infos[userboot::PROC_SELF].koid, process.koid());
            assert_eq!(infos[userboot::ROOT_JOB].obj_type, ObjType::Job);
            assert_eq!(infos[userboot::ROOT_JOB].koid, kernel.root_job().koid());
            assert_eq!(
                message::handle_info_kind(payload.handle_info[userboot::ROOT_JOB]),
                message::PA_JOB_DEFAULT
            );
        })
        .await;
}

#[test]
fn run_returns_once_the_root_job_is_childless() {
    init_tracing();
    let config = KernelConfig::from_json(r#"{ "userboot_args": ["--verbose"] }"#).unwrap();
    let kernel = Kernel::with_config(config).unwrap();
    let seen = register_recording_userboot(&kernel);

    run_local(kernel.run()).unwrap();

    let (_, payload) = seen.borrow_mut().take().expect("userboot ran");
    assert_eq!(payload.args, vec!["--verbose".to_string()]);
    assert!(kernel.root_job().child_processes().is_empty());
}

#[test]
fn child_processes_talk_over_channels() {
    let kernel = Kernel::new().unwrap();
    run_local(kernel.run_until(async {
        kernel.register_program("echo", |ctx: ProcessContext, channel: HandleValue| async move {
            if ctx
                .sys_object_wait_one(channel, signals::CHANNEL_READABLE, TIME_INFINITE)
                .await
                .is_err()
            {
                return -1_i64;
            }
            match ctx.sys_channel_read(channel, 0, 64, 0) {
                Ok(msg) => match ctx.sys_channel_write(channel, 0, &msg.bytes, &[]) {
                    Ok(()) => 0,
                    Err(status) => i64::from(status.into_raw()),
                },
                Err(err) => i64::from(err.status.into_raw()),
            }
        });

        let host = kernel.create_host_process("host").unwrap();
        let root = host.handle_table().add_handle(
            capsule_kernel::object::Handle::dup(
                kernel.root_job_handle(),
                capsule_kernel::rights::SAME_RIGHTS,
                kernel.arena(),
            )
            .unwrap(),
        );
        let child = host.sys_process_create(root, "echo", 0).unwrap();
        let (mine, theirs) = host.sys_channel_create(0).unwrap();
        host.sys_process_start(child, "echo", theirs, 0).unwrap();

        let reply = host
            .sys_channel_call(mine, TIME_INFINITE, b"\0\0\0\0marco", &[])
            .await
            .unwrap();
        assert_eq!(&reply.bytes[4..], b"marco");
        host.sys_object_wait_one(child, signals::PROCESS_TERMINATED, TIME_INFINITE)
            .await
            .unwrap();
    }));
}
