#![no_main]

use libfuzzer_sys::fuzz_target;
use capsule_kernel::error::Status;
use capsule_kernel::rights;
use capsule_kernel::Kernel;

// Arbitrary handle values presented to a process that owns a few real
// handles must either name one of them or fail with BAD_HANDLE.
fuzz_target!(|values: Vec<u32>| {
    let kernel = Kernel::new().expect("kernel");
    let owner = kernel.create_host_process("owner").expect("host");
    let forger = kernel.create_host_process("forger").expect("host");

    let (a, b) = owner.sys_channel_create(0).expect("channel");
    let port = owner.sys_port_create(0).expect("port");
    let real = [a, b, port];

    for value in values {
        let result = forger.sys_handle_duplicate(value, rights::SAME_RIGHTS);
        assert_eq!(result, Err(Status::BadHandle), "forged value {value:#x} resolved");
        if !real.contains(&value) {
            assert!(owner.sys_object_get_info(value, capsule_kernel::kernel::InfoTopic::HandleBasic).is_err());
        }
    }
});
