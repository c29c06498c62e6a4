// Driver constants (no magic values)

/// QEMU system emulator binary
pub const QEMU_BINARY: &str = "qemu-system-x86_64";

/// Binary fingerprinted on Windows, where the emulator ignores `--version`
pub const QEMU_IMG_BINARY: &str = "qemu-img";

pub const QEMU_MACHINE_TYPE: &str = "pc";

/// Every forwarded port is forwarded for each of these, in this order
pub const PORT_FORWARD_PROTOCOLS: &[&str] = &["udp", "tcp"];

/// User-mode network backend id wired to the virtio NIC
pub const NETDEV_ID: &str = "user.0";
