//! Integration tests for the desktop kernel
//!
//! Drives the full stack (bridge, linear memory, codec, bus, syscalls,
//! layered storage) the way the desktop does, on a single-threaded pool.
//! Every test builds its own kernel; nothing is shared.

use desktop_kernel::bridge::{BridgeError, HostBridge};
use desktop_kernel::kernel::{
    ExitStatus, Fd, FsEventKind, IoctlRequest, Kernel, MessageBus, OpenFlags, Pid, ProcessState,
    Registry, Reply, Request, SyscallError, TtySide,
};
use desktop_kernel::platform::StaticHost;
use desktop_kernel::protocol::{self, HEADER_SIZE, MAX_PATH_LEN, Message, MessageType, ProtocolError};
use desktop_kernel::vfs::{Origin, StaticSource};
use desktop_kernel::KernelConfig;
use futures::StreamExt;
use futures::executor::LocalPool;
use futures::task::LocalSpawnExt;
use std::rc::Rc;

const MANIFEST: &str = r#"[
    {"id":"docs","name":"docs","type":"folder"},
    {"id":"docs/readme.txt","name":"readme.txt","type":"file","contentPath":"/shadow/docs/readme.txt","size":4},
    {"id":"etc/motd","name":"motd","type":"file","contentPath":"/shadow/etc/motd"}
]"#;

/// A kernel with the standard shadow layer loaded, and the pool serving it
fn init_test() -> (LocalPool, HostBridge) {
    init_with_config(KernelConfig::default())
}

fn init_with_config(config: KernelConfig) -> (LocalPool, HostBridge) {
    let host = StaticHost::new()
        .with("/shadow-manifest.json", MANIFEST)
        .with("/shadow/docs/readme.txt", "base")
        .with("/shadow/etc/motd", "welcome\n");
    let (bridge, worker) = HostBridge::new(config, Rc::new(host));
    let mut pool = LocalPool::new();
    pool.spawner().spawn_local(worker.run()).unwrap();
    pool.run_until(bridge.initialize_once()).unwrap();
    (pool, bridge)
}

async fn write_file(bridge: &HostBridge, path: &str, data: &[u8]) {
    let fd = bridge.open(path, OpenFlags::WRITE).await.unwrap();
    bridge.write_all(fd, data).await.unwrap();
    bridge.close(fd).await.unwrap();
}

fn enoent() -> BridgeError {
    BridgeError::Syscall(SyscallError::NotFound)
}

// ============================================================================
// Files
// ============================================================================

#[test]
fn test_write_then_read_back() {
    let (mut pool, b) = init_test();
    pool.run_until(async {
        b.mkdir("/tmp").await.unwrap();
        write_file(&b, "/tmp/notes.txt", b"hello kernel").await;
        assert_eq!(b.read_file("/tmp/notes.txt").await.unwrap(), b"hello kernel");

        let meta = b.stat("/tmp/notes.txt").await.unwrap();
        assert_eq!(meta.size, 12);
        assert_eq!(meta.origin, Origin::Overlay);
    });
    assert_eq!(b.live_allocations(), 0);
}

#[test]
fn test_large_file_spans_several_messages() {
    let (mut pool, b) = init_test();
    let data: Vec<u8> = (0..3 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    pool.run_until(async {
        write_file(&b, "/big.bin", &data).await;
        assert_eq!(b.stat("/big.bin").await.unwrap().size, data.len() as u64);
        assert_eq!(b.read_file("/big.bin").await.unwrap(), data);
    });
}

#[test]
fn test_append() {
    let (mut pool, b) = init_test();
    pool.run_until(async {
        write_file(&b, "/log", b"one\n").await;
        let fd = b.open("/log", OpenFlags::APPEND).await.unwrap();
        b.write(fd, b"two\n").await.unwrap();
        b.close(fd).await.unwrap();
        assert_eq!(b.read_file("/log").await.unwrap(), b"one\ntwo\n");
    });
}

#[test]
fn test_exclusive_create() {
    let (mut pool, b) = init_test();
    pool.run_until(async {
        let flags = OpenFlags(OpenFlags::O_CREAT | OpenFlags::O_EXCL | OpenFlags::O_WRONLY);
        let fd = b.open("/x", flags).await.unwrap();
        b.close(fd).await.unwrap();
        assert_eq!(
            b.open("/x", flags).await,
            Err(BridgeError::Syscall(SyscallError::AlreadyExists))
        );
    });
}

#[test]
fn test_fd_lifecycle() {
    let (mut pool, b) = init_test();
    pool.run_until(async {
        let first = b.open("/docs/readme.txt", OpenFlags::READ).await.unwrap();
        assert!(first >= Fd::FIRST);
        b.close(first).await.unwrap();
        assert_eq!(
            b.read(first, 4).await,
            Err(BridgeError::Syscall(SyscallError::BadFd))
        );
        assert_eq!(
            b.close(first).await,
            Err(BridgeError::Syscall(SyscallError::BadFd))
        );

        let mut last = first;
        for _ in 0..5 {
            let fd = b.open("/docs/readme.txt", OpenFlags::READ).await.unwrap();
            assert!(fd > last);
            last = fd;
        }
    });
}

#[test]
fn test_directories() {
    let (mut pool, b) = init_test();
    pool.run_until(async {
        b.mkdir("/projects").await.unwrap();
        assert_eq!(
            b.mkdir("/projects").await,
            Err(BridgeError::Syscall(SyscallError::AlreadyExists))
        );
        write_file(&b, "/projects/a.txt", b"a").await;
        assert_eq!(
            b.rmdir("/projects").await,
            Err(BridgeError::Syscall(SyscallError::NotEmpty))
        );
        assert_eq!(
            b.open("/projects", OpenFlags::READ).await,
            Err(BridgeError::Syscall(SyscallError::IsADirectory))
        );

        let names: Vec<_> = b
            .read_dir("/")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["docs", "etc", "projects"]);

        b.unlink("/projects/a.txt").await.unwrap();
        b.rmdir("/projects").await.unwrap();
        assert_eq!(b.stat("/projects").await, Err(enoent()));
    });
}

// ============================================================================
// Rename
// ============================================================================

#[test]
fn test_rename_is_atomic() {
    let (mut pool, b) = init_test();
    pool.run_until(async {
        write_file(&b, "/a", b"payload").await;
        let before = b.stat("/a").await.unwrap();

        b.rename("/a", "/b").await.unwrap();
        assert_eq!(b.stat("/a").await, Err(enoent()));
        let after = b.stat("/b").await.unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.size, before.size);
        assert_eq!(after.kind, before.kind);
    });
}

#[test]
fn test_failed_rename_changes_nothing() {
    let (mut pool, b) = init_test();
    pool.run_until(async {
        write_file(&b, "/file", b"f").await;
        b.mkdir("/dir").await.unwrap();
        write_file(&b, "/dir/inner", b"i").await;

        assert_eq!(
            b.rename("/file", "/dir").await,
            Err(BridgeError::Syscall(SyscallError::IsADirectory))
        );
        assert_eq!(b.read_file("/file").await.unwrap(), b"f");
        assert_eq!(b.read_file("/dir/inner").await.unwrap(), b"i");

        assert_eq!(
            b.rename("/dir", "/dir/inner/deeper").await.map_err(|e| e.errno().is_some()),
            Err(true)
        );
        assert!(b.stat("/dir").await.unwrap().is_dir());
    });
}

#[test]
fn test_rename_shadow_file() {
    let (mut pool, b) = init_test();
    pool.run_until(async {
        b.rename("/docs/readme.txt", "/docs/README").await.unwrap();
        assert_eq!(b.stat("/docs/readme.txt").await, Err(enoent()));
        assert_eq!(b.read_file("/docs/README").await.unwrap(), b"base");
    });
}

#[test]
fn test_shadow_descriptor_survives_rename() {
    let (mut pool, b) = init_test();
    pool.run_until(async {
        let fd = b.open("/docs/readme.txt", OpenFlags::RDWR).await.unwrap();
        b.rename("/docs/readme.txt", "/docs/moved.txt").await.unwrap();
        assert_eq!(b.write(fd, b"X").await, Ok(1));
        b.close(fd).await.unwrap();
        assert_eq!(b.read_file("/docs/moved.txt").await.unwrap(), b"Xase");
    });
}

#[test]
fn test_fs_events_reach_subscribers() {
    let (mut pool, b) = init_test();
    let mut events = b.subscribe();
    pool.run_until(async {
        write_file(&b, "/docs/readme.txt", b"edited").await;
        b.unlink("/docs/readme.txt").await.unwrap();
        b.force_reload_from_shadow().await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let event = events.next().await.unwrap();
            seen.push((event.kind, event.path));
        }
        assert_eq!(
            seen,
            vec![
                (FsEventKind::Write, "/docs/readme.txt".to_string()),
                (FsEventKind::Delete, "/docs/readme.txt".to_string()),
                (FsEventKind::Changed, "/".to_string()),
            ]
        );
    });
}

// ============================================================================
// Layers
// ============================================================================

#[test]
fn test_overlay_precedence_and_reload() {
    let (mut pool, b) = init_test();
    pool.run_until(async {
        assert_eq!(b.read_file("/docs/readme.txt").await.unwrap(), b"base");
        assert_eq!(b.stat("/docs/readme.txt").await.unwrap().origin, Origin::Shadow);

        write_file(&b, "/docs/readme.txt", b"edited").await;
        assert_eq!(b.read_file("/docs/readme.txt").await.unwrap(), b"edited");
        let meta = b.stat("/docs/readme.txt").await.unwrap();
        assert_eq!(meta.origin, Origin::Overlay);
        assert!(meta.dirty);

        b.force_reload_from_shadow().await.unwrap();
        assert_eq!(b.read_file("/docs/readme.txt").await.unwrap(), b"base");
    });
}

#[test]
fn test_tombstone_masks_shadow() {
    let (mut pool, b) = init_test();
    pool.run_until(async {
        b.unlink("/docs/readme.txt").await.unwrap();
        assert_eq!(b.open("/docs/readme.txt", OpenFlags::READ).await, Err(enoent()));
        assert!(b.read_dir("/docs").await.unwrap().is_empty());

        b.force_reload_from_shadow().await.unwrap();
        assert_eq!(b.read_file("/docs/readme.txt").await.unwrap(), b"base");
    });
}

#[test]
fn test_reload_closes_descriptors() {
    let (mut pool, b) = init_test();
    pool.run_until(async {
        let fd = b.open("/etc/motd", OpenFlags::READ).await.unwrap();
        b.force_reload_from_shadow().await.unwrap();
        assert_eq!(
            b.read(fd, 4).await,
            Err(BridgeError::Syscall(SyscallError::BadFd))
        );
    });
}

#[test]
fn test_export_and_import_overlay() {
    let (mut pool, b) = init_test();
    pool.run_until(async {
        write_file(&b, "/docs/readme.txt", b"edited").await;
        b.mkdir("/home").await.unwrap();
        b.unlink("/etc/motd").await.unwrap();
        let snapshot = b.export_overlay().await.unwrap();

        b.force_reload_from_shadow().await.unwrap();
        assert_eq!(b.read_file("/docs/readme.txt").await.unwrap(), b"base");

        b.import_overlay(&snapshot).await.unwrap();
        assert_eq!(b.read_file("/docs/readme.txt").await.unwrap(), b"edited");
        assert!(b.stat("/home").await.unwrap().is_dir());
        assert_eq!(b.stat("/etc/motd").await, Err(enoent()));

        assert_eq!(
            b.import_overlay(b"{not json").await,
            Err(BridgeError::Syscall(SyscallError::InvalidArgument))
        );
    });
}

#[test]
fn test_quota_exhaustion_is_fatal() {
    let config = KernelConfig {
        overlay_quota: Some(8),
        ..KernelConfig::default()
    };
    let (mut pool, b) = init_with_config(config);
    pool.run_until(async {
        let fd = b.open("/big", OpenFlags::WRITE).await.unwrap();
        assert_eq!(
            b.write(fd, b"more than eight bytes").await,
            Err(BridgeError::Fatal(SyscallError::OutOfMemory))
        );
        assert!(b.is_poisoned());
        assert_eq!(b.stat("/").await, Err(BridgeError::Poisoned));
    });
    assert_eq!(b.live_allocations(), 0);
}

// ============================================================================
// Processes and tty
// ============================================================================

#[test]
fn test_orphans_are_reaped_by_init() {
    let config = KernelConfig {
        max_processes: 3,
        ..KernelConfig::default()
    };
    let (mut pool, b) = init_with_config(config);
    pool.run_until(async {
        let shell = b.spawn("shell", None).await.unwrap();
        let job = b.spawn("job", Some(shell)).await.unwrap();
        b.kill(shell).await.unwrap();
        b.wait(shell).await.unwrap();
        b.exit(job, 0).await.unwrap();

        assert_eq!(
            b.wait(job).await,
            Err(BridgeError::Syscall(SyscallError::NoProcess))
        );
        let pids: Vec<Pid> = b.list().await.unwrap().iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![Pid::INIT]);
        b.spawn("a", None).await.unwrap();
        b.spawn("b", None).await.unwrap();
    });
}

#[test]
fn test_process_list_shows_descriptors() {
    let (mut pool, b) = init_test();
    pool.run_until(async {
        let fd = b.open("/etc/motd", OpenFlags::READ).await.unwrap();
        let list = b.list().await.unwrap();
        assert_eq!(list[0].fds, vec![fd]);

        b.close(fd).await.unwrap();
        assert!(b.list().await.unwrap()[0].fds.is_empty());
    });
}

#[test]
fn test_process_lifecycle() {
    let (mut pool, b) = init_test();
    pool.run_until(async {
        let editor = b.spawn("editor", None).await.unwrap();
        let shell = b.spawn("shell", None).await.unwrap();
        assert!(shell > editor);

        b.kill(editor).await.unwrap();
        let list = b.list().await.unwrap();
        let entry = list.iter().find(|p| p.pid == editor).unwrap();
        assert_eq!(entry.state, ProcessState::Exited(ExitStatus::Killed));
        assert_eq!(b.wait(editor).await, Ok(ExitStatus::Killed));
        assert_eq!(
            b.wait(editor).await,
            Err(BridgeError::Syscall(SyscallError::NoProcess))
        );

        assert_eq!(
            b.wait(shell).await,
            Err(BridgeError::Syscall(SyscallError::WouldBlock))
        );
        b.exit(shell, 0).await.unwrap();
        assert_eq!(b.wait_blocking(shell).await, Ok(ExitStatus::Code(0)));
    });
}

#[test]
fn test_tty_line_discipline() {
    let (mut pool, b) = init_test();
    pool.run_until(async {
        b.tty_write(TtySide::Input, b"lx\x7fs -l\r").await.unwrap();
        assert_eq!(b.tty_read(TtySide::Input, 64).await.unwrap(), b"ls -l\n");
        assert_eq!(
            b.tty_read(TtySide::Input, 64).await,
            Err(BridgeError::Syscall(SyscallError::WouldBlock))
        );

        let size = b.ioctl(IoctlRequest::Tiocgwinsz, &[]).await.unwrap();
        assert_eq!(size, [24, 0, 80, 0]);
        assert_eq!(
            b.ioctl(IoctlRequest::Tiocswinsz, &[0, 0, 80, 0]).await,
            Err(BridgeError::Syscall(SyscallError::InvalidArgument))
        );
    });
}

// ============================================================================
// Wire level
// ============================================================================

#[test]
fn test_path_bound() {
    let longest = format!("/{}", "a".repeat(MAX_PATH_LEN - 1));
    let msg = Message::new(MessageType::FsStat).with_path(longest.clone());
    let decoded = protocol::decode(&protocol::encode(&msg).unwrap()).unwrap();
    assert_eq!(decoded.path, longest);

    let too_long = format!("/{}", "a".repeat(MAX_PATH_LEN));
    let msg = Message::new(MessageType::FsStat).with_path(too_long.clone());
    assert_eq!(
        protocol::encode(&msg),
        Err(ProtocolError::PathTooLong { len: 256 })
    );

    let (mut pool, b) = init_test();
    pool.run_until(async {
        assert_eq!(
            b.stat(&too_long).await,
            Err(BridgeError::Protocol(ProtocolError::PathTooLong { len: 256 }))
        );
    });
}

#[test]
fn test_malformed_buffers_rejected() {
    let good = protocol::encode(&Request::List.to_message()).unwrap();
    assert!(matches!(
        protocol::decode(&good[..10]),
        Err(ProtocolError::Truncated { len: 10 })
    ));

    let mut bad_version = good.clone();
    bad_version[0] = 9;
    assert!(matches!(
        protocol::decode(&bad_version),
        Err(ProtocolError::BadVersion(9))
    ));

    let mut bad_type = good.clone();
    bad_type[4] = 0xEE;
    assert!(matches!(
        protocol::decode(&bad_type),
        Err(ProtocolError::UnknownType(0xEE))
    ));

    let mut extra = good.clone();
    extra.push(0);
    assert!(matches!(
        protocol::decode(&extra),
        Err(ProtocolError::LengthMismatch { declared: 0, actual: 1 })
    ));
    assert_eq!(good.len(), HEADER_SIZE);
}

#[test]
fn test_bus_errors() {
    let kernel = Kernel::new(&KernelConfig::default(), Box::new(StaticSource::new()));
    let mut bus = MessageBus::with_registry(kernel, Registry::new());
    let response = bus.dispatch(Message::new(MessageType::FsStat).with_path("/"));
    assert_eq!(response.error_code().map(|(code, _)| code), Some(SyscallError::ENOSYS));

    let kernel = Kernel::new(&KernelConfig::default(), Box::new(StaticSource::new()));
    let mut bus = MessageBus::new(kernel);
    let response = bus.dispatch(Message::new(MessageType::FsRead).with_data(vec![1, 2, 3]));
    assert_eq!(response.error_code().map(|(code, _)| code), Some(SyscallError::EINVAL));

    let response = bus.dispatch(Request::List.to_message());
    assert!(!response.is_error());
    let Reply::Processes(list) = Reply::decode(MessageType::ProcList, &response.data).unwrap()
    else {
        panic!("expected a process list");
    };
    assert_eq!(list.len(), 1);
}
