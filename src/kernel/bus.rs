//! Message bus
//!
//! Routes decoded messages to handlers by type. Handlers are registered
//! against a capability `{component, action}`; registration checks that the
//! action belongs to the component and that nothing else claimed it.
//!
//! Dispatch is synchronous and never panics on bad input: unknown types,
//! malformed payloads and handler failures all become error responses.
//! After a fatal error the bus answers everything with a fatal `ENOMEM`.

use super::errno::{SyscallError, SyscallResult};
use super::request::{Reply, Request};
use super::syscall::Kernel;
use crate::protocol::{Component, MAX_DATA_LEN, Message, MessageType, ProtocolError, codec};
use std::collections::HashMap;
use thiserror::Error;

/// Handler entry point
pub type HandlerFn = fn(&mut Kernel, Request) -> SyscallResult<Reply>;

/// What a handler is registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capability {
    pub component: Component,
    pub action: MessageType,
}

impl Capability {
    /// The capability of an action within its own component
    pub fn of(action: MessageType) -> Self {
        Self {
            component: action.component(),
            action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("{action} does not belong to component {component}")]
    ComponentMismatch {
        component: Component,
        action: MessageType,
    },
    #[error("a handler for {0} is already registered")]
    Duplicate(MessageType),
}

#[derive(Default)]
pub struct Registry {
    handlers: HashMap<MessageType, HandlerFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, cap: Capability, handler: HandlerFn) -> Result<(), RegistryError> {
        if cap.action.component() != cap.component {
            return Err(RegistryError::ComponentMismatch {
                component: cap.component,
                action: cap.action,
            });
        }
        if self.handlers.contains_key(&cap.action) {
            return Err(RegistryError::Duplicate(cap.action));
        }
        self.handlers.insert(cap.action, handler);
        Ok(())
    }

    pub fn handler(&self, kind: MessageType) -> Option<HandlerFn> {
        self.handlers.get(&kind).copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registry with a handler for every message type
    pub fn standard() -> Self {
        let mut registry = Registry::new();
        for action in MessageType::ALL {
            let handler: HandlerFn = match action.component() {
                Component::Fs => handle_fs,
                Component::Proc => handle_proc,
                Component::Tty => handle_tty,
                Component::Layer => handle_layer,
            };
            if let Err(e) = registry.register(Capability::of(action), handler) {
                log::error!("standard registry: {}", e);
            }
        }
        registry
    }
}

// ========== HANDLERS ==========

fn handle_fs(k: &mut Kernel, req: Request) -> SyscallResult<Reply> {
    match req {
        Request::Open { path, flags, mode } => k.sys_open(&path, flags, mode).map(Reply::Fd),
        Request::Read { fd, count } => k.sys_read(fd, count).map(Reply::Bytes),
        Request::Write { fd, data } => k.sys_write(fd, &data).map(|n| Reply::Count(n as u32)),
        Request::Close { fd } => k.sys_close(fd).map(|_| Reply::Done),
        Request::Stat { path } => k.sys_stat(&path).map(Reply::Stat),
        Request::Mkdir { path, mode } => k.sys_mkdir(&path, mode).map(|_| Reply::Done),
        Request::Rmdir { path } => k.sys_rmdir(&path).map(|_| Reply::Done),
        Request::Unlink { path } => k.sys_unlink(&path).map(|_| Reply::Done),
        Request::Rename { from, to } => k.sys_rename(&from, &to).map(|_| Reply::Done),
        Request::ReadDir { path } => k.sys_readdir(&path).map(Reply::Entries),
        _ => Err(SyscallError::InvalidArgument),
    }
}

fn handle_proc(k: &mut Kernel, req: Request) -> SyscallResult<Reply> {
    match req {
        Request::Spawn { parent, command } => k.sys_spawn(&command, parent).map(Reply::Pid),
        Request::Kill { pid } => k.sys_kill(pid).map(|_| Reply::Done),
        Request::Wait { pid } => k.sys_wait(pid).map(Reply::Status),
        Request::List => Ok(Reply::Processes(k.sys_list())),
        Request::Exit { pid, code } => k.sys_exit(pid, code).map(|_| Reply::Done),
        _ => Err(SyscallError::InvalidArgument),
    }
}

fn handle_tty(k: &mut Kernel, req: Request) -> SyscallResult<Reply> {
    match req {
        Request::TtyRead { side, count } => k.sys_tty_read(side, count).map(Reply::Bytes),
        Request::TtyWrite { side, data } => k
            .sys_tty_write(side, &data)
            .map(|n| Reply::Count(n as u32)),
        Request::Ioctl { request, arg } => k.sys_ioctl(request, &arg).map(Reply::Bytes),
        _ => Err(SyscallError::InvalidArgument),
    }
}

fn handle_layer(k: &mut Kernel, req: Request) -> SyscallResult<Reply> {
    match req {
        Request::LoadManifest(manifest) => k.load_manifest(&manifest).map(Reply::Loaded),
        Request::Reload => {
            k.force_reload();
            Ok(Reply::Done)
        }
        Request::Hydrate { location, data } => {
            k.hydrate(&location, data);
            Ok(Reply::Done)
        }
        Request::Export => k.export_overlay().map(Reply::Bytes),
        Request::Import(snapshot) => k.import_overlay(&snapshot).map(|_| Reply::Done),
        _ => Err(SyscallError::InvalidArgument),
    }
}

// ========== BUS ==========

pub struct MessageBus {
    kernel: Kernel,
    registry: Registry,
    poisoned: bool,
}

impl MessageBus {
    pub fn new(kernel: Kernel) -> Self {
        Self::with_registry(kernel, Registry::standard())
    }

    pub fn with_registry(kernel: Kernel, registry: Registry) -> Self {
        Self {
            kernel,
            registry,
            poisoned: false,
        }
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut Kernel {
        &mut self.kernel
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Route one message to its handler and build the response
    pub fn dispatch(&mut self, msg: Message) -> Message {
        let reply_to = Message::new(msg.kind)
            .with_seq(msg.seq)
            .with_path(msg.path.clone());

        if self.poisoned {
            return reply_to.respond_error(SyscallError::ENOMEM, "", true);
        }
        if msg.is_response() {
            log::debug!("{} seq {}: request carries response flag", msg.kind, msg.seq);
            return reply_to.respond_error(SyscallError::EINVAL, "", false);
        }
        let Some(handler) = self.registry.handler(msg.kind) else {
            log::debug!("{}: no handler registered", msg.kind);
            return reply_to.respond_error(SyscallError::ENOSYS, "", false);
        };

        log::trace!("dispatch {} seq {} path {:?}", msg.kind, msg.seq, msg.path);
        let result = Request::parse(msg)
            .and_then(|request| handler(&mut self.kernel, request))
            .map(|reply| reply.encode())
            .and_then(|data| {
                if data.len() > MAX_DATA_LEN {
                    log::warn!("{}: reply of {} bytes exceeds the payload limit", reply_to.kind, data.len());
                    return Err(SyscallError::InvalidArgument);
                }
                Ok(data)
            });

        match result {
            Ok(data) => reply_to.respond(data),
            Err(err) => {
                if err.is_fatal() {
                    log::error!("{} seq {}: fatal {}, bus poisoned", reply_to.kind, reply_to.seq, err);
                    self.poisoned = true;
                } else {
                    log::debug!("{} seq {}: {} ({})", reply_to.kind, reply_to.seq, err.name(), err);
                }
                reply_to.respond_error(err.code(), err.detail(), err.is_fatal())
            }
        }
    }

    /// Decode, dispatch and encode; malformed buffers never reach a handler
    pub fn dispatch_bytes(&mut self, bytes: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let msg = codec::decode(bytes)?;
        let response = self.dispatch(msg);
        codec::encode(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::kernel::fd::OpenFlags;
    use crate::vfs::StaticSource;

    fn setup_bus() -> MessageBus {
        let source = StaticSource::new().with("/shadow/etc/motd", "welcome");
        let mut kernel = Kernel::new(&KernelConfig::default(), Box::new(source));
        let manifest = crate::vfs::ShadowManifest::from_json(
            br#"[{"id":"etc/motd","name":"motd","type":"file","contentPath":"/shadow/etc/motd"}]"#,
        )
        .unwrap();
        kernel.load_manifest(&manifest).unwrap();
        MessageBus::new(kernel)
    }

    fn call(bus: &mut MessageBus, request: Request) -> Message {
        bus.dispatch(request.to_message().with_seq(42))
    }

    #[test]
    fn test_standard_registry_covers_every_type() {
        let registry = Registry::standard();
        assert_eq!(registry.len(), MessageType::ALL.len());
    }

    #[test]
    fn test_registry_rejects_mismatch_and_duplicates() {
        let mut registry = Registry::new();
        let wrong = Capability {
            component: Component::Tty,
            action: MessageType::FsRead,
        };
        assert_eq!(
            registry.register(wrong, handle_fs),
            Err(RegistryError::ComponentMismatch {
                component: Component::Tty,
                action: MessageType::FsRead
            })
        );
        registry
            .register(Capability::of(MessageType::FsRead), handle_fs)
            .unwrap();
        assert_eq!(
            registry.register(Capability::of(MessageType::FsRead), handle_fs),
            Err(RegistryError::Duplicate(MessageType::FsRead))
        );
    }

    #[test]
    fn test_dispatch_open_and_read() {
        let mut bus = setup_bus();
        let resp = call(
            &mut bus,
            Request::Open {
                path: "/etc/motd".into(),
                flags: OpenFlags::O_RDONLY,
                mode: 0,
            },
        );
        assert!(resp.is_response() && !resp.is_error());
        assert_eq!(resp.seq, 42);
        assert_eq!(resp.path, "/etc/motd");
        let Reply::Fd(fd) = Reply::decode(resp.kind, &resp.data).unwrap() else {
            panic!("expected fd reply");
        };

        let resp = call(&mut bus, Request::Read { fd, count: 64 });
        assert_eq!(resp.data, b"welcome");
    }

    #[test]
    fn test_unknown_handler_is_enosys() {
        let kernel = Kernel::new(&KernelConfig::default(), Box::new(StaticSource::new()));
        let mut bus = MessageBus::with_registry(kernel, Registry::new());
        let resp = call(&mut bus, Request::List);
        assert_eq!(resp.error_code(), Some((SyscallError::ENOSYS, String::new())));
        assert!(!resp.is_fatal());
        assert!(!bus.is_poisoned());
    }

    #[test]
    fn test_bad_payload_is_einval() {
        let mut bus = setup_bus();
        let msg = Message::new(MessageType::FsRead).with_data(vec![1, 2, 3]);
        let resp = bus.dispatch(msg);
        assert_eq!(resp.error_code(), Some((SyscallError::EINVAL, String::new())));
    }

    #[test]
    fn test_response_flag_is_rejected() {
        let mut bus = setup_bus();
        let msg = Message::new(MessageType::ProcList).respond(Vec::new());
        let resp = bus.dispatch(msg);
        assert_eq!(resp.error_code().map(|(c, _)| c), Some(SyscallError::EINVAL));
    }

    #[test]
    fn test_errors_carry_errno() {
        let mut bus = setup_bus();
        let resp = call(
            &mut bus,
            Request::Stat {
                path: "/missing".into(),
            },
        );
        assert!(resp.is_error());
        assert_eq!(resp.error_code().map(|(c, _)| c), Some(SyscallError::ENOENT));
    }

    #[test]
    fn test_fatal_error_poisons_bus() {
        let config = KernelConfig {
            overlay_quota: Some(2),
            ..KernelConfig::default()
        };
        let kernel = Kernel::new(&config, Box::new(StaticSource::new()));
        let mut bus = MessageBus::new(kernel);
        let resp = call(
            &mut bus,
            Request::Open {
                path: "/f".into(),
                flags: OpenFlags::O_CREAT | OpenFlags::O_WRONLY,
                mode: 0,
            },
        );
        let Ok(Reply::Fd(fd)) = Reply::decode(resp.kind, &resp.data) else {
            panic!("open failed: {:?}", resp.error_code());
        };

        let resp = call(
            &mut bus,
            Request::Write {
                fd,
                data: b"too long".to_vec(),
            },
        );
        assert!(resp.is_fatal());
        assert!(bus.is_poisoned());

        let resp = call(&mut bus, Request::List);
        assert!(resp.is_fatal());
        assert_eq!(resp.error_code().map(|(c, _)| c), Some(SyscallError::ENOMEM));
    }

    #[test]
    fn test_dispatch_bytes() {
        let mut bus = setup_bus();
        let bytes = codec::encode(&Request::List.to_message().with_seq(5)).unwrap();
        let resp = codec::decode(&bus.dispatch_bytes(&bytes).unwrap()).unwrap();
        assert_eq!(resp.seq, 5);
        let Reply::Processes(list) = Reply::decode(resp.kind, &resp.data).unwrap() else {
            panic!("expected process list");
        };
        assert_eq!(list.len(), 1);

        assert!(matches!(
            bus.dispatch_bytes(&[0u8; 10]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_content_pending_detail() {
        let mut kernel = Kernel::new(
            &KernelConfig::default(),
            Box::new(crate::vfs::DeferredSource),
        );
        let manifest = crate::vfs::ShadowManifest::from_json(
            br#"[{"id":"a.txt","name":"a.txt","type":"file","contentPath":"/content/a.txt"}]"#,
        )
        .unwrap();
        kernel.load_manifest(&manifest).unwrap();
        let mut bus = MessageBus::new(kernel);
        let resp = call(
            &mut bus,
            Request::Stat {
                path: "/a.txt".into(),
            },
        );
        assert_eq!(
            resp.error_code(),
            Some((SyscallError::ENODATA, "/content/a.txt".to_string()))
        );
    }
}
