//! desktop-kernel CLI
//!
//! A REPL driving a kernel through the host bridge, with a directory on
//! disk as the shadow layer. Changes live in the overlay and vanish on
//! exit unless exported.
//!
//! Usage: `kernel-cli [shadow-dir]`

use desktop_kernel::bridge::{BridgeError, HostBridge};
use desktop_kernel::kernel::{Pid, ProcessState, TtySide};
use desktop_kernel::platform::native::NativeHost;
use desktop_kernel::vfs::{NodeKind, Origin};
use desktop_kernel::{KernelConfig, logging};
use futures::executor::LocalPool;
use futures::task::LocalSpawnExt;
use std::io::{self, BufRead, Write};
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Error)]
enum CliError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

enum Flow {
    Continue,
    Exit,
}

const HELP: &str = "\
commands:
  ls [path]            list a directory
  cat <path>           print a file
  write <path> <text>  replace a file's contents
  rm <path>            remove a file
  rmdir <path>         remove an empty directory
  mkdir <path>         create a directory
  mv <from> <to>       rename
  stat <path>          show metadata
  ps                   list processes
  spawn <command>      start a process
  kill <pid>           kill a process
  wait <pid>           reap an exited process
  tty <text>           type a line into the terminal
  reload               discard all overlay changes
  export [file]        dump the overlay snapshot
  help                 show this help
  exit                 leave";

fn main() {
    logging::init(log::LevelFilter::Warn);

    let shadow_dir = std::env::args().nth(1).unwrap_or_else(|| "shadow".to_string());
    let config = KernelConfig::default();
    let host = Rc::new(NativeHost::new(&shadow_dir, config.manifest_url.clone()));
    let (bridge, worker) = HostBridge::new(config, host);

    let mut pool = LocalPool::new();
    if let Err(e) = pool.spawner().spawn_local(worker.run()) {
        eprintln!("kernel-cli: cannot start kernel worker: {}", e);
        return;
    }

    println!("desktop-kernel v{}", env!("CARGO_PKG_VERSION"));
    println!("Type 'help' for available commands.\n");
    pool.run_until(repl(&bridge, &shadow_dir));
}

async fn repl(bridge: &HostBridge, shadow_dir: &str) {
    match bridge.initialize_once().await {
        Ok(_) => log::info!("shadow layer: {}", shadow_dir),
        Err(e) => eprintln!("shadow layer {} unavailable: {}", shadow_dir, e),
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("$ ");
        let _ = stdout.flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                println!();
                break;
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                break;
            }
        }

        let words: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = words.first() else {
            continue;
        };
        match run(bridge, command, &words[1..]).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Exit) => break,
            Err(e) => eprintln!("{}: {}", command, e),
        }
        if bridge.is_poisoned() {
            eprintln!("kernel stopped after a fatal error");
            break;
        }
    }
}

async fn run(bridge: &HostBridge, command: &str, args: &[&str]) -> Result<Flow, CliError> {
    match (command, args) {
        ("exit" | "quit", _) => return Ok(Flow::Exit),
        ("help", _) => println!("{}", HELP),
        ("ls", []) => ls(bridge, "/").await?,
        ("ls", [path]) => ls(bridge, path).await?,
        ("cat", [path]) => {
            let bytes = bridge.read_file(path).await?;
            print!("{}", String::from_utf8_lossy(&bytes));
            if !bytes.ends_with(b"\n") {
                println!();
            }
        }
        ("write", [path, text @ ..]) if !text.is_empty() => {
            let mut contents = text.join(" ");
            contents.push('\n');
            bridge.safe_write(path, contents.as_bytes()).await?;
        }
        ("rm", [path]) => bridge.unlink(path).await?,
        ("rmdir", [path]) => bridge.rmdir(path).await?,
        ("mkdir", [path]) => bridge.mkdir(path).await?,
        ("mv", [from, to]) => bridge.rename(from, to).await?,
        ("stat", [path]) => {
            let meta = bridge.stat(path).await?;
            println!("  id: {}", meta.id);
            println!("  type: {}", if meta.is_dir() { "directory" } else { "file" });
            println!("  size: {}", meta.size);
            println!("  origin: {}", origin_name(meta.origin));
            println!("  dirty: {}", meta.dirty);
            println!("  modified: {}", meta.modified);
        }
        ("ps", []) => {
            println!("  PID  PPID  FDS  STATE      COMMAND");
            for p in bridge.list().await? {
                let state = match p.state {
                    ProcessState::Running => "running".to_string(),
                    ProcessState::Exited(status) => status.to_string(),
                };
                println!("{:>5} {:>5} {:>4}  {:<10} {}", p.pid.0, p.ppid, p.fds.len(), state, p.command);
            }
        }
        ("spawn", words) if !words.is_empty() => {
            let pid = bridge.spawn(&words.join(" "), None).await?;
            println!("{}", pid.0);
        }
        ("kill", [pid]) => bridge.kill(parse_pid(pid)?).await?,
        ("wait", [pid]) => {
            let status = bridge.wait(parse_pid(pid)?).await?;
            println!("{}", status);
        }
        ("tty", words) if !words.is_empty() => {
            let mut line = words.join(" ").into_bytes();
            line.push(b'\r');
            bridge.tty_write(TtySide::Input, &line).await?;
            let echo = bridge.tty_read(TtySide::Output, 4096).await?;
            let input = bridge.tty_read(TtySide::Input, 4096).await?;
            println!("echo:  {:?}", String::from_utf8_lossy(&echo));
            println!("input: {:?}", String::from_utf8_lossy(&input));
        }
        ("reload", []) => {
            bridge.force_reload_from_shadow().await?;
            println!("overlay discarded");
        }
        ("export", []) => {
            let snapshot = bridge.export_overlay().await?;
            println!("{}", String::from_utf8_lossy(&snapshot));
        }
        ("export", [file]) => {
            let snapshot = bridge.export_overlay().await?;
            std::fs::write(file, &snapshot)?;
            println!("{} bytes written to {}", snapshot.len(), file);
        }
        ("ls", _) => return Err(CliError::Usage("ls [path]")),
        ("write", _) => return Err(CliError::Usage("write <path> <text>")),
        ("mv", _) => return Err(CliError::Usage("mv <from> <to>")),
        ("spawn", _) => return Err(CliError::Usage("spawn <command>")),
        ("tty", _) => return Err(CliError::Usage("tty <text>")),
        ("export", _) => return Err(CliError::Usage("export [file]")),
        ("cat" | "rm" | "rmdir" | "mkdir" | "stat", _) => {
            return Err(CliError::Usage("<command> <path>"));
        }
        ("kill" | "wait", _) => return Err(CliError::Usage("<command> <pid>")),
        ("ps" | "reload", _) => return Err(CliError::Usage("takes no arguments")),
        _ => eprintln!("{}: command not found", command),
    }
    Ok(Flow::Continue)
}

async fn ls(bridge: &HostBridge, path: &str) -> Result<(), CliError> {
    for entry in bridge.read_dir(path).await? {
        let marker = match entry.origin {
            Origin::Shadow => ' ',
            Origin::Overlay => '*',
        };
        match entry.kind {
            NodeKind::Directory => println!("{} {}/", marker, entry.name),
            NodeKind::File => println!("{} {:<24} {:>8}", marker, entry.name, entry.size),
        }
    }
    Ok(())
}

fn parse_pid(arg: &str) -> Result<Pid, CliError> {
    arg.parse()
        .map(Pid)
        .map_err(|_| CliError::Usage("<pid> must be a number"))
}

fn origin_name(origin: Origin) -> &'static str {
    match origin {
        Origin::Shadow => "shadow",
        Origin::Overlay => "overlay",
    }
}
