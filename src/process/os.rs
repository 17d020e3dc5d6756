//! Operating system backed process collaborators.
//!
//! Process discovery and the module-loaded probe read `/proc`, so on
//! targets other than Linux no processes are found and no module is ever
//! reported as loaded.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use super::{ProcessCreator, ProcessFinder, ProcessHandle, StartInfo};

/// Spawns processes with [`std::process::Command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessCreator;

impl ProcessCreator for OsProcessCreator {
    fn start(&self, info: &StartInfo) -> io::Result<Box<dyn ProcessHandle>> {
        let mut command = std::process::Command::new(&info.file_name);
        command.args(&info.arguments);
        if let Some(dir) = &info.working_directory {
            command.current_dir(dir);
        }
        for (key, value) in &info.env {
            command.env(key, value);
        }
        command.stdin(Stdio::null());

        let child = command.spawn()?;
        Ok(Box::new(ChildProcess {
            pid: child.id(),
            child: Mutex::new(child),
        }))
    }
}

/// A process spawned by this crate.
struct ChildProcess {
    pid: u32,
    child: Mutex<Child>,
}

impl ProcessHandle for ChildProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn has_exited(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        !matches!(child.try_wait(), Ok(None))
    }

    fn is_module_loaded(&self, module: &Path) -> bool {
        is_module_loaded(self.pid, module)
    }

    fn kill(&self) -> io::Result<()> {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        child.kill()?;
        let status = child.wait()?;
        debug!("Process {} terminated: {}", self.pid, status);
        Ok(())
    }
}

/// A process found running on the system.
struct ForeignProcess {
    pid: u32,
}

impl ProcessHandle for ForeignProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn has_exited(&self) -> bool {
        !Path::new("/proc").join(self.pid.to_string()).exists()
    }

    fn is_module_loaded(&self, module: &Path) -> bool {
        is_module_loaded(self.pid, module)
    }

    fn kill(&self) -> io::Result<()> {
        let status = std::process::Command::new("kill")
            .arg("-KILL")
            .arg(self.pid.to_string())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "kill {} exited with {}",
                self.pid, status
            )))
        }
    }
}

/// Finds running processes by their short name.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessFinder;

impl ProcessFinder for OsProcessFinder {
    #[cfg(target_os = "linux")]
    fn processes_by_name(&self, name: &str) -> io::Result<Vec<Box<dyn ProcessHandle>>> {
        // The kernel truncates comm to 15 bytes.
        let wanted: String = name.chars().take(15).collect();
        let own_pid = std::process::id();
        let mut found: Vec<Box<dyn ProcessHandle>> = Vec::new();

        for entry in std::fs::read_dir("/proc")? {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            if pid == own_pid {
                continue;
            }

            // Processes can vanish between listing and reading.
            let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) else {
                continue;
            };
            if comm.trim_end() == wanted {
                found.push(Box::new(ForeignProcess { pid }));
            }
        }

        debug!("Found {} process(es) named '{}'", found.len(), name);
        Ok(found)
    }

    #[cfg(not(target_os = "linux"))]
    fn processes_by_name(&self, name: &str) -> io::Result<Vec<Box<dyn ProcessHandle>>> {
        debug!("Process discovery unavailable; no '{}' processes", name);
        Ok(Vec::new())
    }
}

/// Returns `true` if `module` is mapped into process `pid`.
pub fn is_module_loaded(pid: u32, module: &Path) -> bool {
    let target: PathBuf = std::fs::canonicalize(module).unwrap_or_else(|_| module.to_path_buf());
    let target = target.to_string_lossy();

    let maps = Path::new("/proc").join(pid.to_string()).join("maps");
    let Ok(contents) = std::fs::read_to_string(&maps) else {
        return false;
    };

    contents
        .lines()
        .filter_map(|line| line.find('/').map(|idx| &line[idx..]))
        .any(|mapped| mapped == target)
}
