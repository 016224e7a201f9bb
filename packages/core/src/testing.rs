//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use crate::config::{CONFIG_FILE, Config, ConfigStore, GENERAL, keys};
use crate::error::Result;
use crate::executor::{Executor, Invocation, ToolOutput};
use crate::mount::{ENCFS_DEVICE, ENCFS_FSTYPE, MountEntry, MountSource, parse_mount_table};
use crate::stash::{CREDENTIAL_FILE, RegistryPolicy, Stash, StashRegistry};

/// Pid handed out for detached spawns; never a live process.
pub const FAKE_PID: u32 = i32::MAX as u32;

/// Mutable in-memory mount table.
#[derive(Debug, Clone, Default)]
pub struct FakeMounts {
    entries: Arc<Mutex<Vec<MountEntry>>>,
}

impl FakeMounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_table(table: &str) -> Self {
        Self {
            entries: Arc::new(Mutex::new(parse_mount_table(table))),
        }
    }

    pub fn mount(&self, target: &Path) {
        self.entries
            .lock()
            .unwrap()
            .push(MountEntry::new(ENCFS_DEVICE, target, ENCFS_FSTYPE));
    }

    pub fn unmount(&self, target: &Path) {
        self.entries.lock().unwrap().retain(|e| e.target != target);
    }
}

impl MountSource for FakeMounts {
    fn mounts(&self) -> Result<Vec<MountEntry>> {
        Ok(self.entries.lock().unwrap().clone())
    }
}

/// Scripted executor recording every invocation.
///
/// Programs without a scripted response succeed with empty output. When a
/// mount table is attached, successful `encfs` and `fusermount -u` calls
/// update it, and `encfs --standard` drops a metadata file into the new vault.
/// A successful `gpg --output` always writes its output file.
#[derive(Debug, Default)]
pub struct FakeExecutor {
    responses: Mutex<HashMap<String, ToolOutput>>,
    calls: Mutex<Vec<Invocation>>,
    spawned: Mutex<Vec<Invocation>>,
    mounts: Option<FakeMounts>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mounts(mounts: FakeMounts) -> Self {
        Self {
            mounts: Some(mounts),
            ..Self::default()
        }
    }

    pub fn respond(&self, program: &str, output: ToolOutput) {
        self.responses
            .lock()
            .unwrap()
            .insert(program.to_string(), output);
    }

    pub fn fail(&self, program: &str, code: i32) {
        self.respond(
            program,
            ToolOutput {
                code,
                stdout: Vec::new(),
                stderr: format!("{} failed", program).into_bytes(),
            },
        );
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<Invocation> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }

    pub fn count(&self, program: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.program == program).count()
    }

    pub fn spawned(&self) -> Vec<Invocation> {
        self.spawned.lock().unwrap().clone()
    }

    fn apply(&self, invocation: &Invocation) {
        if invocation.program == "gpg"
            && let Some(idx) = invocation.args.iter().position(|a| a == "--output")
            && let Some(file) = invocation.args.get(idx + 1)
        {
            fs::write(file, b"cipher").unwrap();
        }
        let Some(mounts) = &self.mounts else {
            return;
        };
        match invocation.program.as_str() {
            "encfs" => {
                if let Some(target) = invocation.args.last() {
                    mounts.mount(Path::new(target));
                }
                if invocation.args.first().map(String::as_str) == Some("--standard")
                    && let Some(root) = invocation.args.get(1)
                {
                    fs::write(Path::new(root).join(".encfs6.xml"), b"<encfs/>").unwrap();
                }
            }
            "fusermount" => {
                if let Some(target) = invocation.args.last() {
                    mounts.unmount(Path::new(target));
                }
            }
            _ => {}
        }
    }
}

impl Executor for FakeExecutor {
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput> {
        self.calls.lock().unwrap().push(invocation.clone());
        let output = self
            .responses
            .lock()
            .unwrap()
            .get(&invocation.program)
            .cloned()
            .unwrap_or_default();
        if output.success() {
            self.apply(invocation);
        }
        Ok(output)
    }

    fn spawn_detached(&self, invocation: &Invocation) -> Result<u32> {
        self.spawned.lock().unwrap().push(invocation.clone());
        Ok(FAKE_PID)
    }
}

/// Scratch home with a config file and on-disk stash prerequisites.
pub struct StashFixture {
    dir: TempDir,
    store: ConfigStore,
}

impl StashFixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("conf").join(CONFIG_FILE));
        let home = dir.path().join("home");
        let mount_root = home.join("Private");
        let vault_root = home.join(".encfs_root");
        fs::create_dir_all(&mount_root).unwrap();
        fs::create_dir_all(&vault_root).unwrap();

        store
            .update(|c| {
                c.set(GENERAL, keys::MOUNT_ROOT, mount_root.display().to_string());
                c.set(GENERAL, keys::VAULT_ROOT, vault_root.display().to_string());
            })
            .unwrap();

        Self { dir, store }
    }

    /// Creates the credential file, the vault directory and the section.
    pub fn add_stash(&self, name: &str, remote: Option<&str>) {
        let config_path = self.base_dir().join(name);
        fs::create_dir_all(&config_path).unwrap();
        fs::write(config_path.join(CREDENTIAL_FILE), b"<encfs/>").unwrap();
        fs::create_dir_all(self.vault_root().join(name)).unwrap();

        self.store
            .update(|c| {
                c.section_mut(name);
                if let Some(remote) = remote {
                    c.set(name, keys::REMOTE_PATH, remote);
                }
            })
            .unwrap();
    }

    pub fn set(&self, section: &str, key: &str, value: &str) {
        self.store.update(|c| c.set(section, key, value)).unwrap();
    }

    pub fn config(&self) -> Config {
        self.store.load().unwrap()
    }

    pub fn registry(&self, policy: RegistryPolicy) -> Result<StashRegistry> {
        StashRegistry::build(&self.config(), &self.base_dir(), policy)
    }

    pub fn store(&self) -> ConfigStore {
        self.store.clone()
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn home(&self) -> PathBuf {
        self.dir.path().join("home")
    }

    pub fn base_dir(&self) -> PathBuf {
        self.store.base_dir()
    }

    pub fn mount_root(&self) -> PathBuf {
        self.home().join("Private")
    }

    pub fn vault_root(&self) -> PathBuf {
        self.home().join(".encfs_root")
    }
}

/// A stash with fixed, non-existent paths.
pub fn sample_stash(name: &str) -> Stash {
    Stash {
        name: name.to_string(),
        config_path: PathBuf::from("/home/me/.config/stashctl").join(name),
        credential_file: PathBuf::from("/home/me/.config/stashctl")
            .join(name)
            .join(CREDENTIAL_FILE),
        passphrase_file: None,
        vault_root: PathBuf::from("/home/me/.encfs_root").join(name),
        remote_path: Some(format!("backup:/srv/{}", name)),
        dirty: false,
    }
}
