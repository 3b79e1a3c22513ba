//! Shared registry of provisioned failover targets.
//!
//! Producer and consumer processes coordinate only through this registry. It
//! is last-writer-wins: nothing prevents two processes from writing, and a
//! lost update is acceptable because an entry is written at most once per
//! secondary lifetime. What must not happen is two producers each *creating*
//! a secondary, so creation goes through
//! [`FailoverRegistry::try_create_if_absent`], which re-checks the registry
//! while holding an exclusive lock and only then runs the creation callback.
//!
//! Reads that fail are reported as errors here; callers decide whether to
//! degrade them to "nothing registered".

use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};

use crate::error::{Error, Result};
use crate::target::TargetRef;

const HEADER_COMMENT: &str = "Secondary stream info (OCID + endpoint)";

/// Logical role a registry entry is stored under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Secondary,
}

impl Slot {
    pub fn id_key(self) -> &'static str {
        match self {
            Slot::Secondary => "SECONDARY_STREAM_OCID",
        }
    }

    pub fn endpoint_key(self) -> &'static str {
        match self {
            Slot::Secondary => "SECONDARY_STREAM_ENDPOINT",
        }
    }
}

/// What [`FailoverRegistry::try_create_if_absent`] ended up doing.
#[derive(Debug)]
pub enum Provision {
    /// Someone already registered a target; nothing was created.
    Existing(TargetRef),
    /// The callback created a target. `persisted` holds the write error if the
    /// registry could not be updated; the target is usable either way.
    Created {
        target: TargetRef,
        persisted: Option<Error>,
    },
}

impl Provision {
    pub fn target(&self) -> &TargetRef {
        match self {
            Provision::Existing(target) => target,
            Provision::Created { target, .. } => target,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Provision::Created { .. })
    }
}

pub trait FailoverRegistry: Send + Sync {
    /// `Ok(None)` when nothing (or only a partial entry) is registered.
    fn load(&self, slot: Slot) -> Result<Option<TargetRef>>;

    fn store(&self, slot: Slot, target: &TargetRef) -> Result<()>;

    /// Run `create` only if `slot` is still empty, excluding other callers
    /// that go through this method for the same registry.
    fn try_create_if_absent(
        &self,
        slot: Slot,
        create: &mut dyn FnMut() -> Result<TargetRef>,
    ) -> Result<Provision>;
}

/// In-process registry. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    entries: Arc<Mutex<HashMap<Slot, TargetRef>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(slot: Slot, target: TargetRef) -> Self {
        let registry = Self::default();
        if let Ok(mut entries) = registry.entries.lock() {
            entries.insert(slot, target);
        }
        registry
    }

    /// Make every subsequent `store` fail with a persistence error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Slot, TargetRef>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Persistence("registry mutex poisoned".to_string()))
    }

    fn write_entry(
        &self,
        entries: &mut HashMap<Slot, TargetRef>,
        slot: Slot,
        target: &TargetRef,
    ) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Persistence("registry is read-only".to_string()));
        }
        entries.insert(slot, target.clone());
        Ok(())
    }
}

impl FailoverRegistry for MemoryRegistry {
    fn load(&self, slot: Slot) -> Result<Option<TargetRef>> {
        Ok(self.entries()?.get(&slot).cloned())
    }

    fn store(&self, slot: Slot, target: &TargetRef) -> Result<()> {
        let mut entries = self.entries()?;
        self.write_entry(&mut entries, slot, target)
    }

    fn try_create_if_absent(
        &self,
        slot: Slot,
        create: &mut dyn FnMut() -> Result<TargetRef>,
    ) -> Result<Provision> {
        let mut entries = self.entries()?;
        if let Some(existing) = entries.get(&slot) {
            return Ok(Provision::Existing(existing.clone()));
        }
        let target = create()?;
        let persisted = self.write_entry(&mut entries, slot, &target).err();
        Ok(Provision::Created { target, persisted })
    }
}

/// Registry kept in a flat `key=value` properties file that other tooling
/// can read. Unknown keys are preserved on rewrite.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        sibling(&self.path, "lock")
    }

    fn read_properties(&self) -> Result<BTreeMap<String, String>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(parse_properties(&decode_latin1(&bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(Error::Persistence(format!(
                "cannot read {}: {err}",
                self.path.display()
            ))),
        }
    }

    fn ensure_parent(&self) -> std::io::Result<()> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
            _ => Ok(()),
        }
    }

    fn write_properties(&self, props: &BTreeMap<String, String>) -> std::io::Result<()> {
        self.ensure_parent()?;
        let tmp = sibling(&self.path, "tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(render_properties(props).as_bytes())?;
        file.sync_all()?;
        std::fs::rename(tmp, &self.path)
    }

    fn load_degraded(&self, slot: Slot) -> Option<TargetRef> {
        match self.load(slot) {
            Ok(found) => found,
            Err(err) => {
                warn!("treating unreadable registry as empty: {err}");
                None
            }
        }
    }
}

impl FailoverRegistry for FileRegistry {
    fn load(&self, slot: Slot) -> Result<Option<TargetRef>> {
        let props = self.read_properties()?;
        let value = |key: &str| {
            props
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        match (value(slot.id_key()), value(slot.endpoint_key())) {
            (Some(id), Some(endpoint)) => Ok(Some(TargetRef::new(id, endpoint))),
            _ => Ok(None),
        }
    }

    fn store(&self, slot: Slot, target: &TargetRef) -> Result<()> {
        let mut props = self.read_properties()?;
        props.insert(slot.id_key().to_string(), target.id.clone());
        props.insert(slot.endpoint_key().to_string(), target.endpoint.clone());
        self.write_properties(&props).map_err(|err| {
            Error::Persistence(format!("cannot write {}: {err}", self.path.display()))
        })?;
        info!("saved {target} to registry {}", self.path.display());
        Ok(())
    }

    fn try_create_if_absent(
        &self,
        slot: Slot,
        create: &mut dyn FnMut() -> Result<TargetRef>,
    ) -> Result<Provision> {
        let locked = self
            .ensure_parent()
            .and_then(|()| lock::RegistryLock::acquire(&self.lock_path()));
        let guard = match locked {
            Ok(guard) => Some(guard),
            Err(err) => {
                warn!(
                    "cannot lock registry {}, creating without exclusion: {err}",
                    self.path.display()
                );
                None
            }
        };
        if let Some(existing) = self.load_degraded(slot) {
            return Ok(Provision::Existing(existing));
        }
        let target = create()?;
        let persisted = self.store(slot, &target).err();
        drop(guard);
        Ok(Provision::Created { target, persisted })
    }
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// Properties files are ISO-8859-1; every byte maps to the code point of the
/// same value.
fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Parse Java-properties style text: `#`/`!` comments, `=` or `:` separators,
/// backslash escapes including `\uXXXX`. Line continuations are not
/// supported.
pub fn parse_properties(contents: &str) -> BTreeMap<String, String> {
    let mut props = BTreeMap::new();
    for line in contents.lines() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let (key, value) = split_entry(line);
        let key = unescape(key.trim_end());
        if key.is_empty() {
            continue;
        }
        props.insert(key, unescape(value.trim()));
    }
    props
}

fn split_entry(line: &str) -> (&str, &str) {
    let mut escaped = false;
    for (idx, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' | ':' => return (&line[..idx], &line[idx + 1..]),
            _ => {}
        }
    }
    (line, "")
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('f') => out.push('\u{c}'),
            Some('u') => unescape_unicode(&mut chars, &mut out),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Decode the four hex digits after `\u`, joining surrogate pairs. Malformed
/// sequences are kept literally.
fn unescape_unicode(chars: &mut std::str::Chars<'_>, out: &mut String) {
    let Some(high) = take_hex4(chars) else {
        out.push_str("\\u");
        return;
    };
    if (0xD800..0xDC00).contains(&high) {
        let mut ahead = chars.clone();
        let low = match (ahead.next(), ahead.next()) {
            (Some('\\'), Some('u')) => take_hex4(&mut ahead),
            _ => None,
        };
        if let Some(low) = low.filter(|low| (0xDC00..0xE000).contains(low)) {
            let code = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
            if let Some(c) = char::from_u32(code) {
                out.push(c);
                *chars = ahead;
                return;
            }
        }
    }
    out.push(char::from_u32(high).unwrap_or(char::REPLACEMENT_CHARACTER));
}

fn take_hex4(chars: &mut std::str::Chars<'_>) -> Option<u32> {
    let digits = chars.as_str().get(..4)?;
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let value = u32::from_str_radix(digits, 16).ok()?;
    chars.nth(3);
    Some(value)
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' | ':' | '=' | '#' | '!' => {
                out.push('\\');
                out.push(c);
            }
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c if c.is_ascii() && !c.is_ascii_control() => out.push(c),
            c => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    out.push_str(&format!("\\u{unit:04X}"));
                }
            }
        }
    }
    out
}

fn render_properties(props: &BTreeMap<String, String>) -> String {
    let written = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut out = format!(
        "#{HEADER_COMMENT}\n#written at unix {written} by pid {}\n",
        std::process::id()
    );
    for (key, value) in props {
        out.push_str(&escape(key));
        out.push('=');
        out.push_str(&escape(value));
        out.push('\n');
    }
    out
}

#[cfg(unix)]
mod lock {
    use std::fs::{File, OpenOptions};
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    /// Exclusive `flock` held until drop.
    pub struct RegistryLock {
        file: File,
    }

    impl RegistryLock {
        pub fn acquire(path: &Path) -> std::io::Result<Self> {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(path)?;
            loop {
                let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
                if res == 0 {
                    return Ok(Self { file });
                }
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }
    }

    impl Drop for RegistryLock {
        fn drop(&mut self) {
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

#[cfg(not(unix))]
mod lock {
    use std::fs::{File, OpenOptions};
    use std::path::Path;

    pub struct RegistryLock {
        _file: File,
    }

    impl RegistryLock {
        pub fn acquire(path: &Path) -> std::io::Result<Self> {
            let file = OpenOptions::new().create(true).write(true).open(path)?;
            Ok(Self { _file: file })
        }
    }
}
