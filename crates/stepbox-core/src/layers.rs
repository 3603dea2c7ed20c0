//! Teardown of stacked filesystem layers.
//!
//! A layer root holds one directory per layer, named by its stacking index
//! (`1`, `2`, ...). Layers flagged for deferred deletion carry an `rm-`
//! prefix (`rm-5`). Teardown runs removal-marked layers first, then active
//! layers, each group from the highest index down, so a layer is never torn
//! down while a layer stacked on top of it still exists.

use crate::error::{CoreError, Result};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Directory-name prefix of removal-marked layers.
pub const REMOVAL_PREFIX: &str = "rm-";

/// Snapshotter plugin directory under a data root.
pub const SNAPSHOTTER_PLUGIN: &str = "io.containerd.snapshotter.v1.windows";

/// One layer directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Stacking index.
    pub index: u64,
    /// Whether the layer is flagged for deferred deletion.
    pub removal_marked: bool,
    /// Directory name as found on disk.
    pub name: String,
}

impl Layer {
    /// Parse a layer directory name (`<n>` or `rm-<n>`).
    pub fn parse(name: &str) -> Option<Self> {
        let (digits, removal_marked) = match name.strip_prefix(REMOVAL_PREFIX) {
            Some(rest) => (rest, true),
            None => (name, false),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self {
            index: digits.parse().ok()?,
            removal_marked,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Steps applied to each layer, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TeardownStep {
    /// Release the prepared (writable) view of the layer.
    Unprepare,
    /// Detach the layer from the host.
    Deactivate,
    /// Delete the layer's storage.
    Destroy,
}

impl TeardownStep {
    /// All steps, in execution order.
    pub const ALL: [TeardownStep; 3] = [
        TeardownStep::Unprepare,
        TeardownStep::Deactivate,
        TeardownStep::Destroy,
    ];
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownStep::Unprepare => write!(f, "unprepare"),
            TeardownStep::Deactivate => write!(f, "deactivate"),
            TeardownStep::Destroy => write!(f, "destroy"),
        }
    }
}

/// Errors reported by a [`LayerDriver`].
#[derive(Debug, Error)]
pub enum DriverError {
    /// The layer is activated but not prepared.
    #[error("layer is not prepared")]
    NotPrepared,

    /// The layer is neither prepared nor activated.
    #[error("layer is not activated")]
    NotActivated,

    /// Any other platform error code.
    #[error("driver error code {0:#010x}")]
    Code(u32),

    /// I/O error
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DriverError {
    /// Windows `ERROR_DEV_NOT_EXIST`.
    pub const ERROR_DEV_NOT_EXIST: u32 = 55;
    /// Windows `ERROR_FLT_INSTANCE_NOT_FOUND`.
    pub const ERROR_FLT_INSTANCE_NOT_FOUND: u32 = 0x801F_0015;

    /// Map a raw platform error code.
    pub fn from_code(code: u32) -> Self {
        match code {
            Self::ERROR_DEV_NOT_EXIST => DriverError::NotActivated,
            Self::ERROR_FLT_INSTANCE_NOT_FOUND => DriverError::NotPrepared,
            other => DriverError::Code(other),
        }
    }

    /// True when the error only says the step was already undone.
    pub fn is_already_torn_down(&self) -> bool {
        matches!(self, DriverError::NotPrepared | DriverError::NotActivated)
    }
}

/// Storage driver that performs the per-layer teardown steps.
///
/// `home` is the layer root and `id` the layer's directory name.
pub trait LayerDriver {
    /// Release the prepared view of a layer.
    fn unprepare(&self, home: &Path, id: &str) -> std::result::Result<(), DriverError>;

    /// Detach a layer from the host.
    fn deactivate(&self, home: &Path, id: &str) -> std::result::Result<(), DriverError>;

    /// Delete a layer's storage.
    fn destroy(&self, home: &Path, id: &str) -> std::result::Result<(), DriverError>;
}

/// Layers found under one root, split and sorted for teardown.
#[derive(Debug, Clone)]
pub struct LayerStack {
    root: PathBuf,
    removal: Vec<Layer>,
    active: Vec<Layer>,
}

impl LayerStack {
    /// Scan the direct children of `root`.
    ///
    /// Every entry must be a layer directory; anything else is an error.
    pub fn scan(root: &Path) -> Result<Self> {
        let scan_err = |source: io::Error| CoreError::Scan {
            path: root.to_path_buf(),
            source,
        };

        let mut removal = Vec::new();
        let mut active = Vec::new();
        for entry in std::fs::read_dir(root).map_err(scan_err)? {
            let entry = entry.map_err(scan_err)?;
            let path = entry.path();
            let is_dir = entry.file_type().map_err(scan_err)?.is_dir();
            let layer = entry
                .file_name()
                .to_str()
                .filter(|_| is_dir)
                .and_then(Layer::parse)
                .ok_or(CoreError::InvalidLayer { path })?;

            if layer.removal_marked {
                removal.push(layer);
            } else {
                active.push(layer);
            }
        }

        removal.sort_by(|a, b| b.index.cmp(&a.index));
        active.sort_by(|a, b| b.index.cmp(&a.index));

        tracing::debug!(
            root = %root.display(),
            removal = removal.len(),
            active = active.len(),
            "Scanned layers"
        );

        Ok(Self {
            root: root.to_path_buf(),
            removal,
            active,
        })
    }

    /// Layer root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.removal.len() + self.active.len()
    }

    /// True when the root holds no layers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removal-marked layers (descending), then active layers (descending).
    pub fn teardown_order(&self) -> impl Iterator<Item = &Layer> {
        self.removal.iter().chain(self.active.iter())
    }

    /// Tear down every layer in order, stopping at the first failure.
    pub fn teardown<D: LayerDriver + ?Sized>(&self, driver: &D) -> Result<()> {
        for layer in self.teardown_order() {
            self.teardown_layer(driver, layer)?;
        }
        Ok(())
    }

    fn teardown_layer<D: LayerDriver + ?Sized>(&self, driver: &D, layer: &Layer) -> Result<()> {
        let path = self.root.join(&layer.name);
        for step in TeardownStep::ALL {
            let result = match step {
                TeardownStep::Unprepare => driver.unprepare(&self.root, &layer.name),
                TeardownStep::Deactivate => driver.deactivate(&self.root, &layer.name),
                TeardownStep::Destroy => driver.destroy(&self.root, &layer.name),
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_already_torn_down() => {
                    tracing::debug!(layer = %path.display(), %step, reason = %e, "Layer step already done");
                }
                Err(source) => {
                    tracing::error!(layer = %path.display(), %step, error = %source, "Layer teardown failed");
                    return Err(CoreError::Teardown {
                        step,
                        layer: path,
                        source,
                    });
                }
            }
        }
        tracing::debug!(layer = %path.display(), "Layer torn down");
        Ok(())
    }
}

/// Tear down every layer under `root`, then remove `root` itself.
///
/// A missing root is treated as already reclaimed.
pub fn reclaim_layers<D: LayerDriver + ?Sized>(root: &Path, driver: &D) -> Result<()> {
    if !root.exists() {
        tracing::debug!(root = %root.display(), "Layer root already gone");
        return Ok(());
    }

    let stack = LayerStack::scan(root)?;
    stack.teardown(driver)?;
    remove_all(root)?;

    tracing::info!(root = %root.display(), layers = stack.len(), "Reclaimed layers");
    Ok(())
}

/// Remove a whole data root, tearing down snapshot layers first when present.
pub fn force_remove_all<D: LayerDriver + ?Sized>(data_root: &Path, driver: &D) -> Result<()> {
    let snapshots = data_root.join(SNAPSHOTTER_PLUGIN).join("snapshots");
    if snapshots.is_dir() {
        LayerStack::scan(&snapshots)
            .and_then(|stack| stack.teardown(driver))
            .map_err(|source| CoreError::SnapshotCleanup {
                path: snapshots.clone(),
                source: Box::new(source),
            })?;
    }
    remove_all(data_root)
}

fn remove_all(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CoreError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Driver for layers that live as plain directories on the local host.
///
/// On Linux, unprepare and deactivate detach-unmount `<layer>/rootfs` and
/// `<layer>`; a path that is not mounted reports the tolerated error. Other
/// platforms have nothing mounted, so those steps always report it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalLayerDriver;

impl LayerDriver for LocalLayerDriver {
    fn unprepare(&self, home: &Path, id: &str) -> std::result::Result<(), DriverError> {
        unmount(&home.join(id).join("rootfs"), DriverError::NotPrepared)
    }

    fn deactivate(&self, home: &Path, id: &str) -> std::result::Result<(), DriverError> {
        unmount(&home.join(id), DriverError::NotActivated)
    }

    fn destroy(&self, home: &Path, id: &str) -> std::result::Result<(), DriverError> {
        match std::fs::remove_dir_all(home.join(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(target_os = "linux")]
fn unmount(path: &Path, not_mounted: DriverError) -> std::result::Result<(), DriverError> {
    use nix::errno::Errno;
    use nix::mount::{umount2, MntFlags};

    // Unprivileged umount2 reports EPERM before it checks for a mount point.
    if !is_mount_point(path)? {
        return Err(not_mounted);
    }

    match umount2(path, MntFlags::MNT_DETACH) {
        Ok(()) => Ok(()),
        Err(Errno::EINVAL) | Err(Errno::ENOENT) => Err(not_mounted),
        Err(errno) => Err(DriverError::Io(io::Error::from(errno))),
    }
}

/// Whether `path` is listed as a mount point in `/proc/self/mountinfo`.
#[cfg(target_os = "linux")]
fn is_mount_point(path: &Path) -> io::Result<bool> {
    let path = match path.canonicalize() {
        Ok(path) => path,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")?;
    Ok(mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .any(|mount_point| Path::new(&unescape_mount_path(mount_point)) == path))
}

/// Decode the octal escapes (`\040` for space) used in mountinfo paths.
#[cfg(target_os = "linux")]
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = (bytes[i] == b'\\')
            .then(|| bytes.get(i + 1..i + 4))
            .flatten()
            .and_then(|digits| std::str::from_utf8(digits).ok())
            .and_then(|digits| u8::from_str_radix(digits, 8).ok());
        match escaped {
            Some(byte) => {
                out.push(byte);
                i += 4;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(not(target_os = "linux"))]
fn unmount(_path: &Path, not_mounted: DriverError) -> std::result::Result<(), DriverError> {
    Err(not_mounted)
}
