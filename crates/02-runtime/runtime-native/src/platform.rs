use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use transport::{HostLink, ImageEntry, NotifyBus, PoolRegistry, ProcessorId, TransportResult};

use crate::loader::NativeLoader;

/// Named co-processor images that native loaders can run.
#[derive(Clone, Default)]
pub struct ImageTable {
    images: Arc<RwLock<HashMap<String, ImageEntry>>>,
}

impl ImageTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `entry` under `name`, replacing any previous image.
    pub fn insert(&self, name: impl Into<String>, entry: ImageEntry) {
        self.images.write().insert(name.into(), entry);
    }

    /// Looks an image up by its full path, then by the path's file stem.
    pub fn resolve(&self, image: &Path) -> Option<ImageEntry> {
        let images = self.images.read();
        image
            .to_str()
            .and_then(|path| images.get(path))
            .or_else(|| {
                image
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| images.get(stem))
            })
            .copied()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.images.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// One host plus its co-processors, all in this process.
pub struct NativePlatform {
    pools: Arc<PoolRegistry>,
    bus: Arc<NotifyBus>,
    images: ImageTable,
}

impl NativePlatform {
    /// A platform with no images registered.
    pub fn new() -> Self {
        Self {
            pools: Arc::new(PoolRegistry::new()),
            bus: NotifyBus::new(),
            images: ImageTable::new(),
        }
    }

    /// Builder form of [`ImageTable::insert`].
    pub fn with_image(self, name: impl Into<String>, entry: ImageEntry) -> Self {
        self.images.insert(name, entry);
        self
    }

    /// Images available to loaders created from this platform.
    pub fn images(&self) -> &ImageTable {
        &self.images
    }

    /// Pool registry shared by host and co-processors.
    pub fn pools(&self) -> &Arc<PoolRegistry> {
        &self.pools
    }

    /// Doorbell bus shared by host and co-processors.
    pub fn bus(&self) -> &Arc<NotifyBus> {
        &self.bus
    }

    /// A fresh loader bound to this platform's registries.
    pub fn loader(&self) -> NativeLoader {
        NativeLoader::new(
            Arc::clone(&self.pools),
            Arc::clone(&self.bus),
            self.images.clone(),
        )
    }

    /// Host endpoint, pools and loader bundled for a transfer session.
    ///
    /// Fails if a host endpoint is already live on this platform.
    pub fn host_link(&self) -> TransportResult<HostLink> {
        Ok(HostLink {
            pools: Arc::clone(&self.pools),
            notify: self.bus.endpoint(ProcessorId::GPP)?,
            loader: Box::new(self.loader()),
        })
    }
}

impl Default for NativePlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport::{DspEnv, TransportError};

    fn idle(_env: DspEnv) -> i32 {
        0
    }

    #[test]
    fn resolves_by_path_or_stem() {
        let table = ImageTable::new();
        table.insert("trackability", idle);
        table.insert("/opt/dsp/custom.out", idle);

        assert!(table.resolve(Path::new("trackability")).is_some());
        assert!(table.resolve(Path::new("/lib/dsp/trackability.out")).is_some());
        assert!(table.resolve(Path::new("/opt/dsp/custom.out")).is_some());
        assert!(table.resolve(Path::new("matmul")).is_none());
        assert_eq!(table.names(), vec!["/opt/dsp/custom.out", "trackability"]);
    }

    #[test]
    fn one_host_link_at_a_time() {
        let platform = NativePlatform::new().with_image("idle", idle);
        let link = platform.host_link().expect("first link");
        assert!(matches!(
            platform.host_link(),
            Err(TransportError::EndpointExists(id)) if id == ProcessorId::GPP
        ));
        drop(link);
        platform.host_link().expect("link after drop");
    }
}
