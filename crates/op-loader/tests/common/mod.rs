//! Shared fixtures: an in-memory content tree and a loader over it

#![allow(dead_code)]

use op_core::config::Config;
use op_core::error::PakError;
use op_format::{Layout, PackageBuilder, PackageIndex};
use op_io::{IoDispatcher, MemoryFileSystem};
use op_loader::{
    AsyncLoader, ClassRegistry, CompletionCallback, ExportReader, LoadCompletion, LoadResult,
    LoaderServices, ObjectData, ObjectStore, RequestId,
};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;

pub const SCRIPT: &str = "/Script/Core";
pub const BLOB: &str = "Blob";
pub const WIDGET: &str = "Widget";
pub const SHORT: &str = "Short";
pub const OLD_SHORT: &str = "OldShort";

/// Reads a `u32` and one object reference
#[derive(Debug, Default, Clone)]
pub struct Widget {
    pub value: u32,
    pub link: Option<String>,
    pub post_loaded: bool,
}

impl ObjectData for Widget {
    fn deserialize(&mut self, reader: &mut ExportReader<'_>) -> Result<(), PakError> {
        self.value = reader.read_u32()?;
        self.link = reader.read_object()?.map(|o| o.path().to_string());
        Ok(())
    }

    fn post_load(&mut self) {
        self.post_loaded = true;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Consumes a single byte whatever the payload size
#[derive(Debug, Default, Clone)]
pub struct Short {
    pub deprecated: bool,
}

impl ObjectData for Short {
    fn deserialize(&mut self, reader: &mut ExportReader<'_>) -> Result<(), PakError> {
        reader.read_u8()?;
        Ok(())
    }

    fn is_deprecated(&self) -> bool {
        self.deprecated
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Serialized body of a [`Widget`]
pub fn widget_payload(value: u32, link: PackageIndex) -> Vec<u8> {
    let mut payload = value.to_le_bytes().to_vec();
    payload.extend_from_slice(&link.raw().to_le_bytes());
    payload
}

pub struct Harness {
    pub fs: Arc<MemoryFileSystem>,
    pub store: Arc<ObjectStore>,
    pub registry: Arc<ClassRegistry>,
    pub loader: AsyncLoader,
}

impl Harness {
    pub fn new(multithreaded: bool) -> Self {
        Self::with_config(multithreaded, |_| {})
    }

    pub fn with_config(multithreaded: bool, tweak: impl FnOnce(&mut Config)) -> Self {
        let workers = if multithreaded { 2 } else { 0 };
        let fs = Arc::new(MemoryFileSystem::new(Arc::new(IoDispatcher::new(workers))));
        let store = Arc::new(ObjectStore::new());
        for class in [BLOB, WIDGET, SHORT, OLD_SHORT] {
            store.register_native_class(SCRIPT, class);
        }

        let registry = Arc::new(ClassRegistry::with_raw_fallback());
        registry.register(&format!("{}.{}", SCRIPT, WIDGET), |_| Box::new(Widget::default()));
        registry.register(&format!("{}.{}", SCRIPT, SHORT), |_| Box::new(Short::default()));
        registry.register(&format!("{}.{}", SCRIPT, OLD_SHORT), |_| {
            Box::new(Short { deprecated: true })
        });

        let mut config = Config::default();
        config.general.multithreaded = multithreaded;
        config.paths.content_root = "/content".into();
        config.scheduler.idle_wait_ms = 1;
        tweak(&mut config);

        let services = LoaderServices::new(fs.clone())
            .with_store(Arc::clone(&store))
            .with_factory(registry.clone());
        let loader = AsyncLoader::new(config, services).expect("loader starts");
        Self {
            fs,
            store,
            registry,
            loader,
        }
    }

    /// Write `builder` under the content root
    pub fn install(&self, builder: &PackageBuilder, layout: Layout) {
        self.install_as(builder.name(), builder, layout);
    }

    pub fn install_as(&self, name: &str, builder: &PackageBuilder, layout: Layout) {
        let built = builder.build(layout);
        self.fs.insert(format!("/content{}.pak", name), built.header);
        if let Some(body) = built.body {
            self.fs.insert(format!("/content{}.pakb", name), body);
        }
    }

    /// Enqueue `name` and record its completions
    pub fn request(&self, name: &str, log: &CompletionLog) -> RequestId {
        self.loader.enqueue(
            name,
            None,
            None,
            0,
            Default::default(),
            Some(log.callback()),
        )
    }
}

/// Collects every completion delivered to its callbacks
#[derive(Clone, Default)]
pub struct CompletionLog {
    entries: Arc<Mutex<Vec<LoadCompletion>>>,
}

impl CompletionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> CompletionCallback {
        let entries = Arc::clone(&self.entries);
        Box::new(move |completion| entries.lock().push(completion.clone()))
    }

    pub fn entries(&self) -> Vec<LoadCompletion> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// The only completion for `name`
    pub fn result_of(&self, name: &str) -> LoadResult {
        let entries = self.entries.lock();
        let matching: Vec<_> = entries.iter().filter(|c| c.name == name).collect();
        assert_eq!(matching.len(), 1, "expected one completion for {}", name);
        matching[0].result.clone()
    }
}

/// Package `name` with one `Blob` export per payload
pub fn blob_package(name: &str, payloads: &[Vec<u8>]) -> PackageBuilder {
    let mut builder = PackageBuilder::new(name);
    let class = builder.import_class(SCRIPT, BLOB);
    for (i, payload) in payloads.iter().enumerate() {
        builder.add_export(&format!("Obj{}", i), class, PackageIndex::NULL, payload.clone());
    }
    builder
}
