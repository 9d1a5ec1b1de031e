//! In-memory object model seen by the loader
//!
//! The loader does not know how objects are laid out. It constructs them
//! through an [`ObjectFactory`], feeds their serialized bytes to
//! [`ObjectData::deserialize`], and registers the results in the
//! [`ObjectStore`] under `Package.Outer.Name` paths.

use crate::reader::ExportReader;
use bitflags::bitflags;
use op_core::error::PakError;
use op_format::{CLASS_CLASS, CORE_SCRIPT_PACKAGE, PACKAGE_CLASS};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

bitflags! {
    /// Load state of an object
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ObjectFlags: u32 {
        /// Constructed, waiting for its bytes
        const NEED_LOAD     = 0b0000_0001;
        /// Serialized, waiting for postload
        const NEED_POSTLOAD = 0b0000_0010;
        /// Serialized
        const LOADED        = 0b0000_0100;
        /// Postloaded and handed to callers
        const FULLY_LOADED  = 0b0000_1000;
        /// Construction or serialization failed
        const LOAD_FAILED   = 0b0001_0000;
        /// Registered natively rather than loaded
        const NATIVE        = 0b0010_0000;
        /// Member of a cluster
        const IN_CLUSTER    = 0b0100_0000;
    }
}

/// Behaviour plugged in per class
pub trait ObjectData: Send + Sync {
    /// Read the object's serialized body
    fn deserialize(&mut self, reader: &mut ExportReader<'_>) -> Result<(), PakError>;

    /// Second initialization pass once every dependency is serialized
    fn post_load(&mut self) {}

    /// Whether `post_load` may run on the loading thread
    fn postload_on_loading_thread(&self) -> bool {
        false
    }

    /// Deprecated classes tolerate size mismatches
    fn is_deprecated(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;
}

/// Opaque bytes, used when a class has no dedicated data type
#[derive(Debug, Default, Clone)]
pub struct RawData {
    pub bytes: Vec<u8>,
    pub post_loaded: bool,
}

impl ObjectData for RawData {
    fn deserialize(&mut self, reader: &mut ExportReader<'_>) -> Result<(), PakError> {
        self.bytes = reader.read_to_end()?;
        Ok(())
    }

    fn post_load(&mut self) {
        self.post_loaded = true;
    }

    fn postload_on_loading_thread(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A live object
pub struct Object {
    path: String,
    name: String,
    class: String,
    package: String,
    outer: Option<String>,
    flags: Mutex<ObjectFlags>,
    data: Mutex<Option<Box<dyn ObjectData>>>,
    cluster: Mutex<Option<u32>>,
}

pub type ObjectRef = Arc<Object>;

impl Object {
    pub fn new(
        path: &str,
        name: &str,
        class: &str,
        package: &str,
        outer: Option<&str>,
        flags: ObjectFlags,
        data: Option<Box<dyn ObjectData>>,
    ) -> Self {
        Self {
            path: path.to_string(),
            name: name.to_string(),
            class: class.to_string(),
            package: package.to_string(),
            outer: outer.map(str::to_string),
            flags: Mutex::new(flags),
            data: Mutex::new(data),
            cluster: Mutex::new(None),
        }
    }

    /// Full path, `Package.Outer.Name`
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the class object
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Short class name (last path segment)
    pub fn class_name(&self) -> &str {
        self.class.rsplit('.').next().unwrap_or(&self.class)
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn outer(&self) -> Option<&str> {
        self.outer.as_deref()
    }

    pub fn flags(&self) -> ObjectFlags {
        *self.flags.lock()
    }

    pub fn has_flags(&self, flags: ObjectFlags) -> bool {
        self.flags.lock().contains(flags)
    }

    pub fn set_flags(&self, flags: ObjectFlags) {
        self.flags.lock().insert(flags);
    }

    pub fn clear_flags(&self, flags: ObjectFlags) {
        self.flags.lock().remove(flags);
    }

    /// Serialized and not failed
    pub fn is_loaded(&self) -> bool {
        let flags = self.flags();
        flags.intersects(ObjectFlags::LOADED | ObjectFlags::NATIVE)
            && !flags.contains(ObjectFlags::LOAD_FAILED)
    }

    pub fn cluster(&self) -> Option<u32> {
        *self.cluster.lock()
    }

    /// Run `f` against the object's data
    pub fn with_data<R>(&self, f: impl FnOnce(&mut dyn ObjectData) -> R) -> Option<R> {
        let mut data = self.data.lock();
        data.as_deref_mut().map(|data| f(data))
    }

    /// Downcast the object's data
    pub fn data_as<T: 'static + Clone>(&self) -> Option<T> {
        let data = self.data.lock();
        data.as_deref()?.as_any().downcast_ref::<T>().cloned()
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("path", &self.path)
            .field("class", &self.class)
            .field("flags", &self.flags())
            .finish()
    }
}

/// Path of an object named `name` inside `outer`
pub fn child_path(outer: &str, name: &str) -> String {
    format!("{}.{}", outer, name)
}

/// Arguments for [`ObjectFactory::construct`]
pub struct ConstructArgs<'a> {
    pub class: &'a ObjectRef,
    pub outer: &'a ObjectRef,
    pub name: &'a str,
    pub template: Option<&'a ObjectRef>,
}

/// Constructs object data for a class
pub trait ObjectFactory: Send + Sync {
    fn construct(&self, args: &ConstructArgs<'_>) -> Result<Box<dyn ObjectData>, String>;
}

type Constructor = Arc<dyn Fn(&ConstructArgs<'_>) -> Box<dyn ObjectData> + Send + Sync>;

/// Factory dispatching on class path
#[derive(Default)]
pub struct ClassRegistry {
    constructors: RwLock<HashMap<String, Constructor>>,
    fallback: Option<Constructor>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that builds [`RawData`] for every class without a constructor
    pub fn with_raw_fallback() -> Self {
        Self {
            constructors: RwLock::new(HashMap::new()),
            fallback: Some(Arc::new(|_| Box::new(RawData::default()))),
        }
    }

    pub fn register<F>(&self, class_path: &str, constructor: F)
    where
        F: Fn(&ConstructArgs<'_>) -> Box<dyn ObjectData> + Send + Sync + 'static,
    {
        self.constructors
            .write()
            .insert(class_path.to_string(), Arc::new(constructor));
    }

    pub fn is_registered(&self, class_path: &str) -> bool {
        self.constructors.read().contains_key(class_path)
    }
}

impl ObjectFactory for ClassRegistry {
    fn construct(&self, args: &ConstructArgs<'_>) -> Result<Box<dyn ObjectData>, String> {
        let constructor = self.constructors.read().get(args.class.path()).cloned();
        match constructor.or_else(|| self.fallback.clone()) {
            Some(constructor) => Ok(constructor(args)),
            None => Err(format!("no constructor registered for {}", args.class.path())),
        }
    }
}

/// Objects bundled for collector traversal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub id: u32,
    pub package: String,
    pub members: Vec<String>,
}

/// Table of live objects, keyed by path
#[derive(Default)]
pub struct ObjectStore {
    objects: RwLock<HashMap<String, ObjectRef>>,
    clusters: Mutex<Vec<Cluster>>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, path: &str) -> Option<ObjectRef> {
        self.objects.read().get(path).cloned()
    }

    /// Insert `object`, returning the existing entry if the path is taken
    pub fn insert(&self, object: Object) -> ObjectRef {
        let mut objects = self.objects.write();
        if let Some(existing) = objects.get(object.path()) {
            return Arc::clone(existing);
        }
        let object = Arc::new(object);
        objects.insert(object.path().to_string(), Arc::clone(&object));
        object
    }

    /// Insert `object`, replacing any stale entry at its path
    pub fn replace(&self, object: Object) -> ObjectRef {
        let object = Arc::new(object);
        self.objects
            .write()
            .insert(object.path().to_string(), Arc::clone(&object));
        object
    }

    pub fn remove(&self, path: &str) -> Option<ObjectRef> {
        self.objects.write().remove(path)
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Every object belonging to `package`, including the package object
    pub fn objects_in_package(&self, package: &str) -> Vec<ObjectRef> {
        self.objects
            .read()
            .values()
            .filter(|o| o.package() == package)
            .cloned()
            .collect()
    }

    /// Drop objects of `package` that never became fully loaded
    pub fn remove_unfinished(&self, package: &str) -> usize {
        let mut objects = self.objects.write();
        let before = objects.len();
        objects.retain(|_, o| o.package() != package || o.has_flags(ObjectFlags::FULLY_LOADED));
        let removed = before - objects.len();
        if removed > 0 {
            debug!("Removed {} unfinished objects of {}", removed, package);
        }
        removed
    }

    /// Register a natively provided class `package.class`, creating the
    /// script package object if needed
    pub fn register_native_class(&self, package: &str, class: &str) -> ObjectRef {
        let native = ObjectFlags::NATIVE | ObjectFlags::LOADED | ObjectFlags::FULLY_LOADED;
        let package_class = child_path(CORE_SCRIPT_PACKAGE, PACKAGE_CLASS);
        let class_class = child_path(CORE_SCRIPT_PACKAGE, CLASS_CLASS);
        self.insert(Object::new(package, package, &package_class, package, None, native, None));
        let path = child_path(package, class);
        trace!("Registered native class {}", path);
        self.insert(Object::new(&path, class, &class_class, package, Some(package), native, None))
    }

    /// Bundle `members` of `package` into a new cluster
    pub fn create_cluster(&self, package: &str, members: &[ObjectRef]) -> u32 {
        let mut clusters = self.clusters.lock();
        let id = clusters.len() as u32;
        for member in members {
            *member.cluster.lock() = Some(id);
            member.set_flags(ObjectFlags::IN_CLUSTER);
        }
        clusters.push(Cluster {
            id,
            package: package.to_string(),
            members: members.iter().map(|m| m.path().to_string()).collect(),
        });
        id
    }

    pub fn cluster(&self, id: u32) -> Option<Cluster> {
        self.clusters.lock().get(id as usize).cloned()
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.lock().len()
    }
}
