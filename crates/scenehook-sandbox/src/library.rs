// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Scene functions, the modules that hold them, and the library the sandbox
//! resolves query targets against.
//!
//! A [`Callable`] is tagged as a scene function at definition time
//! ([`Callable::scene`]); plain callables ([`Callable::plain`]) live in the
//! same modules but never show up in listings and cannot be built.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use scenehook_proto::{ArgValue, Control, ExtraArgs, Overrides, ParamSpec, SceneListing, SceneMeta};

use crate::tracker::{ModuleInventory, ResourceTracker};

/// A constructed scene graph, opaque to the sandbox.
pub trait Scene: Send {
    /// Native text serialization of the graph.
    fn serialize(&self) -> String;
}

/// A scene known only by its serialized form (what crosses a process
/// boundary).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedScene {
    text: String,
}

impl SerializedScene {
    /// Wrap already-serialized scene text.
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl Scene for SerializedScene {
    fn serialize(&self) -> String {
        self.text.clone()
    }
}

/// Scene configuration handed to scene functions; whatever the function
/// leaves here becomes the result metadata.
pub struct SceneCfg {
    /// Aspect ratio as a rational.
    pub aspect_ratio: (u32, u32),
    /// Duration in seconds.
    pub duration: f64,
    /// Framerate as a rational.
    pub framerate: (u32, u32),
    /// Target rendering backend.
    pub backend: String,
    /// Target operating system.
    pub system: String,
    /// MSAA sample count.
    pub samples: u32,
    /// Clear color (RGBA).
    pub clear_color: [f32; 4],
    /// Media files the scene plays.
    pub media_files: Vec<PathBuf>,
    /// Other files the scene references (textures, fonts, shaders).
    pub aux_files: Vec<PathBuf>,
    tracker: Arc<dyn ResourceTracker>,
}

impl fmt::Debug for SceneCfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneCfg")
            .field("aspect_ratio", &self.aspect_ratio)
            .field("duration", &self.duration)
            .field("framerate", &self.framerate)
            .field("backend", &self.backend)
            .field("system", &self.system)
            .field("samples", &self.samples)
            .finish_non_exhaustive()
    }
}

impl SceneCfg {
    /// Defaults (16:9, 30 s, 60 fps, opengl, host OS, opaque black) with
    /// `overrides` applied.
    pub fn new(overrides: &Overrides, tracker: Arc<dyn ResourceTracker>) -> Self {
        Self {
            aspect_ratio: (16, 9),
            duration: 30.0,
            framerate: (60, 1),
            backend: overrides
                .backend
                .clone()
                .unwrap_or_else(|| "opengl".to_owned()),
            system: overrides
                .system
                .clone()
                .unwrap_or_else(|| std::env::consts::OS.to_owned()),
            samples: 0,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            media_files: Vec::new(),
            aux_files: Vec::new(),
            tracker,
        }
    }

    /// Open `path` for reading, recording it as a build dependency.
    pub fn open(&self, path: impl AsRef<Path>) -> io::Result<File> {
        let path = path.as_ref();
        let file = File::open(path)?;
        self.tracker.record_file(path);
        Ok(file)
    }

    /// Read `path` to a string, recording it as a build dependency.
    pub fn read_to_string(&self, path: impl AsRef<Path>) -> io::Result<String> {
        let mut text = String::new();
        self.open(path)?.read_to_string(&mut text)?;
        Ok(text)
    }

    /// Reference a media file from the scene.
    pub fn add_media(&mut self, path: impl Into<PathBuf>) {
        self.media_files.push(path.into());
    }

    /// Reference an auxiliary file from the scene.
    pub fn add_file(&mut self, path: impl Into<PathBuf>) {
        self.aux_files.push(path.into());
    }

    /// Consume the configuration into result metadata.
    pub fn into_meta(self) -> SceneMeta {
        SceneMeta {
            duration: self.duration,
            aspect_ratio: self.aspect_ratio,
            framerate: self.framerate,
            clear_color: self.clear_color,
            samples: self.samples,
            backend: self.backend,
            system: self.system,
            media_files: self.media_files,
            aux_files: self.aux_files,
        }
    }
}

/// Body of a callable: builds a scene from the configuration and bound
/// arguments.
pub type SceneFn =
    Arc<dyn Fn(&mut SceneCfg, &ExtraArgs) -> anyhow::Result<Box<dyn Scene>> + Send + Sync>;

/// Marker carried by callables registered as scene functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneTag;

/// A named function inside a scene module.
#[derive(Clone)]
pub struct Callable {
    name: String,
    doc: Option<String>,
    params: Vec<ParamSpec>,
    tag: Option<SceneTag>,
    body: SceneFn,
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("name", &self.name)
            .field("tag", &self.tag)
            .field("params", &self.params.len())
            .finish_non_exhaustive()
    }
}

impl Callable {
    /// Define a scene function (listed and buildable).
    pub fn scene<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut SceneCfg, &ExtraArgs) -> anyhow::Result<Box<dyn Scene>> + Send + Sync + 'static,
    {
        Self {
            tag: Some(SceneTag),
            ..Self::plain(name, body)
        }
    }

    /// Define an untagged helper.
    pub fn plain<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut SceneCfg, &ExtraArgs) -> anyhow::Result<Box<dyn Scene>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            doc: None,
            params: Vec::new(),
            tag: None,
            body: Arc::new(body),
        }
    }

    /// Attach a documentation string.
    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    /// Declare a tweakable parameter with its default and control.
    pub fn param(mut self, name: impl Into<String>, default: ArgValue, control: Control) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            default,
            control,
        });
        self
    }

    /// Function name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Is this callable tagged as a scene function?
    pub fn is_scene(&self) -> bool {
        self.tag.is_some()
    }

    /// Listing entry for this callable inside `module`.
    pub fn listing(&self, module: &str) -> SceneListing {
        SceneListing {
            module: module.to_owned(),
            function: self.name.clone(),
            doc: self.doc.clone(),
            params: self.params.clone(),
        }
    }

    /// Merge declared defaults with caller arguments; unknown argument
    /// names are rejected.
    pub fn bind_args(&self, extra: &ExtraArgs) -> anyhow::Result<ExtraArgs> {
        if let Some(unknown) = extra
            .keys()
            .find(|key| !self.params.iter().any(|p| &p.name == *key))
        {
            anyhow::bail!("{}() got an unexpected argument '{unknown}'", self.name);
        }
        let mut bound: ExtraArgs = self
            .params
            .iter()
            .map(|p| (p.name.clone(), p.default.clone()))
            .collect();
        bound.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(bound)
    }

    pub(crate) fn call(&self, cfg: &mut SceneCfg, args: &ExtraArgs) -> anyhow::Result<Box<dyn Scene>> {
        (self.body)(cfg, args)
    }
}

/// A module: named group of callables plus the modules it imports.
#[derive(Debug, Clone)]
pub struct SceneModule {
    name: String,
    imports: Vec<String>,
    callables: Vec<Callable>,
}

impl SceneModule {
    /// Create an empty module.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            imports: Vec::new(),
            callables: Vec::new(),
        }
    }

    /// Declare a module this one imports.
    pub fn import(mut self, module: impl Into<String>) -> Self {
        self.imports.push(module.into());
        self
    }

    /// Add a callable (definition order is kept).
    pub fn with(mut self, callable: Callable) -> Self {
        self.callables.push(callable);
        self
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a callable by name.
    pub fn callable(&self, name: &str) -> Option<&Callable> {
        self.callables.iter().find(|c| c.name == name)
    }

    /// Listings of the tagged scene functions, in definition order.
    pub fn scene_listings(&self) -> impl Iterator<Item = SceneListing> + '_ {
        self.callables
            .iter()
            .filter(|c| c.is_scene())
            .map(|c| c.listing(&self.name))
    }
}

/// Every module the sandbox can resolve: package submodules, standalone
/// scripts, and plain importable modules.
#[derive(Debug, Default)]
pub struct SceneLibrary {
    modules: BTreeMap<String, SceneModule>,
    packages: BTreeMap<String, Vec<String>>,
    scripts: BTreeMap<PathBuf, String>,
    inventory: ModuleInventory,
}

impl SceneLibrary {
    /// Create an empty library.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `package` with its submodules. Submodule names are relative
    /// (`"shapes"` becomes `"<package>.shapes"`).
    pub fn add_package(&mut self, package: &str, submodules: Vec<SceneModule>) -> &mut Self {
        let names = self.packages.entry(package.to_owned()).or_default();
        for mut module in submodules {
            module.name = format!("{package}.{}", module.name);
            if !names.contains(&module.name) {
                names.push(module.name.clone());
            }
            self.modules.insert(module.name.clone(), module);
        }
        self
    }

    /// Register an importable module that is not part of a package.
    pub fn add_module(&mut self, module: SceneModule) -> &mut Self {
        self.modules.insert(module.name.clone(), module);
        self
    }

    /// Bind a script file to the module defined by it.
    pub fn add_script(&mut self, path: &Path, module: SceneModule) -> &mut Self {
        self.scripts.insert(script_key(path), module.name.clone());
        self.modules.insert(module.name.clone(), module);
        self
    }

    /// Table of loaded modules.
    pub fn inventory(&self) -> &ModuleInventory {
        &self.inventory
    }

    /// Resolve `name` and, transitively, its imports; each resolved module
    /// is recorded with `tracker` and marked loaded.
    pub fn resolve(&self, name: &str, tracker: &dyn ResourceTracker) -> Option<&SceneModule> {
        let module = self.modules.get(name)?;
        let mut seen = BTreeSet::new();
        let mut pending = vec![module];
        while let Some(current) = pending.pop() {
            if !seen.insert(current.name.as_str()) {
                continue;
            }
            tracker.record_module(&current.name);
            self.inventory.insert(&current.name);
            pending.extend(current.imports.iter().filter_map(|i| self.modules.get(i)));
        }
        Some(module)
    }

    /// Resolve every submodule of `package`, in registration order.
    pub fn resolve_package(
        &self,
        package: &str,
        tracker: &dyn ResourceTracker,
    ) -> Option<Vec<&SceneModule>> {
        let names = self.packages.get(package)?;
        tracker.record_module(package);
        self.inventory.insert(package);
        Some(names.iter().filter_map(|n| self.resolve(n, tracker)).collect())
    }

    /// Module name bound to the script at `path`.
    pub fn script_module(&self, path: &Path) -> Option<&str> {
        self.scripts.get(&script_key(path)).map(String::as_str)
    }
}

fn script_key(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
