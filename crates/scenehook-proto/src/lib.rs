// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Build-query schema shared by the sandbox runner and its out-of-process
//! workers, plus the packet framing that carries it across the pipe pair.
//!
//! Everything here is plain data: queries, scene metadata, listings of scene
//! functions and dependency manifests. The live scene object never crosses
//! the boundary; workers send its serialized text instead.

pub mod wire;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

/// Free-form argument value forwarded to scene functions.
pub type ArgValue = ciborium::value::Value;

/// Extra keyword arguments for a scene function, keyed by parameter name.
pub type ExtraArgs = BTreeMap<String, ArgValue>;

/// Names one scene function: `module.function`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SceneRef {
    /// Fully qualified module name (`pkg.sub` or the script module name).
    pub module: String,
    /// Function name inside the module.
    pub function: String,
}

impl SceneRef {
    /// Build a reference from module and function names.
    pub fn new(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
        }
    }
}

impl fmt::Display for SceneRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.function)
    }
}

/// What a query asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
    /// Build one scene.
    Scene(SceneRef),
    /// Enumerate the scene functions of the target.
    List,
}

/// Where scene functions are looked up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleRef {
    /// A standalone script file, loaded by path.
    Script(PathBuf),
    /// A package whose submodules hold scene functions.
    Package(String),
}

/// Target-specific replacements applied before the scene function runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overrides {
    /// Rendering backend (e.g. `"opengl"`, `"vulkan"`).
    pub backend: Option<String>,
    /// Target operating system name.
    pub system: Option<String>,
}

/// Options for the performance HUD envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HudOptions {
    /// Number of frames averaged per measurement.
    pub measure_window: u32,
    /// HUD refresh rate as a rational (frames per second).
    pub refresh_rate: (u32, u32),
    /// HUD background color (RGBA, 0..=1).
    pub bg_color: [f32; 4],
}

impl Default for HudOptions {
    fn default() -> Self {
        Self {
            measure_window: 60,
            refresh_rate: (1, 4),
            bg_color: [0.0, 0.0, 0.0, 0.8],
        }
    }
}

/// Pack an RGBA color into one `u32`, one byte per channel, red in the most
/// significant byte. Each channel is `round(c * 255)` keeping the low eight
/// bits, so out-of-range channels wrap instead of saturating.
pub fn pack_rgba(color: [f32; 4]) -> u32 {
    color.iter().enumerate().fold(0u32, |acc, (i, c)| {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let byte = ((c * 255.0).round() as i64 & 0xff) as u32;
        acc | byte << (24 - i * 8)
    })
}

/// One request to the sandbox. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneQuery {
    /// Build or list.
    pub kind: QueryKind,
    /// Script or package to resolve.
    pub target: ModuleRef,
    /// Keyword arguments forwarded to the scene function.
    pub extra_args: ExtraArgs,
    /// Backend/system replacements.
    pub overrides: Overrides,
    /// Wrap the built scene in a HUD envelope when set.
    pub hud: Option<HudOptions>,
}

impl SceneQuery {
    /// Query building `scene` from `target` with no extra arguments.
    pub fn scene(target: ModuleRef, scene: SceneRef) -> Self {
        Self {
            kind: QueryKind::Scene(scene),
            target,
            extra_args: ExtraArgs::new(),
            overrides: Overrides::default(),
            hud: None,
        }
    }

    /// Query listing the scene functions of `target`.
    pub fn list(target: ModuleRef) -> Self {
        Self {
            kind: QueryKind::List,
            target,
            extra_args: ExtraArgs::new(),
            overrides: Overrides::default(),
            hud: None,
        }
    }

    /// Copy of this query with `overrides` replaced.
    pub fn with_overrides(&self, overrides: Overrides) -> Self {
        Self {
            overrides,
            ..self.clone()
        }
    }

    /// `module.function` for scene queries.
    pub fn scene_ref(&self) -> Option<&SceneRef> {
        match &self.kind {
            QueryKind::Scene(scene) => Some(scene),
            QueryKind::List => None,
        }
    }
}

/// Metadata of a built scene, as left in the scene configuration by the
/// scene function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneMeta {
    /// Duration in seconds.
    pub duration: f64,
    /// Aspect ratio as a rational.
    pub aspect_ratio: (u32, u32),
    /// Framerate as a rational.
    pub framerate: (u32, u32),
    /// Clear color (RGBA, 0..=1).
    pub clear_color: [f32; 4],
    /// MSAA sample count (0 disables).
    pub samples: u32,
    /// Backend the scene was built for.
    pub backend: String,
    /// System the scene was built for.
    pub system: String,
    /// Media files referenced by the scene.
    pub media_files: Vec<PathBuf>,
    /// Other files referenced by the scene.
    pub aux_files: Vec<PathBuf>,
}

impl SceneMeta {
    /// Every file the scene references: media first, then auxiliary files.
    pub fn referenced_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.media_files.iter().chain(self.aux_files.iter())
    }
}

/// UI control associated with a scene function parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Control {
    /// Numeric slider.
    Range {
        /// Lower and upper bounds.
        range: [f64; 2],
        /// Step divisor (1 = integers).
        unit_base: u32,
    },
    /// Fixed-size numeric vector.
    Vector {
        /// Component count.
        n: u32,
        /// Optional per-component minimum.
        min: Option<Vec<f64>>,
        /// Optional per-component maximum.
        max: Option<Vec<f64>>,
    },
    /// RGBA color picker.
    Color,
    /// Checkbox.
    Bool,
    /// File chooser.
    File {
        /// Name filter (e.g. `"Images (*.png *.jpg)"`).
        filter: String,
    },
    /// Choice among fixed strings.
    List {
        /// Allowed values.
        choices: Vec<String>,
    },
    /// Free text.
    Text,
}

/// Describes one tweakable parameter of a scene function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Parameter name (the `extra_args` key).
    pub name: String,
    /// Default value.
    pub default: ArgValue,
    /// Control used to edit it.
    pub control: Control,
}

/// One entry of a `List` query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneListing {
    /// Module holding the function.
    pub module: String,
    /// Scene function name.
    pub function: String,
    /// Documentation string, if any.
    pub doc: Option<String>,
    /// Tweakable parameters.
    pub params: Vec<ParamSpec>,
}

/// Files and modules consumed by one build. Advisory: used to invalidate
/// caches and refresh file watches, never to decide build correctness.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Files opened during the build.
    pub files: BTreeSet<PathBuf>,
    /// Modules resolved during the build.
    pub modules: BTreeSet<String>,
}

impl Manifest {
    /// True when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.modules.is_empty()
    }
}

/// Worker-side outcome of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerReply {
    /// A built scene, serialized.
    Scene {
        /// Native serialization of the scene graph.
        serialized: String,
        /// Scene metadata.
        meta: SceneMeta,
    },
    /// Scene functions found in the target.
    List(Vec<SceneListing>),
    /// Module resolution failed.
    Unresolved(String),
    /// The scene function raised; formatted trace.
    Failed(String),
}

/// Full worker response: outcome plus dependency manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    /// Outcome of the query.
    pub reply: WorkerReply,
    /// Resources consumed while answering.
    pub manifest: Manifest,
}

/// Canonical envelope carried as the payload of a packet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpEnvelope<P> {
    /// Operation name (`"build_request"` or `"build_reply"`).
    pub op: String,
    /// Operation-specific body.
    pub payload: P,
}

/// Messages exchanged with a build worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Parent → worker (op = "build_request").
    BuildRequest(SceneQuery),
    /// Worker → parent (op = "build_reply").
    BuildReply(WorkerResponse),
}
