//! Compiled-in deployment manifest.
//!
//! Everything here is baked in at build time and must be updated together with
//! the bundled assets. Bump [`VERSION`] on every deployable build, otherwise
//! activation finds nothing stale to delete and new assets never replace old ones.

/// Build version. Drives the generation (store) name.
pub const VERSION: &str = "v2.6.6";

/// Prefix shared by every generation name.
pub const GENERATION_PREFIX: &str = "pwa-offline-cache-";

/// Shell documents that must be cached before the layer is ready.
pub const MINIMAL_ASSETS: &[&str] = &["/", "/index.html"];

/// Runtime assets cached in the background after activation.
pub const DEFERRED_ASSETS: &[&str] = &[
  // application
  "/compiler.py",
  "/assets/index-DH8Z11ee.js",
  "/vendor/pyscript/dist/core.css",
  "/vendor/pyscript/dist/core.js",
  "/vendor/marked/marked.min.js",
  "/README.md",
  // initial libraries
  "/vendor/libraries/basic-991cnx-verc.ggt",
  "/vendor/libraries/basic-common.macro",
  // interpreter runtime and packages
  "/vendor/pyodide/pyodide/pyodide.js",
  "/vendor/pyodide/pyodide/pyodide.asm.wasm",
  "/vendor/pyodide/pyodide/pyodide.asm.js",
  "/vendor/pyodide/pyodide/repodata.json",
  "/vendor/pyodide/pyodide/python_stdlib.zip",
  "/vendor/pyodide/pyodide/micropip-0.3.0-py3-none-any.whl",
  "/vendor/pyodide/pyodide/packaging-23.0-py3-none-any.whl",
  "/vendor/toml/toml.js",
  "/vendor/toml/toml.js.map",
  "/vendor/pypi/lark-1.3.1-py3-none-any.whl",
  "/vendor/pypi/lark/json.json",
  "/vendor/pyscript/dist/error-e4fe78fd.js",
  "/vendor/pyodide/pyodide/pyodide.mjs",
  // icons
  "/favicon.ico",
  "/icon-192x192.png",
  "/icon-512x512.png",
];

/// Third-party URL fragments and the local path prefix that replaces them.
///
/// Evaluated in order, first match wins. `toml.js` shadows `toml.js.map`, which
/// still resolves correctly because the `.map` suffix is carried over.
pub const REDIRECT_RULES: &[(&str, &str)] = &[
  (
    "cdn.jsdelivr.net/npm/@webreflection/toml-j0.4/toml.js",
    "/vendor/toml/toml.js",
  ),
  (
    "cdn.jsdelivr.net/npm/@webreflection/toml-j0.4/toml.js.map",
    "/vendor/toml/toml.js.map",
  ),
  (
    "lark-1.3.1-py3-none-any.whl",
    "/vendor/pypi/lark-1.3.1-py3-none-any.whl",
  ),
  ("pypi.org/pypi/lark/json", "/vendor/pypi/lark/json.json"),
  (
    "cdn.jsdelivr.net/pyodide/v0.23.4/full/",
    "/vendor/pyodide/pyodide/",
  ),
];

/// Local paths that are never cached (live version check).
pub const BYPASS_PATHS: &[&str] = &["/version"];

/// The full set of static inputs for one build.
#[derive(Debug, Clone)]
pub struct Manifest {
  pub version: String,
  pub minimal: Vec<String>,
  pub deferred: Vec<String>,
  pub redirects: Vec<(String, String)>,
  pub bypass: Vec<String>,
}

impl Manifest {
  /// The manifest compiled into this binary.
  pub fn builtin() -> Self {
    Self {
      version: VERSION.to_string(),
      minimal: MINIMAL_ASSETS.iter().map(|s| s.to_string()).collect(),
      deferred: DEFERRED_ASSETS.iter().map(|s| s.to_string()).collect(),
      redirects: REDIRECT_RULES
        .iter()
        .map(|(m, p)| (m.to_string(), p.to_string()))
        .collect(),
      bypass: BYPASS_PATHS.iter().map(|s| s.to_string()).collect(),
    }
  }

  /// Store name for this manifest's version.
  pub fn generation_name(&self) -> String {
    generation_name(&self.version)
  }
}

/// Store name derived from a version string.
pub fn generation_name(version: &str) -> String {
  format!("{}{}", GENERATION_PREFIX, version)
}
