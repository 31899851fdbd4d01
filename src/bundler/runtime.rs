//! JavaScript emitted around the bundled modules

/// Module registry and interop helpers, placed at the top of the bundle IIFE
pub const REGISTRY: &str = r#"var __modules = {};
var __cache = {};
function __require(id) {
  var cached = __cache[id];
  if (cached !== undefined) return cached.exports;
  var module = { exports: {} };
  __cache[id] = module;
  __modules[id].call(module.exports, module, module.exports, __require);
  return module.exports;
}
function __markESM(exports) {
  Object.defineProperty(exports, "__esModule", { value: true });
}
function __export(exports, getters) {
  for (var name in getters) {
    Object.defineProperty(exports, name, { enumerable: true, get: getters[name] });
  }
}
function __bindKey(target, source, key) {
  Object.defineProperty(target, key, {
    enumerable: true,
    get: function () { return source[key]; }
  });
}
function __importDefault(mod) {
  return mod && mod.__esModule ? mod["default"] : mod;
}
function __importStar(mod) {
  if (mod && mod.__esModule) return mod;
  var ns = {};
  if (mod != null) {
    for (var key in mod) {
      if (key !== "default" && Object.prototype.hasOwnProperty.call(mod, key)) __bindKey(ns, mod, key);
    }
  }
  ns["default"] = mod;
  return ns;
}
function __reexportAll(exports, mod) {
  for (var key in mod) {
    if (key !== "default" && !Object.prototype.hasOwnProperty.call(exports, key)) __bindKey(exports, mod, key);
  }
}
"#;

/// Emitted only when some module lowered `??` through the helper
pub const NULLISH: &str = r#"function __nullish(value, fallback) {
  return value !== null && value !== void 0 ? value : fallback();
}
"#;

/// Value bound to `console` when console output is silenced
pub const SILENT_CONSOLE: &str =
    "new Proxy({}, { get: function () { return function () {}; } })";

/// `var window = globalThis, ...` line stubbing host globals the runtime lacks
pub fn host_shims(globals: &[String], silence_console: bool) -> Option<String> {
    let mut bindings: Vec<String> = globals
        .iter()
        .filter(|name| name.as_str() != "console")
        .map(|name| format!("{} = globalThis", name))
        .collect();
    if silence_console {
        bindings.push(format!("console = {}", SILENT_CONSOLE));
    }
    if bindings.is_empty() {
        None
    } else {
        Some(format!("var {};", bindings.join(", ")))
    }
}
