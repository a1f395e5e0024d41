//! Module and API knowledge
//!
//! The builder asks two questions while resolving calls: where a module comes
//! from, and whether `qualifier.call` belongs to a sensitive category.
//! [`StaticKnowledgeStore`] answers both from built-in tables that can be
//! extended with a JSON overlay.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::debug;

use crate::category::{Category, parse_category_list};
use crate::error::ServiceError;
use crate::pdg::Derivation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleClass {
    Builtin,
    ThirdParty,
    NotIn,
}

pub trait KnowledgeStore: Send + Sync {
    fn classify(&self, module: &str) -> Result<ModuleClass, ServiceError>;

    /// Categories of `qualifier.call`; empty when the call is not sensitive.
    /// `hint` carries the category of the object the method is called on,
    /// for third-party lookups.
    fn sensitive_call(
        &self,
        qualifier: &str,
        call: &str,
        derivation: Derivation,
        hint: Option<Category>,
    ) -> Result<Vec<Category>, ServiceError>;

    /// Makes an unknown third-party module known. Returns `false` when the
    /// module could not be registered.
    fn register_module(&self, module: &str, dependencies: &[String]) -> Result<bool, ServiceError>;
}

const BUILTIN_MODULES: &[&str] = &[
    "assert",
    "async_hooks",
    "buffer",
    "child_process",
    "cluster",
    "console",
    "constants",
    "crypto",
    "dgram",
    "diagnostics_channel",
    "dns",
    "domain",
    "events",
    "fs",
    "fs/promises",
    "http",
    "http2",
    "https",
    "inspector",
    "module",
    "net",
    "os",
    "path",
    "perf_hooks",
    "process",
    "punycode",
    "querystring",
    "readline",
    "repl",
    "stream",
    "string_decoder",
    "sys",
    "timers",
    "tls",
    "trace_events",
    "tty",
    "url",
    "util",
    "v8",
    "vm",
    "wasi",
    "worker_threads",
    "zlib",
    // globals
    "Buffer",
    "JSON",
    "Function",
    "URL",
    "atob",
    "btoa",
    "eval",
    "fetch",
    "globalThis",
    "setInterval",
    "setTimeout",
];

const BUILTIN_APIS: &[(&str, &str, &str)] = &[
    ("fs", "readFile", "12"),
    ("fs", "readFileSync", "12"),
    ("fs", "writeFile", "14"),
    ("fs", "writeFileSync", "14"),
    ("fs", "appendFile", "14"),
    ("fs", "appendFileSync", "14"),
    ("fs", "readdir", "6"),
    ("fs", "readdirSync", "6"),
    ("fs", "exists", "6"),
    ("fs", "existsSync", "6"),
    ("fs", "stat", "3"),
    ("fs", "statSync", "3"),
    ("fs", "unlink", "8"),
    ("fs", "unlinkSync", "8"),
    ("fs", "rm", "8"),
    ("fs", "rmSync", "8"),
    ("fs", "rmdir", "8"),
    ("fs", "rmdirSync", "8"),
    ("fs", "chmod", "9"),
    ("fs", "chmodSync", "9"),
    ("fs", "chown", "9"),
    ("fs", "chownSync", "9"),
    ("fs", "mkdir", "10"),
    ("fs", "mkdirSync", "10"),
    ("fs", "copyFile", "7"),
    ("fs", "copyFileSync", "7"),
    ("fs", "rename", "7"),
    ("fs", "renameSync", "7"),
    ("fs", "createReadStream", "18"),
    ("fs", "createWriteStream", "17"),
    ("fs", "open", "19"),
    ("fs", "openSync", "19"),
    ("fs.promises", "readFile", "12"),
    ("fs.promises", "writeFile", "14"),
    ("fs.promises", "readdir", "6"),
    ("fs/promises", "readFile", "12"),
    ("fs/promises", "writeFile", "14"),
    ("readStream", "pipe", "38"),
    ("writeStream", "write", "13"),
    ("child_process", "exec", "37"),
    ("child_process", "execSync", "37"),
    ("child_process", "spawn", "35"),
    ("child_process", "spawnSync", "35"),
    ("child_process", "fork", "35"),
    ("child_process", "execFile", "36"),
    ("child_process", "execFileSync", "36"),
    ("http", "request", "20"),
    ("http", "get", "20"),
    ("http", "createServer", "22"),
    ("https", "request", "20"),
    ("https", "get", "20"),
    ("https", "createServer", "22"),
    ("request", "write", "23"),
    ("request", "end", "23"),
    ("net", "connect", "22"),
    ("net", "createConnection", "22"),
    ("net", "Socket", "22"),
    ("net", "createServer", "22"),
    ("tls", "connect", "22"),
    ("dgram", "createSocket", "22"),
    ("socket", "connect", "22"),
    ("socket", "write", "23"),
    ("socket", "send", "23"),
    ("socket", "on", "24"),
    ("socket", "pipe", "38"),
    ("server", "listen", "27"),
    ("dns", "lookup", "21"),
    ("dns", "resolve", "21"),
    ("dns", "resolve4", "21"),
    ("dns", "resolveTxt", "21"),
    ("os", "hostname", "4"),
    ("os", "platform", "4"),
    ("os", "type", "4"),
    ("os", "arch", "4"),
    ("os", "release", "4"),
    ("os", "cpus", "4"),
    ("os", "totalmem", "4"),
    ("os", "userInfo", "5"),
    ("os", "homedir", "5"),
    ("os", "networkInterfaces", "26"),
    ("path", "join", "1"),
    ("path", "resolve", "1"),
    ("Buffer", "from", "28"),
    ("buf", "toString", "29"),
    ("atob", "atob", "30"),
    ("btoa", "btoa", "29"),
    ("crypto", "createCipheriv", "31"),
    ("crypto", "createCipher", "31"),
    ("crypto", "createDecipheriv", "32"),
    ("crypto", "createDecipher", "32"),
    ("cipher", "update", "33"),
    ("cipher", "final", "33"),
    ("decipher", "update", "34"),
    ("decipher", "final", "34"),
    ("zlib", "gzip", "15"),
    ("zlib", "gzipSync", "15"),
    ("zlib", "deflate", "15"),
    ("zlib", "gunzip", "16"),
    ("zlib", "gunzipSync", "16"),
    ("zlib", "inflate", "16"),
    ("eval", "eval", "39"),
    ("vm", "runInNewContext", "39"),
    ("vm", "runInThisContext", "39"),
    ("vm", "runInContext", "39"),
    ("vm", "Script", "39"),
    ("script", "runInThisContext", "39"),
    ("script", "runInNewContext", "39"),
    ("fetch", "fetch", "20"),
];

const THIRD_PARTY_APIS: &[(&str, &str, &str)] = &[
    ("axios", "axios", "20"),
    ("axios", "get", "20"),
    ("axios", "post", "20"),
    ("axios", "request", "20"),
    ("request", "request", "20"),
    ("request", "get", "20"),
    ("request", "post", "20"),
    ("node-fetch", "node-fetch", "20"),
    ("got", "got", "20"),
    ("shelljs", "exec", "37"),
    ("execa", "execa", "37"),
];

#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("failed to read knowledge file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid knowledge file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Additional knowledge loaded from JSON.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct KnowledgeOverlay {
    pub builtin_modules: Vec<String>,
    pub third_party_modules: Vec<String>,
    pub apis: Vec<ApiEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ApiEntry {
    pub qualifier: String,
    pub name: String,
    pub derivation: DerivationName,
    /// `-`-separated category ids, or `Others`.
    pub categories: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivationName {
    Builtin,
    ThirdParty,
}

impl From<DerivationName> for Derivation {
    fn from(value: DerivationName) -> Self {
        match value {
            DerivationName::Builtin => Derivation::Builtin,
            DerivationName::ThirdParty => Derivation::ThirdParty,
        }
    }
}

type ApiKey = (Derivation, String, String);

#[derive(Debug, Default)]
struct Tables {
    builtin: HashSet<String>,
    third_party: HashSet<String>,
    apis: HashMap<ApiKey, Vec<Category>>,
}

/// Table-driven knowledge store. Writers take the lock, so one store can be
/// shared between packages analyzed in parallel.
#[derive(Debug)]
pub struct StaticKnowledgeStore {
    tables: RwLock<Tables>,
}

impl Default for StaticKnowledgeStore {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl StaticKnowledgeStore {
    pub fn empty() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    pub fn with_defaults() -> Self {
        let store = Self::empty();
        {
            let mut tables = store.tables.write();
            tables
                .builtin
                .extend(BUILTIN_MODULES.iter().map(|m| m.to_string()));
            for (qualifier, name, categories) in BUILTIN_APIS {
                tables.apis.insert(
                    (Derivation::Builtin, qualifier.to_string(), name.to_string()),
                    parse_category_list(categories),
                );
            }
            for (qualifier, name, categories) in THIRD_PARTY_APIS {
                tables.third_party.insert(qualifier.to_string());
                tables.apis.insert(
                    (Derivation::ThirdParty, qualifier.to_string(), name.to_string()),
                    parse_category_list(categories),
                );
            }
        }
        store
    }

    pub fn load_overlay(&self, path: &Path) -> Result<(), KnowledgeError> {
        let content = std::fs::read_to_string(path).map_err(|source| KnowledgeError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let overlay: KnowledgeOverlay =
            serde_json::from_str(&content).map_err(|source| KnowledgeError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(
            path = %path.display(),
            apis = overlay.apis.len(),
            "loaded knowledge overlay"
        );
        self.apply(overlay);
        Ok(())
    }

    pub fn apply(&self, overlay: KnowledgeOverlay) {
        let mut tables = self.tables.write();
        tables.builtin.extend(overlay.builtin_modules);
        tables.third_party.extend(overlay.third_party_modules);
        for entry in overlay.apis {
            tables.apis.insert(
                (entry.derivation.into(), entry.qualifier, entry.name),
                parse_category_list(&entry.categories),
            );
        }
    }

    pub fn add_third_party(&self, module: &str) {
        self.tables.write().third_party.insert(module.to_string());
    }

    pub fn builtin_modules(&self) -> Vec<String> {
        let mut modules: Vec<String> = self.tables.read().builtin.iter().cloned().collect();
        modules.sort();
        modules
    }
}

impl KnowledgeStore for StaticKnowledgeStore {
    fn classify(&self, module: &str) -> Result<ModuleClass, ServiceError> {
        if !is_legal_module_name(module) {
            return Ok(ModuleClass::NotIn);
        }
        let module = strip_node_prefix(module);
        let tables = self.tables.read();
        let class = if tables.builtin.contains(module) {
            ModuleClass::Builtin
        } else if tables.third_party.contains(module) {
            ModuleClass::ThirdParty
        } else {
            ModuleClass::NotIn
        };
        Ok(class)
    }

    fn sensitive_call(
        &self,
        qualifier: &str,
        call: &str,
        derivation: Derivation,
        _hint: Option<Category>,
    ) -> Result<Vec<Category>, ServiceError> {
        let key = (
            derivation,
            strip_node_prefix(qualifier).to_string(),
            call.to_string(),
        );
        Ok(self
            .tables
            .read()
            .apis
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    fn register_module(&self, _module: &str, _dependencies: &[String]) -> Result<bool, ServiceError> {
        Ok(false)
    }
}

/// npm package-name rules relevant to `require` arguments.
pub fn is_legal_module_name(name: &str) -> bool {
    name.len() <= 214
        && !name.starts_with('.')
        && !name.starts_with('_')
        && !name.contains(' ')
        && !name.starts_with("node_modules")
}

pub fn strip_node_prefix(module: &str) -> &str {
    module.strip_prefix("node:").unwrap_or(module)
}

/// Registry name of a required module: a scoped dependency whose last segment
/// equals `module` wins over the bare name.
pub fn download_name(module: &str, dependencies: &[String]) -> String {
    dependencies
        .iter()
        .find(|dependency| match dependency.rsplit_once('/') {
            Some((_, last)) => last == module,
            None => dependency.as_str() == module,
        })
        .cloned()
        .unwrap_or_else(|| module.to_string())
}
