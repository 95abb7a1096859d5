use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::BootError;

/// Conventional location of the configuration file, relative to the process
/// working directory.
pub const DEFAULT_CONFIG_PATH: &str = "configs/configs.json";

/// Read-only capability over the current configuration snapshot.
///
/// Accessors are lenient: a missing key yields the zero value of the
/// requested type. Callers that must distinguish "missing" from "zero" use
/// [`Config::get_raw`] or match on [`ConfigValue::Absent`].
///
/// Environment variables override file values for the same logical key:
/// the dotted key `database.dns` maps to the variable `DATABASE_DNS`.
pub trait Config: Send + Sync {
    /// The raw subtree under a dotted key, environment override included.
    fn get_raw(&self, key: &str) -> Option<Value>;

    fn get(&self, key: &str) -> ConfigValue {
        self.get_raw(key)
            .as_ref()
            .map(Into::into)
            .unwrap_or(ConfigValue::Absent)
    }

    fn get_string(&self, key: &str) -> String {
        match self.get_raw(key) {
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => String::new(),
        }
    }

    fn get_int(&self, key: &str) -> i64 {
        match self.get_raw(key) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or_else(|| {
                n.as_f64().map(|f| f as i64).unwrap_or(0)
            }),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            Some(Value::Bool(b)) => b as i64,
            _ => 0,
        }
    }

    fn get_float(&self, key: &str) -> f64 {
        match self.get_raw(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
            Some(Value::Bool(b)) => b as u8 as f64,
            _ => 0.0,
        }
    }

    fn get_bool(&self, key: &str) -> bool {
        match self.get_raw(key) {
            Some(Value::Bool(b)) => b,
            Some(Value::String(s)) => s == "1" || s.trim().parse().unwrap_or(false),
            Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            _ => false,
        }
    }

    /// Durations are either a bare number of seconds or a string with units
    /// such as `"1s 500ms"`.
    fn get_duration(&self, key: &str) -> Duration {
        match self.get_raw(key) {
            Some(Value::Number(n)) => Duration::from_secs(n.as_u64().unwrap_or(0)),
            Some(Value::String(s)) => humantime::parse_duration(s.trim()).unwrap_or(Duration::ZERO),
            _ => Duration::ZERO,
        }
    }

    /// A list of strings; a plain string splits on whitespace.
    fn get_string_list(&self, key: &str) -> Vec<String> {
        match self.get_raw(key) {
            Some(Value::Array(items)) => items.iter().filter_map(scalar_to_string).collect(),
            Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
            _ => vec![],
        }
    }

    /// A flat string-to-string map; nested values are skipped.
    fn get_string_map(&self, key: &str) -> HashMap<String, String> {
        match self.get_raw(key) {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| scalar_to_string(v).map(|v| (k.clone(), v)))
                .collect(),
            _ => HashMap::new(),
        }
    }
}

/// Decoding a configuration subtree into a caller-supplied shape.
pub trait ConfigExt {
    fn unmarshal_into<T: DeserializeOwned>(&self, key: &str) -> Result<T, BootError>;
}

impl<C: Config + ?Sized> ConfigExt for C {
    fn unmarshal_into<T: DeserializeOwned>(&self, key: &str) -> Result<T, BootError> {
        let value = self.get_raw(key).unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|source| BootError::Decode {
            key: key.to_string(),
            source,
        })
    }
}

/// A configuration value as a tagged variant, so callers pattern-match
/// instead of casting.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigValue {
    Absent,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<ConfigValue>),
    Map(HashMap<String, ConfigValue>),
}

impl From<&Value> for ConfigValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => ConfigValue::Absent,
            Value::Bool(b) => ConfigValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ConfigValue::Integer(i),
                None => ConfigValue::Float(n.as_f64().unwrap_or(0.0)),
            },
            Value::String(s) => ConfigValue::String(s.clone()),
            Value::Array(items) => ConfigValue::List(items.iter().map(Into::into).collect()),
            Value::Object(map) => {
                ConfigValue::Map(map.iter().map(|(k, v)| (k.clone(), v.into())).collect())
            }
        }
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn env_name(key: &str) -> String {
    key.replace('.', "_").to_uppercase()
}

/// Configuration backed by a JSON file, republished as immutable snapshots.
///
/// The file is parsed once at construction. With watching enabled, a
/// background watcher thread reloads it on every modification and swaps the
/// new snapshot in atomically: readers always observe a complete snapshot,
/// never a partially-reloaded one. A rewrite that fails to parse keeps the
/// previous snapshot.
pub struct FileConfig {
    snapshot: Arc<ArcSwap<Value>>,
    path: PathBuf,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FileConfig {
    /// Load the file once, without watching for changes.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BootError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = read_snapshot(&path)?;
        Ok(Self {
            snapshot: Arc::new(ArcSwap::from_pointee(snapshot)),
            path,
            watcher: Mutex::new(None),
        })
    }

    /// Load the file and keep it under watch for the provider's lifetime.
    pub fn load_and_watch(path: impl AsRef<Path>) -> Result<Self, BootError> {
        let provider = Self::load(path)?;
        let snapshot = provider.snapshot.clone();
        let watched = provider.path.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                if let Ok(event) = res {
                    if event.kind.is_modify() || event.kind.is_create() {
                        match reload_snapshot(&watched, &snapshot) {
                            Ok(()) => {
                                tracing::info!("configuration reloaded from {}", watched.display())
                            }
                            Err(e) => {
                                tracing::error!("keeping previous configuration snapshot: {e}")
                            }
                        }
                    }
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|source| BootError::ConfigLoad {
            path: provider.path.clone(),
            source: source.into(),
        })?;
        watcher
            .watch(&provider.path, RecursiveMode::NonRecursive)
            .map_err(|source| BootError::ConfigLoad {
                path: provider.path.clone(),
                source: source.into(),
            })?;
        tracing::info!("watching configuration file {}", provider.path.display());
        *provider.watcher.lock() = Some(watcher);
        Ok(provider)
    }

    /// Re-read the source file and swap in the new snapshot.
    pub fn reload(&self) -> Result<(), BootError> {
        reload_snapshot(&self.path, &self.snapshot)
    }

    /// The current snapshot as one consistent tree.
    pub fn snapshot(&self) -> Arc<Value> {
        self.snapshot.load_full()
    }
}

impl Config for FileConfig {
    fn get_raw(&self, key: &str) -> Option<Value> {
        if let Ok(text) = env::var(env_name(key)) {
            return Some(Value::String(text));
        }
        let snapshot = self.snapshot.load();
        let mut node: &Value = &snapshot;
        for part in key.split('.') {
            node = node.get(part)?;
        }
        (!node.is_null()).then(|| node.clone())
    }
}

fn read_snapshot(path: &Path) -> Result<Value, BootError> {
    let text = std::fs::read_to_string(path).map_err(|source| BootError::ConfigLoad {
        path: path.to_path_buf(),
        source: source.into(),
    })?;
    serde_json::from_str(&text).map_err(|source| BootError::ConfigLoad {
        path: path.to_path_buf(),
        source: source.into(),
    })
}

fn reload_snapshot(path: &Path, snapshot: &ArcSwap<Value>) -> Result<(), BootError> {
    let fresh = read_snapshot(path)?;
    snapshot.store(Arc::new(fresh));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, json: &str) -> PathBuf {
        let path = dir.path().join("configs.json");
        fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn missing_keys_yield_zero_values() {
        let dir = TempDir::new().unwrap();
        let cfg = FileConfig::load(write_config(&dir, "{}")).unwrap();
        assert_eq!(cfg.get("missing"), ConfigValue::Absent);
        assert_eq!(cfg.get_string("missing"), "");
        assert_eq!(cfg.get_int("missing"), 0);
        assert_eq!(cfg.get_float("missing"), 0.0);
        assert!(!cfg.get_bool("missing"));
        assert_eq!(cfg.get_duration("missing"), Duration::ZERO);
        assert!(cfg.get_string_list("missing").is_empty());
        assert!(cfg.get_string_map("missing").is_empty());
    }

    #[test]
    fn typed_accessors_read_nested_keys() {
        let dir = TempDir::new().unwrap();
        let cfg = FileConfig::load(write_config(
            &dir,
            r#"{
                "database": {"dns": "postgres://localhost/app", "maxConns": 8},
                "logger": {"level": "warning"},
                "poll": {"interval": "2s 500ms", "tags": ["a", "b"], "labels": {"env": "dev", "zone": 3}},
                "flags": {"verbose": true}
            }"#,
        ))
        .unwrap();
        assert_eq!(cfg.get_string("database.dns"), "postgres://localhost/app");
        assert_eq!(cfg.get_int("database.maxConns"), 8);
        assert_eq!(cfg.get_string("logger.level"), "warning");
        assert!(cfg.get_bool("flags.verbose"));
        assert_eq!(cfg.get_duration("poll.interval"), Duration::from_millis(2500));
        assert_eq!(cfg.get_string_list("poll.tags"), vec!["a", "b"]);
        let labels = cfg.get_string_map("poll.labels");
        assert_eq!(labels.get("env").map(String::as_str), Some("dev"));
        assert_eq!(labels.get("zone").map(String::as_str), Some("3"));
        assert_eq!(
            cfg.get("database.maxConns"),
            ConfigValue::Integer(8)
        );
    }

    #[test]
    fn environment_overrides_file_values() {
        let dir = TempDir::new().unwrap();
        let cfg = FileConfig::load(write_config(
            &dir,
            r#"{"override": {"probe": "from-file"}}"#,
        ))
        .unwrap();
        assert_eq!(cfg.get_string("override.probe"), "from-file");
        env::set_var("OVERRIDE_PROBE", "from-env");
        assert_eq!(cfg.get_string("override.probe"), "from-env");
        env::remove_var("OVERRIDE_PROBE");
    }

    #[test]
    fn subtrees_decode_into_caller_shapes() {
        #[derive(serde::Deserialize)]
        struct DbSection {
            dns: String,
            #[serde(rename = "maxConns")]
            max_conns: u32,
        }
        let dir = TempDir::new().unwrap();
        let cfg = FileConfig::load(write_config(
            &dir,
            r#"{"database": {"dns": "postgres://localhost/app", "maxConns": 8}}"#,
        ))
        .unwrap();
        let section: DbSection = cfg.unmarshal_into("database").unwrap();
        assert_eq!(section.dns, "postgres://localhost/app");
        assert_eq!(section.max_conns, 8);

        let err = cfg.unmarshal_into::<Vec<String>>("database").unwrap_err();
        assert!(matches!(err, BootError::Decode { .. }));
    }

    #[test]
    fn malformed_files_fail_to_load() {
        let dir = TempDir::new().unwrap();
        let err = FileConfig::load(write_config(&dir, "{not json")).err().unwrap();
        assert!(matches!(err, BootError::ConfigLoad { .. }));
        let err = FileConfig::load(dir.path().join("nope.json")).err().unwrap();
        assert!(matches!(err, BootError::ConfigLoad { .. }));
    }

    #[test]
    fn readers_never_observe_a_torn_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, r#"{"left": 0, "right": 0}"#);
        let cfg = Arc::new(FileConfig::load(&path).unwrap());

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cfg = cfg.clone();
                let stop = stop.clone();
                std::thread::spawn(move || {
                    while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                        let snapshot = cfg.snapshot();
                        assert_eq!(snapshot["left"], snapshot["right"]);
                    }
                })
            })
            .collect();

        for generation in 1..200 {
            fs::write(
                &path,
                format!(r#"{{"left": {generation}, "right": {generation}}}"#),
            )
            .unwrap();
            cfg.reload().unwrap();
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(cfg.get_int("left"), 199);
    }

    #[test]
    fn file_changes_are_picked_up_by_the_watcher() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, r#"{"watched": 1}"#);
        let cfg = FileConfig::load_and_watch(&path).unwrap();
        assert_eq!(cfg.get_int("watched"), 1);

        fs::write(&path, r#"{"watched": 2}"#).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while cfg.get_int("watched") != 2 {
            assert!(
                std::time::Instant::now() < deadline,
                "watcher did not observe the rewrite"
            );
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}
