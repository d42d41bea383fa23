//! Worker-process plugins
//!
//! A plugin unit that is an executable runs as a long-lived worker speaking
//! newline-delimited JSON over stdin/stdout. Loading spawns a fresh worker;
//! unloading stops it. Replacing the worker is how a changed unit gets
//! picked up without restarting the host.

use super::contract::{Plugin, PluginMetadata, ToolHandler, ToolSpec};
use super::discovery::{is_executable, PluginUnit};
use super::loader::UnitImporter;
use super::protocol::{PluginMethod, PluginRequest, PluginResponse, Registration, ToolDefinition};
use crate::error::PluginError;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// How long a worker gets to exit after its stdin is closed
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Spawn attempts for an executable that is briefly busy
const SPAWN_ATTEMPTS: u32 = 5;
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(50);

/// `ETXTBSY` on Linux and macOS
#[cfg(unix)]
fn is_text_busy(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(26)
}

#[cfg(not(unix))]
fn is_text_busy(_e: &std::io::Error) -> bool {
    false
}

type SharedWorker = Arc<Mutex<Option<Worker>>>;

/// A running worker process
struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl Worker {
    /// Spawn the unit's executable. A unit that is still being written
    /// (`ETXTBSY`) gets a few more attempts.
    async fn spawn(path: &Path) -> Result<Self, String> {
        let mut attempt = 1;
        let mut child = loop {
            let spawned = Command::new(path)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .spawn();

            match spawned {
                Ok(child) => break child,
                Err(e) if is_text_busy(&e) && attempt < SPAWN_ATTEMPTS => {
                    debug!("Plugin {:?} busy, retrying spawn", path);
                    attempt += 1;
                    tokio::time::sleep(SPAWN_RETRY_DELAY).await;
                }
                Err(e) => return Err(format!("Failed to spawn plugin: {}", e)),
            }
        };

        let stdin = child.stdin.take().ok_or("Failed to capture plugin stdin")?;
        let stdout = child
            .stdout
            .take()
            .ok_or("Failed to capture plugin stdout")?;

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    /// Send one request and wait for the response carrying its id
    async fn call(&mut self, request: &PluginRequest) -> Result<PluginResponse, String> {
        let request_json = serde_json::to_string(request)
            .map_err(|e| format!("Failed to serialize request: {}", e))?;

        self.stdin
            .write_all(format!("{}\n", request_json).as_bytes())
            .await
            .map_err(|e| format!("Failed to write to plugin: {}", e))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| format!("Failed to write to plugin: {}", e))?;

        while let Some(line) = self
            .stdout
            .next_line()
            .await
            .map_err(|e| format!("Failed to read plugin output: {}", e))?
        {
            match serde_json::from_str::<PluginResponse>(&line) {
                Ok(response) if response.id == request.id => return Ok(response),
                Ok(response) => debug!("Skipping stale response {}", response.id),
                Err(_) => debug!("Ignoring non-protocol output: {}", line),
            }
        }

        Err("Plugin closed without responding".to_string())
    }

    /// Close stdin and give the worker a moment to exit before killing it
    async fn shutdown(self) {
        let Worker {
            mut child, stdin, ..
        } = self;
        drop(stdin);

        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!("Plugin worker exited: {}", status),
            Ok(Err(e)) => warn!("Error waiting for plugin worker: {}", e),
            Err(_) => {
                warn!("Plugin worker did not exit, killing it");
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill plugin worker: {}", e);
                }
            }
        }
    }
}

/// Send a request to a shared worker, bounded by `timeout`
async fn call_worker(
    worker: &SharedWorker,
    request: PluginRequest,
    timeout: Duration,
) -> Result<PluginResponse, String> {
    let mut guard = worker.lock().await;

    let outcome = {
        let Some(running) = guard.as_mut() else {
            return Err("Plugin worker is not running".to_string());
        };
        tokio::time::timeout(timeout, running.call(&request)).await
    };

    match outcome {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            // A worker that stopped talking is of no further use
            if e.contains("closed") {
                guard.take();
            }
            Err(e)
        }
        Err(_) => Err("Plugin timed out".to_string()),
    }
}

/// Routes a tool invocation to the worker that declared it
struct ProcessToolHandler {
    worker: SharedWorker,
    timeout: Duration,
}

#[async_trait]
impl ToolHandler for ProcessToolHandler {
    async fn call(&self, mut request: PluginRequest) -> PluginResponse {
        request.method = PluginMethod::Invoke;
        let id = request.id.clone();
        match call_worker(&self.worker, request, self.timeout).await {
            Ok(response) => response,
            Err(e) => PluginResponse::error(&id, &e),
        }
    }
}

/// Plugin instance backed by a worker process
pub struct ProcessPlugin {
    unit: PluginUnit,
    call_timeout: Duration,
    worker: SharedWorker,
    metadata: PluginMetadata,
    definitions: Vec<ToolDefinition>,
}

impl ProcessPlugin {
    pub fn new(unit: PluginUnit, call_timeout: Duration) -> Self {
        Self {
            unit,
            call_timeout,
            worker: Arc::new(Mutex::new(None)),
            metadata: PluginMetadata::default(),
            definitions: vec![],
        }
    }

    async fn lifecycle(&self, method: PluginMethod) -> Result<(), PluginError> {
        let response = call_worker(&self.worker, PluginRequest::lifecycle(method), self.call_timeout)
            .await
            .map_err(|e| PluginError::hook(&self.unit.name, method.as_str(), e))?;

        if response.success {
            Ok(())
        } else {
            Err(PluginError::hook(
                &self.unit.name,
                method.as_str(),
                response
                    .error
                    .unwrap_or_else(|| "worker reported failure".to_string()),
            ))
        }
    }

    async fn stop(&self) {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.shutdown().await;
        }
    }
}

#[async_trait]
impl Plugin for ProcessPlugin {
    async fn initialize(&mut self) -> Result<(), PluginError> {
        let name = self.unit.name.clone();
        debug!("Starting worker for '{}' from {:?}", name, self.unit.path);

        let worker = Worker::spawn(&self.unit.path)
            .await
            .map_err(|e| PluginError::import(&name, e))?;
        *self.worker.lock().await = Some(worker);

        let response = call_worker(
            &self.worker,
            PluginRequest::lifecycle(PluginMethod::Describe),
            self.call_timeout,
        )
        .await
        .map_err(|e| PluginError::import(&name, e))?;

        if !response.success {
            return Err(PluginError::contract(
                &name,
                format!(
                    "describe failed: {}",
                    response.error.unwrap_or_else(|| "no reason given".to_string())
                ),
            ));
        }

        let result = response
            .result
            .ok_or_else(|| PluginError::contract(&name, "describe returned no registration"))?;
        let registration: Registration = serde_json::from_value(result)
            .map_err(|e| PluginError::contract(&name, format!("invalid registration: {}", e)))?;

        self.metadata = registration.metadata;
        self.definitions = registration.tools;
        Ok(())
    }

    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn tools(&self) -> Vec<ToolSpec> {
        self.definitions
            .iter()
            .map(|definition| {
                ToolSpec::new(
                    definition.clone(),
                    Arc::new(ProcessToolHandler {
                        worker: self.worker.clone(),
                        timeout: self.call_timeout,
                    }),
                )
            })
            .collect()
    }

    async fn on_load(&self) -> Result<(), PluginError> {
        self.lifecycle(PluginMethod::OnLoad).await
    }

    async fn on_unload(&self) -> Result<(), PluginError> {
        let result = self.lifecycle(PluginMethod::OnUnload).await;
        self.stop().await;
        result
    }
}

/// Imports executable units as worker-process plugins
#[derive(Debug, Clone)]
pub struct ProcessImporter {
    call_timeout: Duration,
}

impl ProcessImporter {
    pub fn new(call_timeout: Duration) -> Self {
        Self { call_timeout }
    }
}

impl UnitImporter for ProcessImporter {
    fn import(&self, unit: &PluginUnit) -> Result<Vec<Box<dyn Plugin>>, PluginError> {
        if !is_executable(&unit.path) {
            return Err(PluginError::import(
                &unit.name,
                format!("not executable: {:?}", unit.path),
            ));
        }
        Ok(vec![Box::new(ProcessPlugin::new(unit.clone(), self.call_timeout))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    /// Worker that echoes a fixed registration and answers every call
    #[cfg(unix)]
    const ECHO_WORKER: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"method":"describe"'*)
      printf '{"id":"%s","success":true,"result":{"metadata":{"name":"echo","version":"1.0.0","description":"Echo worker"},"tools":[{"name":"echo_say","description":"Say something back"}]}}\n' "$id" ;;
    *'"method":"invoke"'*)
      echo "not json"
      printf '{"id":"%s","success":true,"output":"pong"}\n' "$id" ;;
    *)
      printf '{"id":"%s","success":true}\n' "$id" ;;
  esac
done
"#;

    fn unit(dir: &TempDir, name: &str, body: &str, mode: u32) -> PluginUnit {
        let path = dir.path().join(name);
        fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        }
        #[cfg(not(unix))]
        let _ = mode;
        PluginUnit::file(name, path)
    }

    #[cfg(unix)]
    #[test]
    fn test_import_rejects_non_executable() {
        let temp_dir = TempDir::new().unwrap();
        let unit = unit(&temp_dir, "plain", "data", 0o644);

        let importer = ProcessImporter::new(Duration::from_secs(5));
        let err = importer.import(&unit).err().unwrap();
        assert!(matches!(err, PluginError::Import { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let unit = unit(&temp_dir, "echo", ECHO_WORKER, 0o755);

        let importer = ProcessImporter::new(Duration::from_secs(10));
        let mut plugins = importer.import(&unit).unwrap();
        assert_eq!(plugins.len(), 1);
        let mut plugin = plugins.remove(0);

        plugin.initialize().await.unwrap();
        assert_eq!(plugin.metadata().name, "echo");
        assert_eq!(plugin.metadata().version, "1.0.0");

        plugin.on_load().await.unwrap();

        let tools = plugin.tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name(), "echo_say");

        let resp = tools[0]
            .handler
            .call(PluginRequest::new("echo_say", HashMap::new()))
            .await;
        assert!(resp.success, "{:?}", resp);
        assert_eq!(resp.output.as_deref(), Some("pong"));

        plugin.on_unload().await.unwrap();

        // Handlers outliving the worker fail cleanly
        let resp = tools[0]
            .handler
            .call(PluginRequest::new("echo_say", HashMap::new()))
            .await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("not running"));
    }

    /// Worker announcing `tools` at `version`; every invocation answers
    /// with the version so a test can tell which worker served it
    #[cfg(unix)]
    fn versioned_worker(version: &str, tools: &[&str]) -> String {
        let tools = tools
            .iter()
            .map(|t| format!(r#"{{"name":"{}","description":"Tool {}"}}"#, t, t))
            .collect::<Vec<_>>()
            .join(",");
        r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"method":"describe"'*)
      printf '{"id":"%s","success":true,"result":{"metadata":{"name":"echo","version":"VERSION","description":"Echo worker"},"tools":[TOOLS]}}\n' "$id" ;;
    *'"method":"invoke"'*)
      printf '{"id":"%s","success":true,"output":"VERSION"}\n' "$id" ;;
    *)
      printf '{"id":"%s","success":true}\n' "$id" ;;
  esac
done
"#
        .replace("VERSION", version)
        .replace("TOOLS", &tools)
    }

    /// Replace a unit atomically and move its mtime forward
    #[cfg(unix)]
    fn replace_unit(dir: &TempDir, name: &str, body: &str, bump: u64) {
        use std::os::unix::fs::PermissionsExt;
        let staged = dir.path().join(format!(".{}.new", name));
        fs::write(&staged, body).unwrap();
        fs::set_permissions(&staged, fs::Permissions::from_mode(0o755)).unwrap();
        fs::File::options()
            .write(true)
            .open(&staged)
            .unwrap()
            .set_modified(std::time::SystemTime::now() + Duration::from_secs(bump))
            .unwrap();
        fs::rename(&staged, dir.path().join(name)).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_edited_worker_is_replaced_on_reload() {
        use crate::config::{CollisionPolicy, PluginConfig};
        use crate::plugins::loader::PluginLoader;
        use crate::plugins::registry::{ToolRegistry, ToolTable};

        let temp_dir = TempDir::new().unwrap();
        replace_unit(&temp_dir, "echo", &versioned_worker("1.0.0", &["echo_a"]), 0);

        let table = Arc::new(ToolTable::new());
        let registry = Arc::new(ToolRegistry::new(table.clone(), CollisionPolicy::Reject));
        let config = PluginConfig {
            directory: temp_dir.path().to_path_buf(),
            hook_timeout: 10,
            call_timeout: 10,
            ..PluginConfig::default()
        };
        let importer = Arc::new(ProcessImporter::new(config.call_timeout()));
        let loader = PluginLoader::new(config, importer, registry);

        let loaded = loader.load("echo").await;
        assert!(loaded.ok, "{:?}", loaded.error);
        let resp = table.dispatch(PluginRequest::new("echo_a", HashMap::new())).await;
        assert_eq!(resp.output.as_deref(), Some("1.0.0"));

        replace_unit(
            &temp_dir,
            "echo",
            &versioned_worker("2.0.0", &["echo_a", "echo_b"]),
            5,
        );
        let report = loader.reload_changed().await.unwrap();
        assert!(report.all_ok(), "{}", report);

        assert_eq!(table.names(), vec!["echo_a".to_string(), "echo_b".to_string()]);
        for tool in ["echo_a", "echo_b"] {
            let resp = table.dispatch(PluginRequest::new(tool, HashMap::new())).await;
            assert_eq!(resp.output.as_deref(), Some("2.0.0"), "{}", tool);
        }
        assert!(loader.check_for_changes().unwrap().is_empty());

        loader.unload_all().await;
        assert!(table.names().is_empty());
    }

    #[test]
    fn test_uninitialized_plugin_has_no_tools() {
        let plugin = ProcessPlugin::new(
            PluginUnit::file("idle", "/nonexistent/idle"),
            Duration::from_secs(1),
        );
        assert!(plugin.tools().is_empty());
        assert!(plugin.metadata().name.is_empty());
    }
}
