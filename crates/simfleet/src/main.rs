use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{info, warn};

const NODE_CONFIG_SUFFIX: &str = ".nodeconfig.json";
const RECORD_SUFFIX: &str = ".json";
const GRID_PROXY_CLASS: &str = "org.openqa.grid.selenium.proxy.DefaultRemoteProxy";
const GRID_CLEAN_UP_CYCLE_MS: u32 = 2000;
const GRID_TIMEOUT_MS: u32 = 30000;
const GRID_BROWSER_TIMEOUT_SECS: u32 = 30;
const GRID_REGISTER_CYCLE_MS: u32 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Method {
    Start,
    Stop,
}

#[derive(Debug, Parser)]
#[command(
    name = "simfleet",
    version,
    about = "Provision iOS simulator fleets paired with Appium nodes on a Selenium grid"
)]
struct Args {
    /// start provisions a fleet, stop tears one down.
    #[arg(long, value_enum)]
    method: Method,
    /// Base name for simulator instances; the index is appended per instance.
    #[arg(long)]
    name: String,
    /// simctl device type identifier.
    #[arg(long = "device_type")]
    device_type: Option<String>,
    /// simctl runtime identifier.
    #[arg(long)]
    runtime: Option<String>,
    /// Number of simulator instances to provision.
    #[arg(long)]
    threads: Option<usize>,
    /// Host the Appium servers listen on.
    #[arg(long)]
    host: Option<String>,
    /// Host of the Selenium grid hub.
    #[arg(long = "hub_host")]
    hub_host: Option<String>,
    /// Port of the Selenium grid hub.
    #[arg(long = "hub_port")]
    hub_port: Option<u16>,
    /// Seconds to pause between instance boots.
    #[arg(long)]
    delay: Option<u64>,
    /// Tear down instances provisioned earlier in the run if a later one fails.
    #[arg(long = "rollback_on_failure", default_value_t = false)]
    rollback_on_failure: bool,
    /// Directory holding process records and node config files.
    #[arg(long = "run_dir")]
    run_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let run_dir = resolve_run_dir(args.run_dir.clone())?;
    let simctl = SimCtl::from_env();
    let supervisor = ProcessSupervisor::new(run_dir.clone());

    match args.method {
        Method::Start => {
            let params = StartParams::from_args(&args)?;
            start_fleet(&simctl, &supervisor, &run_dir, &params)
        }
        Method::Stop => stop_fleet(&simctl, &supervisor, &run_dir, &args.name),
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            env::var("SIMFLEET_LOG")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),
        )
        .try_init();
}

fn resolve_run_dir(arg: Option<PathBuf>) -> Result<PathBuf> {
    let dir = arg
        .or_else(|| env::var_os("SIMFLEET_RUN_DIR").map(PathBuf::from))
        .unwrap_or_else(default_run_dir);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create run directory: {}", dir.display()))?;
    // Node config paths are handed to detached processes with cwd "/",
    // so the run directory must be absolute.
    if dir.is_absolute() {
        Ok(dir)
    } else {
        let cwd = env::current_dir().context("failed to determine current directory")?;
        Ok(cwd.join(dir))
    }
}

fn default_run_dir() -> PathBuf {
    env::temp_dir().join("simfleet")
}

// === Data model ===

#[derive(Debug, Clone)]
struct DeviceType(String);

impl DeviceType {
    fn new(identifier: impl Into<String>) -> Self {
        Self(identifier.into())
    }

    fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
struct RuntimeVersion(String);

impl RuntimeVersion {
    fn new(identifier: impl Into<String>) -> Self {
        Self(identifier.into())
    }

    fn as_str(&self) -> &str {
        &self.0
    }
}

/// One provisioned simulator, owned by the orchestrator for the duration of
/// a single instance lifecycle.
#[derive(Debug, Clone)]
struct SimulatedDevice {
    udid: String,
    name: String,
    device_type: DeviceType,
    runtime: RuntimeVersion,
}

/// Durable per-identity record written by the supervisor. `started_at_ms`
/// disambiguates a stale record from a live one, and `udid` pins the
/// simulator this process was paired with at creation time so teardown never
/// has to correlate devices and processes by position.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProcessRecord {
    pid: u32,
    started_at_ms: u64,
    udid: String,
}

// === Grid registration descriptor ===

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeConfig {
    capabilities: Vec<NodeCapability>,
    configuration: NodeConfiguration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeCapability {
    device_name: String,
    version: String,
    max_instances: u32,
    platform_name: String,
    platform: String,
    browser_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeConfiguration {
    clean_up_cycle: u32,
    timeout: u32,
    proxy: String,
    url: String,
    host: String,
    port: u16,
    max_session: u32,
    browser_timeout: u32,
    register: bool,
    register_cycle: u32,
    hub_port: u16,
    hub_host: String,
}

impl NodeConfig {
    fn new(
        device_type: &DeviceType,
        runtime: &RuntimeVersion,
        host: &str,
        port: u16,
        hub_host: &str,
        hub_port: u16,
    ) -> Self {
        Self {
            capabilities: vec![NodeCapability {
                device_name: device_type.as_str().to_string(),
                version: runtime.as_str().to_string(),
                max_instances: 1,
                platform_name: "iOS".to_string(),
                platform: "mac".to_string(),
                browser_name: "safari".to_string(),
            }],
            configuration: NodeConfiguration {
                clean_up_cycle: GRID_CLEAN_UP_CYCLE_MS,
                timeout: GRID_TIMEOUT_MS,
                proxy: GRID_PROXY_CLASS.to_string(),
                url: format!("http://{host}:{port}/wd/hub"),
                host: host.to_string(),
                port,
                max_session: 1,
                browser_timeout: GRID_BROWSER_TIMEOUT_SECS,
                register: true,
                register_cycle: GRID_REGISTER_CYCLE_MS,
                hub_port,
                hub_host: hub_host.to_string(),
            },
        }
    }
}

fn node_config_path(run_dir: &Path, identity: &str) -> PathBuf {
    run_dir.join(format!("{identity}{NODE_CONFIG_SUFFIX}"))
}

fn write_node_config(run_dir: &Path, identity: &str, config: &NodeConfig) -> Result<PathBuf> {
    let path = node_config_path(run_dir, identity);
    let data = serde_json::to_string_pretty(config)
        .context("failed to serialize grid node config")?;
    atomic_write_file(&path, data.as_bytes())?;
    Ok(path)
}

// === Port allocator ===

/// Bind-then-release on loopback with OS port selection. The port is free at
/// return time only; the eventual owner must treat its own bind failure as
/// retryable.
fn allocate_ephemeral_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .context("failed to bind ephemeral port probe socket")?;
    let port = listener
        .local_addr()
        .context("failed to read back bound probe address")?
        .port();
    Ok(port)
}

// === Device provisioner ===

struct SimCtl {
    program: PathBuf,
    leading_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ListedDevice {
    name: String,
    udid: String,
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    devices: BTreeMap<String, Vec<ListedDevice>>,
}

impl SimCtl {
    fn from_env() -> Self {
        match env::var_os("SIMFLEET_SIMCTL") {
            Some(program) => Self {
                program: PathBuf::from(program),
                leading_args: Vec::new(),
            },
            None => Self {
                program: PathBuf::from("xcrun"),
                leading_args: vec!["simctl".to_string()],
            },
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.leading_args);
        command
    }

    fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| {
                format!(
                    "failed to invoke {} {}",
                    self.program.display(),
                    args.join(" ")
                )
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "simctl {} failed ({}): {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                stderr.trim()
            );
        }
        Ok(output.stdout)
    }

    fn create_device(
        &self,
        name: &str,
        device_type: &DeviceType,
        runtime: &RuntimeVersion,
    ) -> Result<SimulatedDevice> {
        let stdout = self
            .run(&["create", name, device_type.as_str(), runtime.as_str()])
            .with_context(|| format!("failed to create simulator '{name}'"))?;
        let udid = String::from_utf8(stdout)
            .context("simctl create returned non-UTF-8 output")?
            .trim()
            .to_string();
        if udid.is_empty() {
            bail!("simctl create returned no device identifier for '{name}'");
        }
        Ok(SimulatedDevice {
            udid,
            name: name.to_string(),
            device_type: device_type.clone(),
            runtime: runtime.clone(),
        })
    }

    /// Devices whose name starts with `prefix`, preserving simctl's
    /// per-runtime listing order.
    fn list_devices_by_prefix(&self, prefix: &str) -> Result<Vec<ListedDevice>> {
        let stdout = self
            .run(&["list", "devices", "-j"])
            .context("failed to list simulators")?;
        let list: DeviceList =
            serde_json::from_slice(&stdout).context("failed to parse simctl device list")?;
        Ok(list
            .devices
            .into_values()
            .flatten()
            .filter(|device| device.name.starts_with(prefix))
            .collect())
    }

    fn delete_device(&self, udid: &str) -> Result<()> {
        self.run(&["delete", udid])
            .with_context(|| format!("failed to delete simulator {udid}"))?;
        Ok(())
    }
}

// === Process supervisor ===

#[derive(Debug, Error)]
enum SupervisorError {
    #[error("a supervised process is already running for identity '{0}'")]
    AlreadyRunning(String),
    #[error("no supervised process is registered for identity '{0}'")]
    NotRunning(String),
}

/// Spawns automation servers fully detached from this process's lifetime and
/// keeps one durable record per identity so an independent later invocation
/// can find and signal them.
struct ProcessSupervisor {
    run_dir: PathBuf,
}

impl ProcessSupervisor {
    fn new(run_dir: PathBuf) -> Self {
        Self { run_dir }
    }

    fn record_path(&self, identity: &str) -> Result<PathBuf> {
        validate_identity(identity)?;
        Ok(self.run_dir.join(format!("{identity}{RECORD_SUFFIX}")))
    }

    fn start(&self, identity: &str, udid: &str, command: &mut Command) -> Result<ProcessRecord> {
        let record_path = self.record_path(identity)?;
        if record_path.exists() {
            let existing = read_record(&record_path)?;
            if process_is_alive(existing.pid) {
                return Err(SupervisorError::AlreadyRunning(identity.to_string()).into());
            }
            warn!(
                "reclaiming stale process record for '{identity}' (pid {} is gone)",
                existing.pid
            );
            fs::remove_file(&record_path).with_context(|| {
                format!("failed to remove stale record {}", record_path.display())
            })?;
        }

        configure_detached(command);
        let child = command
            .spawn()
            .with_context(|| format!("failed to spawn automation server for '{identity}'"))?;
        let record = ProcessRecord {
            pid: child.id(),
            started_at_ms: unix_time_ms(),
            udid: udid.to_string(),
        };
        let data = serde_json::to_string_pretty(&record)
            .context("failed to serialize process record")?;
        atomic_write_file(&record_path, data.as_bytes())?;
        Ok(record)
    }

    fn stop(&self, identity: &str) -> Result<ProcessRecord> {
        let record_path = self.record_path(identity)?;
        if !record_path.exists() {
            return Err(SupervisorError::NotRunning(identity.to_string()).into());
        }
        let record = read_record(&record_path)?;
        if process_is_alive(record.pid) {
            send_sigterm(record.pid)
                .with_context(|| format!("failed to stop process for '{identity}'"))?;
        } else {
            warn!(
                "process for '{identity}' (pid {}) already exited; removing its record",
                record.pid
            );
        }
        fs::remove_file(&record_path)
            .with_context(|| format!("failed to remove record {}", record_path.display()))?;
        Ok(record)
    }

    fn record(&self, identity: &str) -> Result<Option<ProcessRecord>> {
        let record_path = self.record_path(identity)?;
        if !record_path.exists() {
            return Ok(None);
        }
        read_record(&record_path).map(Some)
    }

    /// Identities with a record whose stem starts with `prefix`, sorted by
    /// identity.
    fn records_by_prefix(&self, prefix: &str) -> Result<Vec<(String, ProcessRecord)>> {
        let mut records = Vec::new();
        let entries = match fs::read_dir(&self.run_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(records),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read run directory {}", self.run_dir.display())
                })
            }
        };
        for entry in entries {
            let entry = entry.context("failed to read run directory entry")?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.ends_with(NODE_CONFIG_SUFFIX) {
                continue;
            }
            let Some(identity) = file_name.strip_suffix(RECORD_SUFFIX) else {
                continue;
            };
            if !identity.starts_with(prefix) {
                continue;
            }
            let record = read_record(&entry.path())?;
            records.push((identity.to_string(), record));
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }
}

fn validate_identity(identity: &str) -> Result<()> {
    if identity.is_empty()
        || identity.contains(['/', '\\'])
        || identity.contains("..")
        || identity.starts_with('.')
    {
        bail!("invalid process identity '{identity}': must be a plain file name component");
    }
    Ok(())
}

fn read_record(path: &Path) -> Result<ProcessRecord> {
    let data = fs::read(path)
        .with_context(|| format!("failed to read process record {}", path.display()))?;
    serde_json::from_slice(&data)
        .with_context(|| format!("failed to parse process record {}", path.display()))
}

/// Detach the child from this process: new session, cleared umask, root cwd
/// and null stdio, so it survives the parent exiting.
fn configure_detached(command: &mut Command) {
    use std::os::unix::process::CommandExt;

    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .current_dir("/");
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            libc::umask(0);
            Ok(())
        });
    }
}

fn process_is_alive(pid: u32) -> bool {
    let status = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if status == 0 {
        return true;
    }
    // EPERM means the pid exists but belongs to someone else.
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn send_sigterm(pid: u32) -> Result<()> {
    let status = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if status == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Already gone; stop stays idempotent.
        return Ok(());
    }
    Err(err).with_context(|| format!("failed to send SIGTERM to pid {pid}"))
}

fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn atomic_write_file(target: &Path, data: &[u8]) -> Result<()> {
    let parent = target
        .parent()
        .with_context(|| format!("cannot determine parent directory for {}", target.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    let tmp_path = target.with_extension("tmp");
    fs::write(&tmp_path, data)
        .with_context(|| format!("failed to write temporary file: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, target).with_context(|| {
        format!(
            "failed to rename {} to {}",
            tmp_path.display(),
            target.display()
        )
    })?;
    Ok(())
}

// === Orchestrator ===

#[derive(Debug)]
struct StartParams {
    base_name: String,
    device_type: DeviceType,
    runtime: RuntimeVersion,
    count: usize,
    host: String,
    hub_host: String,
    hub_port: u16,
    delay: Duration,
    rollback_on_failure: bool,
}

impl StartParams {
    fn from_args(args: &Args) -> Result<Self> {
        Ok(Self {
            base_name: args.name.clone(),
            device_type: DeviceType::new(required_flag(&args.device_type, "--device_type")?),
            runtime: RuntimeVersion::new(required_flag(&args.runtime, "--runtime")?),
            count: required_flag(&args.threads, "--threads")?,
            host: required_flag(&args.host, "--host")?,
            hub_host: required_flag(&args.hub_host, "--hub_host")?,
            hub_port: required_flag(&args.hub_port, "--hub_port")?,
            delay: Duration::from_secs(required_flag(&args.delay, "--delay")?),
            rollback_on_failure: args.rollback_on_failure,
        })
    }
}

fn required_flag<T: Clone>(value: &Option<T>, flag: &str) -> Result<T> {
    value
        .clone()
        .with_context(|| format!("{flag} is required when --method is start"))
}

fn start_fleet(
    simctl: &SimCtl,
    supervisor: &ProcessSupervisor,
    run_dir: &Path,
    params: &StartParams,
) -> Result<()> {
    let mut provisioned: Vec<String> = Vec::new();
    for index in 0..params.count {
        let identity = format!("{}{}", params.base_name, index);
        if let Err(err) = start_instance(simctl, supervisor, run_dir, params, &identity) {
            if params.rollback_on_failure {
                warn!(
                    "instance '{identity}' failed; rolling back {} provisioned instance(s)",
                    provisioned.len()
                );
                rollback_instances(simctl, supervisor, run_dir, &provisioned);
            } else if !provisioned.is_empty() {
                warn!(
                    "instance '{identity}' failed; leaving earlier instance(s) provisioned: {}",
                    provisioned.join(", ")
                );
            }
            return Err(err).with_context(|| format!("failed to provision instance '{identity}'"));
        }
        provisioned.push(identity);
        // Throttle so simultaneous device boots do not overwhelm the host.
        if index + 1 < params.count && !params.delay.is_zero() {
            thread::sleep(params.delay);
        }
    }
    info!(
        "provisioned {} simulator instance(s) with base name '{}'",
        params.count, params.base_name
    );
    Ok(())
}

fn start_instance(
    simctl: &SimCtl,
    supervisor: &ProcessSupervisor,
    run_dir: &Path,
    params: &StartParams,
    identity: &str,
) -> Result<()> {
    let device = simctl.create_device(identity, &params.device_type, &params.runtime)?;
    info!("created simulator '{}' with udid {}", device.name, device.udid);

    let appium_port = allocate_ephemeral_port()?;
    let wda_port = allocate_ephemeral_port()?;
    let config = NodeConfig::new(
        &device.device_type,
        &device.runtime,
        &params.host,
        appium_port,
        &params.hub_host,
        params.hub_port,
    );
    let config_path = write_node_config(run_dir, identity, &config)?;

    let mut command = appium_command(&device, appium_port, wda_port, &config_path);
    let record = supervisor.start(identity, &device.udid, &mut command)?;
    info!(
        "appium server for '{identity}' started on port {appium_port} (pid {})",
        record.pid
    );
    Ok(())
}

fn appium_command(
    device: &SimulatedDevice,
    appium_port: u16,
    wda_port: u16,
    config_path: &Path,
) -> Command {
    let program = env::var_os("SIMFLEET_APPIUM")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("appium"));
    let capabilities = json!({
        "udid": device.udid,
        "wdaLocalPort": wda_port,
    });
    let mut command = Command::new(program);
    command
        .arg("-p")
        .arg(appium_port.to_string())
        .arg("-dc")
        .arg(capabilities.to_string())
        .arg("--nodeconfig")
        .arg(config_path);
    command
}

fn rollback_instances(
    simctl: &SimCtl,
    supervisor: &ProcessSupervisor,
    run_dir: &Path,
    identities: &[String],
) {
    for identity in identities.iter().rev() {
        match supervisor.record(identity) {
            Ok(Some(record)) => {
                if let Err(err) = simctl.delete_device(&record.udid) {
                    warn!("rollback: could not delete simulator for '{identity}': {err:#}");
                }
                if let Err(err) = supervisor.stop(identity) {
                    warn!("rollback: could not stop process for '{identity}': {err:#}");
                }
            }
            Ok(None) => {}
            Err(err) => warn!("rollback: could not read record for '{identity}': {err:#}"),
        }
        let _ = fs::remove_file(node_config_path(run_dir, identity));
    }
}

fn stop_fleet(
    simctl: &SimCtl,
    supervisor: &ProcessSupervisor,
    run_dir: &Path,
    base_name: &str,
) -> Result<()> {
    let listed = simctl.list_devices_by_prefix(base_name)?;
    let mut remaining: BTreeMap<String, String> = listed
        .into_iter()
        .map(|device| (device.udid, device.name))
        .collect();

    let records = supervisor.records_by_prefix(base_name)?;
    let mut stopped = 0usize;
    for (identity, record) in &records {
        if remaining.remove(&record.udid).is_some() {
            simctl.delete_device(&record.udid)?;
            info!("deleted simulator {} for '{identity}'", record.udid);
        } else {
            warn!(
                "simulator {} for '{identity}' no longer exists; removing its process anyway",
                record.udid
            );
        }
        supervisor.stop(identity)?;
        let _ = fs::remove_file(node_config_path(run_dir, identity));
        stopped += 1;
    }

    // Devices left behind by a failed start run have no record; sweep them.
    for (udid, name) in remaining {
        simctl.delete_device(&udid)?;
        warn!("deleted orphaned simulator '{name}' ({udid}) with no process record");
    }

    info!("stopped {stopped} simulator instance(s) with base name '{base_name}'");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn unique_run_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_nanos();
        let dir = env::temp_dir().join(format!(
            "simfleet-test-{label}-{}-{nanos}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).expect("failed to create test run dir");
        dir
    }

    fn dead_pid() -> u32 {
        let mut child = Command::new("/bin/sleep")
            .arg("0")
            .spawn()
            .expect("failed to spawn short-lived child");
        let pid = child.id();
        child.wait().expect("failed to wait for short-lived child");
        pid
    }

    #[test]
    fn allocate_ephemeral_port_returns_distinct_ports() {
        let ports: HashSet<u16> = (0..8)
            .map(|_| allocate_ephemeral_port().expect("port allocation failed"))
            .collect();
        assert_eq!(ports.len(), 8);
        assert!(ports.iter().all(|port| *port != 0));
    }

    #[test]
    fn node_config_serializes_to_grid_registration_shape() {
        let config = NodeConfig::new(
            &DeviceType::new("iphone11"),
            &RuntimeVersion::new("14.4"),
            "127.0.0.1",
            4723,
            "10.0.0.5",
            4444,
        );
        let value = serde_json::to_value(&config).expect("node config must serialize");

        let capability = &value["capabilities"][0];
        assert_eq!(capability["deviceName"], "iphone11");
        assert_eq!(capability["version"], "14.4");
        assert_eq!(capability["maxInstances"], 1);
        assert_eq!(capability["platformName"], "iOS");
        assert_eq!(capability["platform"], "mac");
        assert_eq!(capability["browserName"], "safari");

        let configuration = &value["configuration"];
        assert_eq!(configuration["cleanUpCycle"], 2000);
        assert_eq!(configuration["timeout"], 30000);
        assert_eq!(configuration["proxy"], GRID_PROXY_CLASS);
        assert_eq!(configuration["url"], "http://127.0.0.1:4723/wd/hub");
        assert_eq!(configuration["host"], "127.0.0.1");
        assert_eq!(configuration["port"], 4723);
        assert_eq!(configuration["maxSession"], 1);
        assert_eq!(configuration["browserTimeout"], 30);
        assert_eq!(configuration["register"], true);
        assert_eq!(configuration["registerCycle"], 5000);
        assert_eq!(configuration["hubPort"], 4444);
        assert_eq!(configuration["hubHost"], "10.0.0.5");
    }

    #[test]
    fn written_node_config_round_trips_port_and_hub_parameters() {
        let run_dir = unique_run_dir("nodeconfig");
        let config = NodeConfig::new(
            &DeviceType::new("iphone11"),
            &RuntimeVersion::new("14.4"),
            "127.0.0.1",
            40123,
            "hub.example",
            4445,
        );
        let path = write_node_config(&run_dir, "sim0", &config).expect("write must succeed");

        let data = fs::read(&path).expect("node config must be readable");
        let value: serde_json::Value =
            serde_json::from_slice(&data).expect("node config must be valid JSON");
        assert_eq!(value["configuration"]["port"], 40123);
        assert_eq!(value["configuration"]["hubHost"], "hub.example");
        assert_eq!(value["configuration"]["hubPort"], 4445);
    }

    #[test]
    fn supervisor_start_then_stop_removes_record() {
        let run_dir = unique_run_dir("start-stop");
        let supervisor = ProcessSupervisor::new(run_dir.clone());

        let mut command = Command::new("/bin/sleep");
        command.arg("30");
        let record = supervisor
            .start("sim0", "UDID-sim0", &mut command)
            .expect("start must succeed");
        assert!(record.pid > 0);
        assert_eq!(record.udid, "UDID-sim0");
        assert!(run_dir.join("sim0.json").exists());

        supervisor.stop("sim0").expect("stop must succeed");
        assert!(!run_dir.join("sim0.json").exists());
    }

    #[test]
    fn supervisor_rejects_second_start_for_live_identity() {
        let run_dir = unique_run_dir("already-running");
        let supervisor = ProcessSupervisor::new(run_dir);

        let mut first = Command::new("/bin/sleep");
        first.arg("30");
        supervisor
            .start("sim0", "UDID-sim0", &mut first)
            .expect("first start must succeed");

        let mut second = Command::new("/bin/sleep");
        second.arg("30");
        let err = supervisor
            .start("sim0", "UDID-sim0", &mut second)
            .expect_err("second start must fail");
        assert!(matches!(
            err.downcast_ref::<SupervisorError>(),
            Some(SupervisorError::AlreadyRunning(identity)) if identity == "sim0"
        ));

        supervisor.stop("sim0").expect("cleanup stop must succeed");
    }

    #[test]
    fn stop_without_start_fails_with_not_running_and_no_side_effects() {
        let run_dir = unique_run_dir("not-running");
        let supervisor = ProcessSupervisor::new(run_dir.clone());

        let err = supervisor
            .stop("ghost")
            .expect_err("stop without start must fail");
        assert!(matches!(
            err.downcast_ref::<SupervisorError>(),
            Some(SupervisorError::NotRunning(identity)) if identity == "ghost"
        ));
        let leftover: Vec<_> = fs::read_dir(&run_dir)
            .expect("run dir must be readable")
            .collect();
        assert!(leftover.is_empty());
    }

    #[test]
    fn stale_record_is_reclaimed_on_start() {
        let run_dir = unique_run_dir("stale-start");
        let supervisor = ProcessSupervisor::new(run_dir.clone());

        let stale = ProcessRecord {
            pid: dead_pid(),
            started_at_ms: 0,
            udid: "UDID-old".to_string(),
        };
        let record_path = run_dir.join("sim0.json");
        fs::write(
            &record_path,
            serde_json::to_vec(&stale).expect("record must serialize"),
        )
        .expect("failed to seed stale record");

        let mut command = Command::new("/bin/sleep");
        command.arg("30");
        let record = supervisor
            .start("sim0", "UDID-new", &mut command)
            .expect("start must reclaim the stale record");
        assert_eq!(record.udid, "UDID-new");
        assert_ne!(record.pid, stale.pid);

        supervisor.stop("sim0").expect("cleanup stop must succeed");
    }

    #[test]
    fn stop_tolerates_already_dead_process() {
        let run_dir = unique_run_dir("stale-stop");
        let supervisor = ProcessSupervisor::new(run_dir.clone());

        let stale = ProcessRecord {
            pid: dead_pid(),
            started_at_ms: 0,
            udid: "UDID-old".to_string(),
        };
        let record_path = run_dir.join("sim0.json");
        fs::write(
            &record_path,
            serde_json::to_vec(&stale).expect("record must serialize"),
        )
        .expect("failed to seed stale record");

        supervisor
            .stop("sim0")
            .expect("stop of a dead process must succeed");
        assert!(!record_path.exists());
    }

    #[test]
    fn records_by_prefix_ignores_node_configs_and_other_names() {
        let run_dir = unique_run_dir("records-prefix");
        let supervisor = ProcessSupervisor::new(run_dir.clone());

        for identity in ["sim0", "sim1", "other0"] {
            let record = ProcessRecord {
                pid: 1,
                started_at_ms: 0,
                udid: format!("UDID-{identity}"),
            };
            fs::write(
                run_dir.join(format!("{identity}.json")),
                serde_json::to_vec(&record).expect("record must serialize"),
            )
            .expect("failed to seed record");
        }
        fs::write(run_dir.join("sim2.nodeconfig.json"), b"{}")
            .expect("failed to seed node config");

        let records = supervisor
            .records_by_prefix("sim")
            .expect("records must be enumerable");
        let identities: Vec<_> = records
            .iter()
            .map(|(identity, _)| identity.as_str())
            .collect();
        assert_eq!(identities, vec!["sim0", "sim1"]);
    }

    #[test]
    fn path_escaping_identities_are_rejected() {
        let run_dir = unique_run_dir("identity");
        let supervisor = ProcessSupervisor::new(run_dir);

        for identity in ["", "a/b", "a\\b", "..", "../up", ".hidden"] {
            let mut command = Command::new("/bin/sleep");
            command.arg("30");
            assert!(
                supervisor.start(identity, "UDID", &mut command).is_err(),
                "identity '{identity}' must be rejected"
            );
        }
    }
}
