use std::process::Stdio;

use async_trait::async_trait;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::ScanError;
use crate::models::{HostScan, HostStatus, PortEntry, Protocol};

/// The scanner itself. The coordinator treats it as slow and fallible.
#[async_trait]
pub trait ScanExecutor: Send + Sync {
  async fn execute(&self, ip: &str, rate_limit: u32) -> Result<HostScan, ScanError>;
}

const WELL_KNOWN_PORTS: [u16; 5] = [22, 80, 443, 8080, 3306];
const RANDOM_PORTS: usize = 195;

/// Fabricates plausible results without touching the network.
#[derive(Debug, Clone, Default)]
pub struct MockScanExecutor {
  failure_rate: f64,
}

impl MockScanExecutor {
  pub fn new(failure_rate: f64) -> Self {
    Self { failure_rate: failure_rate.clamp(0.0, 1.0) }
  }

  fn fabricate(&self) -> Result<HostScan, ScanError> {
    let mut rng = rand::thread_rng();
    if self.failure_rate > 0.0 && rng.gen_bool(self.failure_rate) {
      return Err(ScanError::Failed("simulated scanner failure".into()));
    }
    let candidates: Vec<u16> = (1..65535).filter(|p| !WELL_KNOWN_PORTS.contains(p)).collect();
    let ports = WELL_KNOWN_PORTS
      .iter()
      .chain(candidates.choose_multiple(&mut rng, RANDOM_PORTS))
      .map(|&port| PortEntry { port, protocol: Protocol::Tcp })
      .collect();
    Ok(HostScan { host_status: HostStatus::Up, ports })
  }
}

#[async_trait]
impl ScanExecutor for MockScanExecutor {
  async fn execute(&self, ip: &str, rate_limit: u32) -> Result<HostScan, ScanError> {
    debug!("Mock scanning {} at {} pps", ip, rate_limit);
    self.fabricate()
  }
}

/// Runs an external scanner as `<program> [args..] --ip <ip> --rl <rate>` and
/// reads an `nmap_scan` JSON document from its stdout.
#[derive(Debug, Clone)]
pub struct CommandScanExecutor {
  program: String,
  args: Vec<String>,
}

impl CommandScanExecutor {
  pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
    Self { program: program.into(), args }
  }

  /// Splits a command line such as `python scan.py` on whitespace.
  pub fn from_command_line(command: &str) -> Option<Self> {
    let mut parts = command.split_whitespace().map(str::to_string);
    let program = parts.next()?;
    Some(Self::new(program, parts.collect()))
  }
}

#[async_trait]
impl ScanExecutor for CommandScanExecutor {
  async fn execute(&self, ip: &str, rate_limit: u32) -> Result<HostScan, ScanError> {
    info!("Running {} for {} at {} pps", self.program, ip, rate_limit);
    let output = Command::new(&self.program)
      .args(&self.args)
      .arg("--ip")
      .arg(ip)
      .arg("--rl")
      .arg(rate_limit.to_string())
      .stdin(Stdio::null())
      .kill_on_drop(true)
      .output()
      .await?;

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      return Err(ScanError::Failed(format!("{} exited with {}: {}", self.program, output.status, stderr.trim())));
    }
    parse_nmap_output(&output.stdout)
  }
}

#[derive(Deserialize)]
struct NmapDocument {
  nmap_scan: NmapScan,
}

#[derive(Deserialize)]
struct NmapScan {
  host_status: String,
  #[serde(default)]
  scan_results: Vec<NmapPort>,
}

#[derive(Deserialize)]
struct NmapPort {
  port: u32,
  protocol: String,
}

pub fn parse_nmap_output(stdout: &[u8]) -> Result<HostScan, ScanError> {
  let doc: NmapDocument = serde_json::from_slice(stdout).map_err(|e| ScanError::Malformed(e.to_string()))?;

  let host_status = match doc.nmap_scan.host_status.to_ascii_lowercase().as_str() {
    "up" => HostStatus::Up,
    "down" => HostStatus::Down,
    other => return Err(ScanError::Malformed(format!("unknown host status '{}'", other))),
  };

  let ports = doc
    .nmap_scan
    .scan_results
    .into_iter()
    .map(|entry| {
      let port = u16::try_from(entry.port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| ScanError::Malformed(format!("port {} out of range", entry.port)))?;
      let protocol = match entry.protocol.to_ascii_lowercase().as_str() {
        "tcp" => Protocol::Tcp,
        "udp" => Protocol::Udp,
        other => return Err(ScanError::Malformed(format!("unknown protocol '{}'", other))),
      };
      Ok(PortEntry { port, protocol })
    })
    .collect::<Result<Vec<_>, _>>()?;

  Ok(HostScan { host_status, ports })
}
