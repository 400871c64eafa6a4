//! Agents running as child processes
//!
//! [`ProcessProvisioner`] runs a Consul-compatible agent binary per node,
//! each with its own data directory and JSON config file, and waits for the
//! HTTP API to answer before handing the agent out. [`HttpAgentClient`]
//! talks to that API.

use super::{AgentClient, AgentProcess, NodeConfig, Provisioner};
use crate::error::{AgentError, Result};
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default time to wait for an agent's API to come up
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time to wait for an agent to exit after SIGTERM
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A spawned agent and its scratch directory
struct RunningAgent {
    child: Child,
    data_dir: PathBuf,
}

/// Provisioner that runs real agent processes
pub struct ProcessProvisioner {
    binary: PathBuf,
    data_root: PathBuf,
    start_timeout: Duration,
    stop_timeout: Duration,
    children: Mutex<HashMap<String, RunningAgent>>,
    http: reqwest::blocking::Client,
}

impl ProcessProvisioner {
    /// Create a provisioner running `binary`, with agent data under `data_root`
    pub fn new(binary: impl Into<PathBuf>, data_root: impl Into<PathBuf>) -> Result<Self> {
        let data_root = data_root.into();
        fs::create_dir_all(&data_root)?;

        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| AgentError::Client(e.to_string()))?;

        Ok(Self {
            binary: binary.into(),
            data_root,
            start_timeout: DEFAULT_START_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            children: Mutex::new(HashMap::new()),
            http,
        })
    }

    /// Override the start and stop timeouts
    pub fn with_timeouts(mut self, start: Duration, stop: Duration) -> Self {
        self.start_timeout = start;
        self.stop_timeout = stop;
        self
    }

    /// Poll the agent's status endpoint until it answers
    fn wait_ready(&self, name: &str, http_addr: &str, child: &mut Child) -> Result<()> {
        let url = format!("http://{}/v1/status/leader", http_addr);
        let deadline = Instant::now() + self.start_timeout;

        while Instant::now() < deadline {
            if let Some(status) = child.try_wait()? {
                return Err(AgentError::provision(
                    name,
                    format!("agent exited during startup with {}", status),
                ));
            }

            match self.http.get(&url).send() {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => debug!("Agent {} not ready yet: {}", name, response.status()),
                Err(e) => debug!("Agent {} not ready yet: {}", name, e),
            }

            thread::sleep(POLL_INTERVAL);
        }

        Err(AgentError::provision(
            name,
            format!("agent did not become ready within {:?}", self.start_timeout),
        ))
    }

    /// SIGTERM, then SIGKILL once the stop timeout passes
    fn terminate(&self, name: &str, child: &mut Child) -> Result<()> {
        if child.try_wait()?.is_some() {
            return Ok(());
        }

        let pid = child.id() as libc::pid_t;
        // SAFETY: pid belongs to a child we spawned and have not reaped yet.
        if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
            warn!("Failed to send SIGTERM to agent {}: {}", name, std::io::Error::last_os_error());
        }

        let deadline = Instant::now() + self.stop_timeout;
        while Instant::now() < deadline {
            if child.try_wait()?.is_some() {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }

        warn!("Agent {} ignored SIGTERM, killing it", name);
        child.kill()?;
        child.wait()?;
        Ok(())
    }
}

/// Give every unset port an OS-assigned free port.
///
/// Each listener stays bound until all ports are chosen, so the OS
/// never hands the same port out twice for one agent.
fn assign_free_ports(config: &mut NodeConfig) -> Result<()> {
    let bind_addr = config.bind_addr.clone();
    let mut reserved = Vec::new();

    for port in config.ports.iter_mut() {
        if *port == 0 {
            let listener = TcpListener::bind((bind_addr.as_str(), 0))?;
            *port = listener.local_addr()?.port();
            reserved.push(listener);
        }
    }

    Ok(())
}

fn remove_data_dir(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Best-effort removal on a failure path; the earlier failure is what gets reported
fn discard_data_dir(name: &str, path: &Path) {
    if let Err(e) = remove_data_dir(path) {
        warn!("Failed to remove data directory {} of agent {}: {}", path.display(), name, e);
    }
}

impl Provisioner for ProcessProvisioner {
    fn provision(&self, mut config: NodeConfig) -> Result<AgentProcess> {
        let name = config.node_name.clone();
        let id = Uuid::new_v4().to_string();

        assign_free_ports(&mut config)?;

        let data_dir = self.data_root.join(format!("{}-{}", name, &id[..8]));
        fs::create_dir_all(&data_dir)?;
        config.data_dir = Some(data_dir.clone());

        let config_path = data_dir.join("config.json");
        fs::write(&config_path, serde_json::to_vec_pretty(&config)?)?;

        let output = || if config.quiet { Stdio::null() } else { Stdio::inherit() };
        let spawned = Command::new(&self.binary)
            .arg("agent")
            .arg("-config-file")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(output())
            .stderr(output())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                discard_data_dir(&name, &data_dir);
                return Err(AgentError::provision(
                    &name,
                    format!("failed to spawn {}: {}", self.binary.display(), e),
                ));
            }
        };

        let host = config.bind_addr.clone();
        let http_addr = format!("{}:{}", host, config.ports.http);

        if let Err(e) = self.wait_ready(&name, &http_addr, &mut child) {
            let _ = child.kill();
            let _ = child.wait();
            discard_data_dir(&name, &data_dir);
            return Err(e);
        }

        info!("Agent {} (pid {}) ready on {}", name, child.id(), http_addr);

        let process = AgentProcess {
            id: id.clone(),
            name,
            http_addr,
            https_addr: format!("{}:{}", host, config.ports.https),
            lan_addr: format!("{}:{}", host, config.ports.serf_lan),
            wan_addr: format!("{}:{}", host, config.ports.serf_wan),
            config,
            started_at: Utc::now(),
        };

        self.children
            .lock()
            .map_err(|_| AgentError::Lock("Failed to acquire process table lock".to_string()))?
            .insert(id, RunningAgent { child, data_dir });

        Ok(process)
    }

    fn teardown(&self, process: &AgentProcess) -> Result<()> {
        let agent = self
            .children
            .lock()
            .map_err(|_| AgentError::Lock("Failed to acquire process table lock".to_string()))?
            .remove(&process.id);

        let mut agent = agent
            .ok_or_else(|| AgentError::provision(&process.name, "agent is not running"))?;

        // The directory goes even when the process could not be stopped cleanly
        let terminated = self.terminate(&process.name, &mut agent.child);
        let removed = remove_data_dir(&agent.data_dir);
        terminated.map_err(|e| AgentError::provision(&process.name, e))?;
        removed.map_err(|e| AgentError::provision(&process.name, e))?;

        debug!("Agent {} stopped", process.name);
        Ok(())
    }

    fn bind_client(&self, http_addr: &str) -> Result<Arc<dyn AgentClient>> {
        Ok(Arc::new(HttpAgentClient::new(http_addr)?))
    }
}

impl Drop for ProcessProvisioner {
    fn drop(&mut self) {
        let children = self
            .children
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);

        for (_, mut agent) in children.drain() {
            warn!("Killing leftover agent process {}", agent.child.id());
            let _ = agent.child.kill();
            let _ = agent.child.wait();
            let _ = fs::remove_dir_all(&agent.data_dir);
        }
    }
}

#[derive(Deserialize)]
struct MemberEntry {
    #[serde(rename = "Name")]
    name: String,
}

/// Client for an agent's HTTP API
pub struct HttpAgentClient {
    base_url: String,
    http: reqwest::blocking::Client,
}

impl HttpAgentClient {
    /// Create a client for the agent listening on `http_addr`
    pub fn new(http_addr: &str) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AgentError::Client(e.to_string()))?;

        Ok(Self {
            base_url: format!("http://{}", http_addr),
            http,
        })
    }
}

impl AgentClient for HttpAgentClient {
    fn join(&self, address: &str, wan: bool) -> Result<()> {
        let url = format!("{}/v1/agent/join/{}", self.base_url, address);

        let mut request = self.http.put(&url);
        if wan {
            request = request.query(&[("wan", "1")]);
        }

        let response = request
            .send()
            .map_err(|e| AgentError::Client(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AgentError::Client(format!(
                "Join of {} failed: {} {}",
                address,
                response.status(),
                response.text().unwrap_or_default()
            )));
        }

        Ok(())
    }

    fn members(&self) -> Result<Vec<String>> {
        let url = format!("{}/v1/agent/members", self.base_url);

        let response = self
            .http
            .get(&url)
            .send()
            .map_err(|e| AgentError::Client(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AgentError::Client(format!(
                "Listing members failed: {}",
                response.status()
            )));
        }

        let members: Vec<MemberEntry> = response
            .json()
            .map_err(|e| AgentError::Client(e.to_string()))?;

        Ok(members.into_iter().map(|m| m.name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::fs::PermissionsExt;
    use std::thread::JoinHandle;

    /// Answer one HTTP request with `status` and `body`; the join handle yields
    /// the request line that was received.
    fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);

            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            loop {
                let mut header = String::new();
                reader.read_line(&mut header).unwrap();
                if header == "\r\n" || header.is_empty() {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            reader.get_mut().write_all(response.as_bytes()).unwrap();
            request_line.trim_end().to_string()
        });

        (addr, server)
    }

    /// Write an executable shell script standing in for the agent binary
    fn fake_agent(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("fake-agent");
        fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_assigned_ports_are_distinct() {
        let mut config = NodeConfig::new("s1");
        config.ports.dns = 8600;

        assign_free_ports(&mut config).unwrap();

        let ports = [
            config.ports.http,
            config.ports.https,
            config.ports.dns,
            config.ports.serf_lan,
            config.ports.serf_wan,
            config.ports.server,
        ];
        assert_eq!(config.ports.dns, 8600);
        assert!(ports.iter().all(|p| *p != 0));

        let mut unique = ports.to_vec();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), ports.len());
    }

    #[test]
    fn test_join_puts_lan_address() {
        let (addr, server) = serve_once("200 OK", "");
        let client = HttpAgentClient::new(&addr).unwrap();

        client.join("10.0.0.5:8301", false).unwrap();
        assert_eq!(
            server.join().unwrap(),
            "PUT /v1/agent/join/10.0.0.5:8301 HTTP/1.1"
        );
    }

    #[test]
    fn test_join_wan_sets_query() {
        let (addr, server) = serve_once("200 OK", "");
        let client = HttpAgentClient::new(&addr).unwrap();

        client.join("10.0.0.5:8302", true).unwrap();
        assert_eq!(
            server.join().unwrap(),
            "PUT /v1/agent/join/10.0.0.5:8302?wan=1 HTTP/1.1"
        );
    }

    #[test]
    fn test_join_rejected_is_client_error() {
        let (addr, server) = serve_once("500 Internal Server Error", "no route to host");
        let client = HttpAgentClient::new(&addr).unwrap();

        let err = client.join("10.0.0.5:8301", false).unwrap_err();
        server.join().unwrap();
        assert!(matches!(err, AgentError::Client(ref msg) if msg.contains("500")));
    }

    #[test]
    fn test_members_parses_names() {
        let (addr, server) = serve_once(
            "200 OK",
            r#"[{"Name":"c1-0","Addr":"127.0.0.1","Port":8301},{"Name":"c1-1"}]"#,
        );
        let client = HttpAgentClient::new(&addr).unwrap();

        let members = client.members().unwrap();
        assert_eq!(server.join().unwrap(), "GET /v1/agent/members HTTP/1.1");
        assert_eq!(members, vec!["c1-0".to_string(), "c1-1".to_string()]);
    }

    #[test]
    fn test_unready_agent_times_out_and_is_killed() {
        let temp = tempdir().unwrap();
        let pid_file = temp.path().join("pid");
        let binary = fake_agent(
            temp.path(),
            &format!("echo $$ > {}\nexec sleep 30", pid_file.display()),
        );
        let provisioner = ProcessProvisioner::new(binary, temp.path().join("data"))
            .unwrap()
            .with_timeouts(Duration::from_millis(500), Duration::from_secs(1));

        let started = Instant::now();
        let err = provisioner.provision(NodeConfig::new("s1")).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(err, AgentError::Provision { ref message, .. }
            if message.contains("did not become ready")));

        let leftovers = fs::read_dir(temp.path().join("data")).unwrap().count();
        assert_eq!(leftovers, 0);

        let pid: libc::pid_t = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        // SAFETY: signal 0 only checks whether the pid exists.
        assert_ne!(unsafe { libc::kill(pid, 0) }, 0);
    }

    #[test]
    fn test_agent_exiting_during_startup_reports_status() {
        let temp = tempdir().unwrap();
        let binary = fake_agent(temp.path(), "exit 3");
        let provisioner = ProcessProvisioner::new(binary, temp.path().join("data"))
            .unwrap()
            .with_timeouts(Duration::from_secs(10), Duration::from_secs(1));

        let err = provisioner.provision(NodeConfig::new("s1")).unwrap_err();
        assert!(matches!(err, AgentError::Provision { ref name, ref message }
            if name == "s1" && message.contains("exited during startup")));

        let leftovers = fs::read_dir(temp.path().join("data")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_teardown_stops_child_and_removes_data_dir() {
        let temp = tempdir().unwrap();
        let provisioner = ProcessProvisioner::new("consul", temp.path())
            .unwrap()
            .with_timeouts(Duration::from_secs(1), Duration::from_secs(1));

        let data_dir = temp.path().join("s1-0000");
        fs::create_dir_all(&data_dir).unwrap();
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as libc::pid_t;

        let mut process = AgentProcess {
            id: "live".to_string(),
            name: "s1".to_string(),
            http_addr: "127.0.0.1:1".to_string(),
            https_addr: "127.0.0.1:2".to_string(),
            lan_addr: "127.0.0.1:3".to_string(),
            wan_addr: "127.0.0.1:4".to_string(),
            config: NodeConfig::new("s1"),
            started_at: Utc::now(),
        };
        process.config.data_dir = Some(data_dir.clone());
        provisioner
            .children
            .lock()
            .unwrap()
            .insert(process.id.clone(), RunningAgent { child, data_dir: data_dir.clone() });

        provisioner.teardown(&process).unwrap();
        assert!(!data_dir.exists());
        // SAFETY: signal 0 only checks whether the pid exists.
        assert_ne!(unsafe { libc::kill(pid, 0) }, 0);

        // Second teardown finds nothing to stop
        assert!(provisioner.teardown(&process).is_err());
    }

    #[test]
    fn test_missing_binary_fails_and_cleans_up() {
        let temp = tempdir().unwrap();
        let provisioner =
            ProcessProvisioner::new(temp.path().join("no-such-agent"), temp.path().join("data"))
                .unwrap();

        let err = provisioner.provision(NodeConfig::new("s1")).unwrap_err();
        assert!(matches!(err, AgentError::Provision { ref name, .. } if name == "s1"));

        let leftovers = fs::read_dir(temp.path().join("data")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_teardown_unknown_agent_fails() {
        let temp = tempdir().unwrap();
        let provisioner = ProcessProvisioner::new("consul", temp.path()).unwrap();

        let process = AgentProcess {
            id: "missing".to_string(),
            name: "ghost".to_string(),
            http_addr: "127.0.0.1:1".to_string(),
            https_addr: "127.0.0.1:2".to_string(),
            lan_addr: "127.0.0.1:3".to_string(),
            wan_addr: "127.0.0.1:4".to_string(),
            config: NodeConfig::new("ghost"),
            started_at: Utc::now(),
        };

        assert!(provisioner.teardown(&process).is_err());
    }
}
