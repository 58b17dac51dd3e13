use std::error::Error;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use documentdb_operator::controller::naming::engine_cluster_name;
use documentdb_operator::crd::{Cluster, DocumentDB};
use kube::CustomResourceExt;

const TEST_NAMESPACE: &str = "documentdb-e2e";
const RESOURCE_NAME: &str = "e2e-db";
const MEMBER: &str = "member-a";
const PEER: &str = "member-b";

/// Returns true if the given binary is accessible in PATH.
fn tool_available(binary: &str) -> bool {
    Command::new(binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

// ---------------------------------------------------------------------------
// Failover on a single Kind cluster
//
// Runs the operator binary locally against a Kind cluster as member-a of a
// two-member topology whose peer never shows up. Only the engine cluster
// objects are checked; no CNPG controller is installed.
// Run with: cargo test --test e2e_kind -- --ignored
// ---------------------------------------------------------------------------

/// 1. Start (or reuse) a Kind cluster and install both CRDs.
/// 2. Run the operator as `member-a`.
/// 3. Apply a DocumentDB with member-a as primary and wait for its engine cluster.
/// 4. Move the primary to member-b and wait for member-a's engine cluster to
///    be demoted.
/// 5. Drop member-a from the member list and wait for its engine cluster to go.
#[test]
#[ignore]
fn e2e_documentdb_failover() -> Result<(), Box<dyn Error>> {
    for tool in &["kind", "kubectl"] {
        if !tool_available(tool) {
            eprintln!("Skipping e2e test: `{tool}` not found in PATH.");
            return Ok(());
        }
    }

    let cluster_name =
        std::env::var("KIND_CLUSTER_NAME").unwrap_or_else(|_| "documentdb-e2e".into());
    ensure_kind_cluster(&cluster_name)?;

    kubectl_apply(&serde_yaml::to_string(&DocumentDB::crd())?)?;
    kubectl_apply(&serde_yaml::to_string(&Cluster::crd())?)?;
    run_cmd(
        "kubectl",
        &["wait", "--for=condition=Established", "crd/documentdbs.documentdb.io", "--timeout=60s"],
    )?;
    kubectl_apply(&format!(
        "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: {TEST_NAMESPACE}\n"
    ))?;

    let operator = Command::new(env!("CARGO_BIN_EXE_documentdb-operator"))
        .args(["run", "--member-name", MEMBER, "--namespace", TEST_NAMESPACE])
        .env("RUST_LOG", "info")
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()?;
    let _cleanup = Cleanup { operator };

    let engine = engine_cluster_name(RESOURCE_NAME, MEMBER);
    let peer_engine = engine_cluster_name(RESOURCE_NAME, PEER);

    // ── Primary on member-a ──────────────────────────────────────────────────
    kubectl_apply(&documentdb_manifest(&[MEMBER, PEER], MEMBER))?;
    wait_for("engine cluster as primary", Duration::from_secs(90), || {
        Ok(engine_field(&engine, "{.spec.replica.primary}")? == engine)
    })?;
    assert_eq!(engine_field(&engine, "{.spec.replica.self}")?, engine);

    // ── Failover to member-b ─────────────────────────────────────────────────
    kubectl_apply(&documentdb_manifest(&[MEMBER, PEER], PEER))?;
    wait_for("engine cluster demotion", Duration::from_secs(90), || {
        Ok(engine_field(&engine, "{.spec.replica.primary}")? == peer_engine)
    })?;
    assert_eq!(engine_field(&engine, "{.spec.replica.source}")?, peer_engine);

    // ── member-a leaves the topology ─────────────────────────────────────────
    kubectl_apply(&documentdb_manifest(&[PEER], PEER))?;
    wait_for("engine cluster removal", Duration::from_secs(90), || {
        let out = run_cmd(
            "kubectl",
            &[
                "get",
                "clusters.postgresql.cnpg.io",
                &engine,
                "-n",
                TEST_NAMESPACE,
                "--ignore-not-found",
                "-o",
                "name",
            ],
        )?;
        Ok(out.is_empty())
    })?;
    wait_for("NotPresent phase", Duration::from_secs(60), || {
        let phase = run_cmd(
            "kubectl",
            &[
                "get",
                "documentdb",
                RESOURCE_NAME,
                "-n",
                TEST_NAMESPACE,
                "-o",
                "jsonpath={.status.phase}",
            ],
        )?;
        Ok(phase == "NotPresent")
    })?;

    Ok(())
}

fn documentdb_manifest(members: &[&str], primary: &str) -> String {
    let list: String = members
        .iter()
        .map(|m| format!("      - name: {m}\n"))
        .collect();
    format!(
        r#"apiVersion: documentdb.io/preview
kind: DocumentDB
metadata:
  name: {RESOURCE_NAME}
  namespace: {TEST_NAMESPACE}
spec:
  nodeCount: 1
  instancesPerNode: 1
  resource:
    storage:
      pvcSize: 1Gi
  clusterReplication:
    primary: {primary}
    crossCloudNetworkingStrategy: None
    clusterList:
{list}"#
    )
}

fn engine_field(engine: &str, jsonpath: &str) -> Result<String, Box<dyn Error>> {
    let out = run_cmd(
        "kubectl",
        &[
            "get",
            "clusters.postgresql.cnpg.io",
            engine,
            "-n",
            TEST_NAMESPACE,
            "--ignore-not-found",
            "-o",
            &format!("jsonpath={jsonpath}"),
        ],
    )?;
    Ok(out)
}

struct Cleanup {
    operator: Child,
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        let _ = self.operator.kill();
        let _ = self.operator.wait();
        let _ = run_cmd(
            "kubectl",
            &[
                "delete",
                "namespace",
                TEST_NAMESPACE,
                "--ignore-not-found=true",
                "--wait=false",
            ],
        );
    }
}

fn ensure_kind_cluster(name: &str) -> Result<(), Box<dyn Error>> {
    let clusters = run_cmd("kind", &["get", "clusters"])?;
    if clusters.lines().any(|line| line.trim() == name) {
        return Ok(());
    }
    run_cmd("kind", &["create", "cluster", "--name", name])?;
    Ok(())
}

fn kubectl_apply(manifest: &str) -> Result<(), Box<dyn Error>> {
    run_cmd_with_stdin("kubectl", &["apply", "-f", "-"], manifest)
}

fn run_cmd(program: &str, args: &[&str]) -> Result<String, Box<dyn Error>> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
        cmd.env("KUBECONFIG", kubeconfig);
    }
    let output = cmd.output()?;
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "command failed: {} {:?}\nstdout:\n{}\nstderr:\n{}",
            program, args, stdout, stderr
        )
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn run_cmd_with_stdin(program: &str, args: &[&str], input: &str) -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
        cmd.env("KUBECONFIG", kubeconfig);
    }
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        use std::io::Write;
        stdin.write_all(input.as_bytes())?;
        stdin.flush()?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(format!(
            "command failed: {} {:?}\nstderr:\n{}",
            program,
            args,
            String::from_utf8_lossy(&output.stderr)
        )
        .into());
    }
    Ok(())
}

fn wait_for<F>(label: &str, timeout: Duration, mut condition: F) -> Result<(), Box<dyn Error>>
where
    F: FnMut() -> Result<bool, Box<dyn Error>>,
{
    let start = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        if condition()? {
            return Ok(());
        }
        attempts += 1;
        if start.elapsed() > timeout {
            return Err(format!(
                "timeout while waiting for {} after {:?} (attempts={})",
                label, timeout, attempts
            )
            .into());
        }
        sleep(Duration::from_secs(3));
    }
}
