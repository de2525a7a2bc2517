//! Parallel build execution.
//!
//! Worker threads pull ready nodes from a shared queue; a node is ready when
//! every dependency completed successfully. Fingerprint hits in the compile
//! cache complete without spawning anything. The default failure policy is
//! fail-fast-but-drain: after the first failure nothing new is dispatched
//! but in-flight work runs to completion. Keep-going mode instead skips only
//! the transitive dependents of failed nodes. Test-run nodes execute in a
//! second phase, after every compilation has settled, and one test failure
//! never prevents another test from running.

use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::cancel::CancelToken;

use super::cache::{CacheError, CompileCache};
use super::fingerprint;
use super::plan::{BuildNode, BuildPlan, NodeKind};

#[derive(Error, Debug)]
pub enum ExecError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    /// Ran and exited zero.
    Ok,
    /// Completed from the compile cache without running.
    CachedOk,
    /// Ran and exited non-zero (or failed to spawn).
    Failed { code: Option<i32> },
    /// Exceeded its wall-clock limit and was killed.
    TimedOut,
    /// Never ran because a dependency failed or dispatch stopped.
    Skipped,
    /// Never ran because the build was cancelled.
    Cancelled,
}

impl NodeStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, NodeStatus::Ok | NodeStatus::CachedOk)
    }
}

/// Outcome of one node, with its buffered diagnostics.
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub node_id: usize,
    pub status: NodeStatus,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub jobs: usize,
    pub keep_going: bool,
    pub token: CancelToken,
    /// How long cancelled subprocesses get before the executor stops waiting.
    pub grace: Duration,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            jobs: num_cpus::get(),
            keep_going: false,
            token: CancelToken::new(),
            grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Default)]
pub struct BuildOutcome {
    /// One result per node, in node-id order.
    pub results: Vec<NodeResult>,
    /// Subprocesses actually spawned.
    pub spawned: usize,
    /// Nodes completed from the compile cache.
    pub cached: usize,
    /// Failed compile/archive/link node IDs.
    pub failed_nodes: Vec<usize>,
    /// Failed test-run node IDs.
    pub failed_tests: Vec<usize>,
    pub cancelled: bool,
}

impl BuildOutcome {
    pub fn success(&self) -> bool {
        !self.cancelled && self.failed_nodes.is_empty() && self.failed_tests.is_empty()
    }
}

/// Run a plan to completion. `report` observes every node result exactly
/// once, in node-id order, with diagnostics already buffered per node.
pub fn execute(
    plan: &BuildPlan,
    cache: &CompileCache,
    opts: &ExecOptions,
    report: &mut dyn FnMut(&BuildNode, &NodeResult),
) -> Result<BuildOutcome, ExecError> {
    let mut outcome = BuildOutcome::default();
    let mut done: HashMap<usize, NodeStatus> = HashMap::new();

    // Tests run only after every compilation has settled.
    let main_ids: Vec<usize> = plan
        .nodes
        .iter()
        .filter(|n| n.kind != NodeKind::TestRun)
        .map(|n| n.id)
        .collect();
    let test_ids: Vec<usize> = plan
        .nodes
        .iter()
        .filter(|n| n.kind == NodeKind::TestRun)
        .map(|n| n.id)
        .collect();

    run_phase(plan, &main_ids, cache, opts, &mut done, &mut outcome)?;
    run_phase(plan, &test_ids, cache, opts, &mut done, &mut outcome)?;

    let mut results: Vec<NodeResult> = outcome.results.drain(..).collect();
    results.sort_by_key(|r| r.node_id);
    for result in &results {
        report(&plan.nodes[result.node_id], result);
    }
    outcome.results = results;

    // Failed or interrupted nodes leave no partial outputs behind.
    for result in &outcome.results {
        if !result.status.is_ok() {
            for output in &plan.nodes[result.node_id].outputs {
                let _ = std::fs::remove_file(output);
            }
        }
    }

    Ok(outcome)
}

struct Job<'p> {
    node: &'p BuildNode,
}

fn run_phase(
    plan: &BuildPlan,
    ids: &[usize],
    cache: &CompileCache,
    opts: &ExecOptions,
    done: &mut HashMap<usize, NodeStatus>,
    outcome: &mut BuildOutcome,
) -> Result<(), ExecError> {
    if ids.is_empty() {
        return Ok(());
    }
    let in_phase: HashMap<usize, ()> = ids.iter().map(|id| (*id, ())).collect();

    // In-degree over in-phase edges; cross-phase dependencies are already
    // settled and only gate readiness.
    let mut waits: HashMap<usize, usize> = HashMap::new();
    let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
    for &id in ids {
        let node = &plan.nodes[id];
        let mut n = 0;
        for &dep in &node.deps {
            if in_phase.contains_key(&dep) {
                n += 1;
                dependents.entry(dep).or_default().push(id);
            }
        }
        waits.insert(id, n);
    }

    let deps_ok = |id: usize, done: &HashMap<usize, NodeStatus>| {
        plan.nodes[id]
            .deps
            .iter()
            .all(|d| done.get(d).map(NodeStatus::is_ok).unwrap_or(false))
    };

    let mut ready: VecDeque<usize> = ids
        .iter()
        .copied()
        .filter(|id| waits[id] == 0)
        .collect();

    let fail_fast = !opts.keep_going;
    let mut stop_dispatch = false;
    let mut completed = 0usize;
    let total = ids.len();
    let mut in_flight = 0usize;

    let (job_tx, job_rx) = mpsc::channel::<Job<'_>>();
    let (result_tx, result_rx) = mpsc::channel::<NodeResult>();
    let job_rx = Mutex::new(job_rx);
    let job_rx = &job_rx;

    std::thread::scope(|scope| -> Result<(), ExecError> {
        for _ in 0..opts.jobs.max(1) {
            let result_tx = result_tx.clone();
            let token = opts.token.clone();
            let grace = opts.grace;
            scope.spawn(move || {
                loop {
                    let job = match job_rx.lock().expect("executor queue poisoned").recv() {
                        Ok(j) => j,
                        Err(_) => break,
                    };
                    let result = run_node(job.node, &token, grace);
                    if result_tx.send(result).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        let mut complete =
            |id: usize,
             result: NodeResult,
             done: &mut HashMap<usize, NodeStatus>,
             ready: &mut VecDeque<usize>,
             stop_dispatch: &mut bool,
             outcome: &mut BuildOutcome|
             -> usize {
                let mut newly_done = vec![(id, result)];
                let mut count = 0;
                while let Some((nid, res)) = newly_done.pop() {
                    if done.contains_key(&nid) {
                        continue;
                    }
                    let ok = res.status.is_ok();
                    let failed = matches!(
                        res.status,
                        NodeStatus::Failed { .. } | NodeStatus::TimedOut
                    );
                    if failed {
                        if plan.nodes[nid].kind == NodeKind::TestRun {
                            outcome.failed_tests.push(nid);
                        } else {
                            outcome.failed_nodes.push(nid);
                            if fail_fast {
                                *stop_dispatch = true;
                            }
                        }
                    }
                    done.insert(nid, res.status.clone());
                    outcome.results.push(res);
                    count += 1;

                    for &dep_id in dependents.get(&nid).into_iter().flatten() {
                        let w = waits.get_mut(&dep_id).expect("dependent is in phase");
                        *w -= 1;
                        if *w == 0 {
                            if ok {
                                ready.push_back(dep_id);
                            } else {
                                // Dependency failed or was skipped.
                                newly_done.push((
                                    dep_id,
                                    NodeResult {
                                        node_id: dep_id,
                                        status: NodeStatus::Skipped,
                                        stdout: String::new(),
                                        stderr: String::new(),
                                    },
                                ));
                            }
                        }
                    }
                }
                count
            };

        while completed < total {
            // Dispatch everything ready.
            while let Some(id) = ready.pop_front() {
                if done.contains_key(&id) {
                    continue;
                }
                if opts.token.is_cancelled() {
                    outcome.cancelled = true;
                    stop_dispatch = true;
                }
                let node = &plan.nodes[id];

                if stop_dispatch {
                    let status = if outcome.cancelled {
                        NodeStatus::Cancelled
                    } else {
                        NodeStatus::Skipped
                    };
                    completed += complete(
                        id,
                        NodeResult {
                            node_id: id,
                            status,
                            stdout: String::new(),
                            stderr: String::new(),
                        },
                        done,
                        &mut ready,
                        &mut stop_dispatch,
                        outcome,
                    );
                    continue;
                }

                if !deps_ok(id, done) {
                    completed += complete(
                        id,
                        NodeResult {
                            node_id: id,
                            status: NodeStatus::Skipped,
                            stdout: String::new(),
                            stderr: String::new(),
                        },
                        done,
                        &mut ready,
                        &mut stop_dispatch,
                        outcome,
                    );
                    continue;
                }

                // Fingerprint hit with intact outputs: complete on the spot.
                let hit = cache.lookup(node.fingerprint)?;
                let outputs_present = node.outputs.iter().all(|o| o.exists());
                if hit.is_some() && outputs_present {
                    debug!(node = %node.label, "compile cache hit");
                    outcome.cached += 1;
                    completed += complete(
                        id,
                        NodeResult {
                            node_id: id,
                            status: NodeStatus::CachedOk,
                            stdout: String::new(),
                            stderr: String::new(),
                        },
                        done,
                        &mut ready,
                        &mut stop_dispatch,
                        outcome,
                    );
                    continue;
                }

                outcome.spawned += 1;
                in_flight += 1;
                job_tx
                    .send(Job { node })
                    .expect("workers outlive the dispatch loop");
            }

            if in_flight == 0 {
                if completed < total && ready.is_empty() {
                    // Everything left is unreachable (stop_dispatch with an
                    // empty frontier): drain it as skipped.
                    let remaining: Vec<usize> = ids
                        .iter()
                        .copied()
                        .filter(|id| !done.contains_key(id))
                        .collect();
                    for id in remaining {
                        if done.contains_key(&id) {
                            continue;
                        }
                        let status = if outcome.cancelled {
                            NodeStatus::Cancelled
                        } else {
                            NodeStatus::Skipped
                        };
                        completed += complete(
                            id,
                            NodeResult {
                                node_id: id,
                                status,
                                stdout: String::new(),
                                stderr: String::new(),
                            },
                            done,
                            &mut ready,
                            &mut stop_dispatch,
                            outcome,
                        );
                    }
                }
                continue;
            }

            match result_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(result) => {
                    in_flight -= 1;
                    let node = &plan.nodes[result.node_id];
                    if result.status == NodeStatus::Ok {
                        let out_hash = node
                            .outputs
                            .first()
                            .filter(|o| o.exists())
                            .map(|o| fingerprint::output_digest(o))
                            .transpose()?
                            .unwrap_or_else(|| "no-output".to_string());
                        cache.record(node.fingerprint, &out_hash)?;
                    }
                    completed += complete(
                        result.node_id,
                        result,
                        done,
                        &mut ready,
                        &mut stop_dispatch,
                        outcome,
                    );
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if opts.token.is_cancelled() && !outcome.cancelled {
                        outcome.cancelled = true;
                        stop_dispatch = true;
                        warn!("cancellation requested; draining in-flight work");
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        drop(job_tx);
        Ok(())
    })?;

    Ok(())
}

/// Run one node's subprocess, buffering its diagnostics. Polls the
/// cancellation token and the node's wall-clock limit while waiting.
fn run_node(node: &BuildNode, token: &CancelToken, grace: Duration) -> NodeResult {
    for output in &node.outputs {
        if let Some(parent) = output.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let fail = |message: String| NodeResult {
        node_id: node.id,
        status: NodeStatus::Failed { code: None },
        stdout: String::new(),
        stderr: message,
    };

    let (program, args) = match node.argv.split_first() {
        Some(split) => split,
        None => return fail("empty command line".to_string()),
    };

    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(c) => c,
        Err(e) => return fail(format!("failed to spawn {program:?}: {e}")),
    };

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_reader = std::thread::spawn(move || read_all(stdout_pipe));
    let stderr_reader = std::thread::spawn(move || read_all(stderr_pipe));

    let deadline = node.timeout.map(|t| Instant::now() + t);
    let mut killed_for: Option<NodeStatus> = None;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(_) => break None,
        }
        if killed_for.is_none() {
            if token.is_cancelled() {
                let _ = child.kill();
                killed_for = Some(NodeStatus::Cancelled);
                // Give the child the grace window to die, then stop waiting.
                let grace_deadline = Instant::now() + grace;
                while Instant::now() < grace_deadline {
                    if let Ok(Some(_)) = child.try_wait() {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
                break None;
            }
            if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                let _ = child.kill();
                killed_for = Some(NodeStatus::TimedOut);
            }
        }
        std::thread::sleep(Duration::from_millis(25));
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    let status = match killed_for {
        Some(s) => s,
        None => match status {
            Some(st) if st.success() => NodeStatus::Ok,
            Some(st) => NodeStatus::Failed { code: st.code() },
            None => NodeStatus::Failed { code: None },
        },
    };

    NodeResult {
        node_id: node.id,
        status,
        stdout,
        stderr,
    }
}

fn read_all(pipe: Option<impl Read>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::build::plan::NodeKind;
    use crate::build::{fingerprint::node_fingerprint, CompileCache};
    use std::path::Path;
    use tempfile::tempdir;

    fn script_node(id: usize, dir: &Path, name: &str, script: &str, deps: Vec<usize>) -> BuildNode {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let out = dir.join(format!("{name}.out"));
        BuildNode {
            id,
            kind: NodeKind::Compile,
            label: format!("run {name}"),
            argv: vec![path.display().to_string(), out.display().to_string()],
            inputs: vec![path.clone()],
            outputs: vec![out],
            deps,
            fingerprint: node_fingerprint(name, &[name.to_string()], &[path]).unwrap(),
            timeout: None,
        }
    }

    fn run(plan: &BuildPlan, cache: &CompileCache, opts: &ExecOptions) -> BuildOutcome {
        let mut order = Vec::new();
        let outcome = execute(plan, cache, opts, &mut |node, result| {
            order.push((node.id, result.status.clone()));
        })
        .unwrap();
        // Reporting is ordered by node id.
        let ids: Vec<usize> = order.iter().map(|(id, _)| *id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        outcome
    }

    #[test]
    fn runs_dag_in_dependency_order() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let n0 = script_node(0, dir, "first", "echo hello > \"$1\"", vec![]);
        let n1 = script_node(1, dir, "second", "test -f FIRST_OUT && echo done > \"$1\"", vec![0]);
        // Second checks the first's output actually exists by then.
        let mut n1 = n1;
        n1.argv = vec![
            dir.join("second").display().to_string(),
            dir.join("second.out").display().to_string(),
        ];
        std::fs::write(
            dir.join("second"),
            format!(
                "#!/bin/sh\ntest -f {} && echo done > \"$1\"\n",
                dir.join("first.out").display()
            ),
        )
        .unwrap();

        let plan = BuildPlan {
            nodes: vec![n0, n1],
            out_dir: dir.to_path_buf(),
        };
        let cache = CompileCache::open_in_memory().unwrap();
        let outcome = run(&plan, &cache, &ExecOptions::default());

        assert!(outcome.success());
        assert_eq!(outcome.spawned, 2);
        assert!(dir.join("second.out").exists());
    }

    #[test]
    fn cache_hit_skips_spawn() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let plan = BuildPlan {
            nodes: vec![script_node(0, dir, "build", "echo x > \"$1\"", vec![])],
            out_dir: dir.to_path_buf(),
        };
        let cache = CompileCache::open_in_memory().unwrap();

        let first = run(&plan, &cache, &ExecOptions::default());
        assert_eq!(first.spawned, 1);

        let second = run(&plan, &cache, &ExecOptions::default());
        assert_eq!(second.spawned, 0, "replay must not spawn");
        assert_eq!(second.cached, 1);
        assert!(second.success());
    }

    #[test]
    fn fail_fast_skips_dependents() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let bad = script_node(0, dir, "bad", "echo broken >&2; exit 1", vec![]);
        let child = script_node(1, dir, "child", "echo x > \"$1\"", vec![0]);
        let plan = BuildPlan {
            nodes: vec![bad, child],
            out_dir: dir.to_path_buf(),
        };
        let cache = CompileCache::open_in_memory().unwrap();
        let outcome = run(&plan, &cache, &ExecOptions::default());

        assert!(!outcome.success());
        assert_eq!(outcome.failed_nodes, vec![0]);
        assert_eq!(outcome.results[1].status, NodeStatus::Skipped);
        assert!(outcome.results[0].stderr.contains("broken"));
    }

    #[test]
    fn keep_going_builds_independent_nodes() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let bad = script_node(0, dir, "bad", "exit 1", vec![]);
        let good = script_node(1, dir, "good", "echo x > \"$1\"", vec![]);
        let plan = BuildPlan {
            nodes: vec![bad, good],
            out_dir: dir.to_path_buf(),
        };
        let cache = CompileCache::open_in_memory().unwrap();
        let opts = ExecOptions {
            keep_going: true,
            jobs: 1,
            ..ExecOptions::default()
        };
        let outcome = run(&plan, &cache, &opts);

        assert_eq!(outcome.failed_nodes, vec![0]);
        assert_eq!(outcome.results[1].status, NodeStatus::Ok);
        assert!(dir.join("good.out").exists());
    }

    #[test]
    fn timeout_kills_and_reports() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let mut slow = script_node(0, dir, "slow", "sleep 30", vec![]);
        slow.timeout = Some(Duration::from_millis(100));
        let plan = BuildPlan {
            nodes: vec![slow],
            out_dir: dir.to_path_buf(),
        };
        let cache = CompileCache::open_in_memory().unwrap();
        let outcome = run(&plan, &cache, &ExecOptions::default());
        assert_eq!(outcome.results[0].status, NodeStatus::TimedOut);
        assert!(!outcome.success());
    }

    #[test]
    fn failed_outputs_are_removed() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let bad = script_node(0, dir, "bad", "echo partial > \"$1\"; exit 1", vec![]);
        let out = bad.outputs[0].clone();
        let plan = BuildPlan {
            nodes: vec![bad],
            out_dir: dir.to_path_buf(),
        };
        let cache = CompileCache::open_in_memory().unwrap();
        let outcome = run(&plan, &cache, &ExecOptions::default());
        assert!(!outcome.success());
        assert!(!out.exists(), "partial output must be cleaned up");
    }

    #[test]
    fn cancellation_stops_dispatch() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let token = CancelToken::new();
        token.cancel();

        let plan = BuildPlan {
            nodes: vec![script_node(0, dir, "any", "echo x > \"$1\"", vec![])],
            out_dir: dir.to_path_buf(),
        };
        let cache = CompileCache::open_in_memory().unwrap();
        let opts = ExecOptions {
            token,
            ..ExecOptions::default()
        };
        let outcome = run(&plan, &cache, &opts);
        assert!(outcome.cancelled);
        assert_eq!(outcome.results[0].status, NodeStatus::Cancelled);
        assert_eq!(outcome.spawned, 0);
    }
}
