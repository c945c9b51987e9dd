use serde_json::json;
use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoold");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoold");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Creates the database (and its WAL journal mode) before any racing opens.
fn prepare_workspace(prefix: &str) -> PathBuf {
    let workspace = temp_dir(prefix);
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    drop(stdin);
    let _ = child.wait();
    workspace
}

#[test]
fn sidecars_sharing_a_workspace_never_issue_the_same_value() {
    let workspace = prepare_workspace("schoold-counter-race");
    let sidecars = 4;
    let per_sidecar = 30;

    let handles: Vec<_> = (0..sidecars)
        .map(|n| {
            let workspace = workspace.clone();
            thread::spawn(move || {
                let (mut child, mut stdin, mut reader) = spawn_sidecar();
                let _ = request_ok(
                    &mut stdin,
                    &mut reader,
                    "ws",
                    "workspace.select",
                    json!({ "path": workspace.to_string_lossy() }),
                );
                let mut values = Vec::new();
                for i in 0..per_sidecar {
                    let res = request_ok(
                        &mut stdin,
                        &mut reader,
                        &format!("{}-{}", n, i),
                        "counters.next",
                        json!({ "key": "student_regno_2025" }),
                    );
                    values.push(res.get("value").and_then(|v| v.as_i64()).expect("value"));
                }
                drop(stdin);
                let _ = child.wait();
                values
            })
        })
        .collect();

    let mut all: Vec<i64> = Vec::new();
    for h in handles {
        let values = h.join().expect("join");
        // Each caller observes its own values strictly increasing.
        assert!(values.windows(2).all(|w| w[0] < w[1]), "{:?}", values);
        all.extend(values);
    }
    all.sort();
    let expected: Vec<i64> = (1..=(sidecars * per_sidecar) as i64).collect();
    assert_eq!(all, expected);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn concurrent_registrations_get_distinct_numbers() {
    let workspace = prepare_workspace("schoold-register-race");
    let sidecars = 3;
    let per_sidecar = 5;

    let handles: Vec<_> = (0..sidecars)
        .map(|n| {
            let workspace = workspace.clone();
            thread::spawn(move || {
                let (mut child, mut stdin, mut reader) = spawn_sidecar();
                let _ = request_ok(
                    &mut stdin,
                    &mut reader,
                    "ws",
                    "workspace.select",
                    json!({ "path": workspace.to_string_lossy() }),
                );
                let mut reg_nos = Vec::new();
                for i in 0..per_sidecar {
                    let res = request_ok(
                        &mut stdin,
                        &mut reader,
                        &format!("{}-{}", n, i),
                        "students.create",
                        json!({
                            "lastName": format!("Family{}", n),
                            "firstName": format!("Child{}", i),
                            "admissionYear": 2025
                        }),
                    );
                    reg_nos.push(
                        res.get("regNo")
                            .and_then(|v| v.as_str())
                            .expect("regNo")
                            .to_string(),
                    );
                }
                drop(stdin);
                let _ = child.wait();
                reg_nos
            })
        })
        .collect();

    let issued: HashSet<String> = handles
        .into_iter()
        .flat_map(|h| h.join().expect("join"))
        .collect();
    let expected: HashSet<String> = (1..=sidecars * per_sidecar)
        .map(|n| format!("abu/s/2025/{:03}", n))
        .collect();
    assert_eq!(issued, expected);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn reservations_and_single_values_interleave_without_overlap() {
    let workspace = prepare_workspace("schoold-counter-reserve");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let a = request_ok(&mut stdin, &mut reader, "1", "counters.next", json!({ "key": "a" }));
    let block = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "counters.reserve",
        json!({ "key": "a", "count": 5 }),
    );
    let b = request_ok(&mut stdin, &mut reader, "3", "counters.next", json!({ "key": "b" }));
    let a2 = request_ok(&mut stdin, &mut reader, "4", "counters.next", json!({ "key": "a" }));

    assert_eq!(a.get("value").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(block.get("first").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(block.get("last").and_then(|v| v.as_i64()), Some(6));
    assert_eq!(b.get("value").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(a2.get("value").and_then(|v| v.as_i64()), Some(7));

    let listed = request_ok(&mut stdin, &mut reader, "5", "counters.list", json!({}));
    assert_eq!(
        listed.get("counters").cloned(),
        Some(json!([
            { "key": "a", "sequenceValue": 7 },
            { "key": "b", "sequenceValue": 1 }
        ]))
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
