use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
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

fn read_response(reader: &mut BufReader<ChildStdout>) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request(
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

    let value = read_response(reader);
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn error_code(v: &serde_json::Value) -> Option<&str> {
    v.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_str())
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("schoold-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(
        health
            .get("result")
            .and_then(|r| r.get("workspacePath"))
            .cloned(),
        Some(serde_json::Value::Null)
    );

    let before = request(
        &mut stdin,
        &mut reader,
        "2",
        "counters.next",
        json!({ "key": "k" }),
    );
    assert_eq!(error_code(&before), Some("no_workspace"));
    for (id, method) in [
        ("2a", "counters.list"),
        ("2b", "students.list"),
        ("2c", "marks.list"),
    ] {
        let listed = request(&mut stdin, &mut reader, id, method, json!({}));
        assert_eq!(error_code(&listed), Some("no_workspace"), "{}", method);
    }

    let _ = request(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request(&mut stdin, &mut reader, "4", "setup.get", json!({}));
    let _ = request(&mut stdin, &mut reader, "5", "counters.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "6",
        "counters.peek",
        json!({ "key": "k" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "7",
        "registration.format",
        json!({ "prefix": "abu/s", "year": 2025, "sequence": 7, "width": 3 }),
    );
    let created = request(
        &mut stdin,
        &mut reader,
        "8",
        "students.create",
        json!({ "lastName": "Smoke", "firstName": "Student", "admissionYear": 2025 }),
    );
    let student_id = created
        .get("result")
        .and_then(|v| v.get("studentId"))
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request(&mut stdin, &mut reader, "9", "students.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "10",
        "marks.record",
        json!({ "studentId": student_id, "subject": "Math", "score": 40, "outOf": 50 }),
    );
    let _ = request(&mut stdin, &mut reader, "11", "marks.list", json!({}));
    let _ = request(&mut stdin, &mut reader, "12", "marks.verify", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "grade.compute",
        json!({ "score": 40, "outOf": 50 }),
    );
    let _ = request(&mut stdin, &mut reader, "14", "reports.marksModel", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "15",
        "students.delete",
        json!({ "studentId": student_id }),
    );

    writeln!(
        stdin,
        "{}",
        json!({ "id": "16", "method": "no.such.method", "params": {} })
    )
    .expect("write");
    stdin.flush().expect("flush");
    let unknown = read_response(&mut reader);
    assert_eq!(error_code(&unknown), Some("not_implemented"));

    writeln!(stdin, "{{not json").expect("write");
    stdin.flush().expect("flush");
    let bad = read_response(&mut reader);
    assert_eq!(bad.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(error_code(&bad), Some("bad_json"));

    // The loop keeps serving after a malformed line.
    let health = request(&mut stdin, &mut reader, "17", "health", json!({}));
    assert_eq!(health.get("ok").and_then(|v| v.as_bool()), Some(true));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn workspace_env_var_opens_before_first_request() {
    let workspace = temp_dir("schoold-env-workspace");
    let exe = env!("CARGO_BIN_EXE_schoold");
    let mut child = Command::new(exe)
        .env("SCHOOLD_WORKSPACE", &workspace)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoold");
    let mut stdin = child.stdin.take().expect("child stdin");
    let mut reader = BufReader::new(child.stdout.take().expect("child stdout"));

    let next = request(
        &mut stdin,
        &mut reader,
        "1",
        "counters.next",
        json!({ "key": "env" }),
    );
    assert_eq!(
        next.get("result").and_then(|r| r.get("value")).and_then(|v| v.as_i64()),
        Some(1)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
