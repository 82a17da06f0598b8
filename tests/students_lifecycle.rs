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
    let exe = env!("CARGO_BIN_EXE_schooldeskd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schooldeskd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
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

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

fn select_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> String {
    let _ = request_ok(
        stdin,
        reader,
        "setup-1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        stdin,
        reader,
        "setup-2",
        "classes.create",
        json!({ "name": "Grade 8A" }),
    );
    created
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string()
}

#[test]
fn create_update_list_flow() {
    let workspace = temp_dir("schooldesk-students-crud");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let class_id = select_workspace(&mut stdin, &mut reader, &workspace);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({
            "classId": class_id,
            "firstName": "Asha",
            "lastName": "Rao",
            "studentNo": "S-104"
        }),
    );
    let student_id = created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.list",
        json!({ "classId": class_id }),
    );
    let students = listed
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students");
    assert_eq!(students.len(), 1);
    assert_eq!(
        students[0].get("displayName").and_then(|v| v.as_str()),
        Some("Rao, Asha")
    );
    assert_eq!(
        students[0].get("studentNo").and_then(|v| v.as_str()),
        Some("S-104")
    );
    assert_eq!(students[0].get("active").and_then(|v| v.as_bool()), Some(true));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.update",
        json!({ "studentId": student_id, "lastName": "Rao-Sharma", "active": false }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.list",
        json!({ "classId": class_id }),
    );
    let students = listed
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students");
    assert_eq!(
        students[0].get("displayName").and_then(|v| v.as_str()),
        Some("Rao-Sharma, Asha")
    );
    assert_eq!(
        students[0].get("active").and_then(|v| v.as_bool()),
        Some(false)
    );
}

#[test]
fn delete_is_refused_while_receipts_exist() {
    let workspace = temp_dir("schooldesk-students-delete-refused");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let class_id = select_workspace(&mut stdin, &mut reader, &workspace);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({ "classId": class_id, "firstName": "Asha", "lastName": "Rao" }),
    );
    let student_id = created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "fees.recordPayment",
        json!({
            "studentId": student_id,
            "academicYear": "2025-26",
            "amount": "100",
            "paymentMode": "cash"
        }),
    );

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "3",
        "students.delete",
        json!({ "studentId": student_id }),
    );
    assert_eq!(code, "invalid_state");

    // Deactivation is the supported path for students with history.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.update",
        json!({ "studentId": student_id, "active": false }),
    );
}

#[test]
fn delete_without_receipts_removes_account_too() {
    let workspace = temp_dir("schooldesk-students-delete-clean");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let class_id = select_workspace(&mut stdin, &mut reader, &workspace);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({ "classId": class_id, "firstName": "Asha", "lastName": "Rao" }),
    );
    let student_id = created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "feeStructures.set",
        json!({ "classId": class_id, "academicYear": "2025-26", "amount": "1000" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "fees.syncAccounts",
        json!({ "classId": class_id, "academicYear": "2025-26" }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.delete",
        json!({ "studentId": student_id }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.list",
        json!({ "classId": class_id }),
    );
    assert_eq!(
        listed
            .get("students")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "fees.getAccount",
        json!({ "studentId": student_id, "academicYear": "2025-26" }),
    );
    assert!(got.get("account").expect("account field").is_null());
}

#[test]
fn create_in_unknown_class_is_not_found() {
    let workspace = temp_dir("schooldesk-students-badclass");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = select_workspace(&mut stdin, &mut reader, &workspace);

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({ "classId": "no-such-class", "firstName": "Asha", "lastName": "Rao" }),
    );
    assert_eq!(code, "not_found");
}
