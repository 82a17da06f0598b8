use serde_json::json;
use std::collections::HashSet;
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

fn setup_class_with_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> (String, String) {
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
    let class_id = created
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let student = request_ok(
        stdin,
        reader,
        "setup-3",
        "students.create",
        json!({ "classId": class_id, "firstName": "Asha", "lastName": "Rao" }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    (class_id, student_id)
}

fn record(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    student_id: &str,
    year: &str,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        id,
        "fees.recordPayment",
        json!({
            "studentId": student_id,
            "academicYear": year,
            "amount": "100",
            "paymentMode": "cash"
        }),
    )
}

#[test]
fn receipts_are_monotonic_and_unique_within_a_year() {
    let workspace = temp_dir("schooldesk-receipts-monotonic");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (_class_id, student_id) = setup_class_with_student(&mut stdin, &mut reader, &workspace);

    let mut receipts = Vec::new();
    for i in 1..=3 {
        let paid = record(&mut stdin, &mut reader, &format!("r{}", i), &student_id, "2025-26");
        receipts.push(
            paid.get("receiptNumber")
                .and_then(|v| v.as_str())
                .expect("receiptNumber")
                .to_string(),
        );
    }

    assert_eq!(
        receipts,
        vec!["2025-26-000001", "2025-26-000002", "2025-26-000003"]
    );
    let unique: HashSet<_> = receipts.iter().collect();
    assert_eq!(unique.len(), receipts.len());
}

#[test]
fn receipt_sequences_are_per_academic_year() {
    let workspace = temp_dir("schooldesk-receipts-per-year");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (_class_id, student_id) = setup_class_with_student(&mut stdin, &mut reader, &workspace);

    let a = record(&mut stdin, &mut reader, "1", &student_id, "2024-25");
    let b = record(&mut stdin, &mut reader, "2", &student_id, "2025-26");

    assert_eq!(
        a.get("receiptNumber").and_then(|v| v.as_str()),
        Some("2024-25-000001")
    );
    assert_eq!(
        b.get("receiptNumber").and_then(|v| v.as_str()),
        Some("2025-26-000001")
    );
}

#[test]
fn deleted_receipts_are_never_recycled() {
    let workspace = temp_dir("schooldesk-receipts-norecycle");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (_class_id, student_id) = setup_class_with_student(&mut stdin, &mut reader, &workspace);

    let first = record(&mut stdin, &mut reader, "1", &student_id, "2025-26");
    let transaction_id = first
        .get("transactionId")
        .and_then(|v| v.as_str())
        .expect("transactionId")
        .to_string();
    assert_eq!(
        first.get("receiptNumber").and_then(|v| v.as_str()),
        Some("2025-26-000001")
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "fees.deletePayment",
        json!({ "transactionId": transaction_id }),
    );

    let second = record(&mut stdin, &mut reader, "3", &student_id, "2025-26");
    assert_eq!(
        second.get("receiptNumber").and_then(|v| v.as_str()),
        Some("2025-26-000002")
    );
}
