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

fn spawn_daemon() -> (Child, ChildStdin, BufReader<ChildStdout>) {
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

fn result_of(value: &serde_json::Value, method: &str) -> serde_json::Value {
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().expect("result")
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("schoold-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_daemon();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let account = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "3",
            "accounts.create",
            json!({
                "name": "Smoke Admin",
                "email": "admin@smoke.test",
                "role": "admin",
                "password": "hunter2"
            }),
        ),
        "accounts.create",
    );
    let account_id = account["id"].as_str().expect("account id").to_string();

    let _ = request(&mut stdin, &mut reader, "4", "accounts.list", json!({}));
    let verified = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "5",
            "accounts.verify",
            json!({ "email": "admin@smoke.test", "password": "hunter2" }),
        ),
        "accounts.verify",
    );
    assert_eq!(verified["valid"], json!(true));

    let class = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "6",
            "classes.create",
            json!({ "name": "Smoke Class" }),
        ),
        "classes.create",
    );
    let class_id = class["id"].as_str().expect("class id").to_string();
    let _ = request(&mut stdin, &mut reader, "7", "classes.list", json!({}));

    let batch = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "8",
            "batches.create",
            json!({ "classId": class_id, "name": "Morning" }),
        ),
        "batches.create",
    );
    let batch_id = batch["id"].as_str().expect("batch id").to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "9",
        "batches.list",
        json!({ "classId": class_id }),
    );

    let subject = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "10",
            "subjects.create",
            json!({ "name": "Mathematics" }),
        ),
        "subjects.create",
    );
    let subject_id = subject["id"].as_str().expect("subject id").to_string();
    let _ = request(&mut stdin, &mut reader, "11", "subjects.list", json!({}));

    let attendance = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "12",
            "attendance.create",
            json!({
                "classId": class_id,
                "batchId": batch_id,
                "date": "2025-09-01",
                "entries": [],
                "createdBy": account_id
            }),
        ),
        "attendance.create",
    );
    let attendance_id = attendance["id"].as_str().expect("attendance id").to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "attendance.list",
        json!({ "classId": class_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "attendance.get",
        json!({ "id": attendance_id, "populate": true }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "15",
        "attendance.update",
        json!({ "id": attendance_id, "patch": { "date": "2025-09-02" } }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "16",
        "attendance.stats",
        json!({ "classId": class_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "17",
        "attendance.deactivate",
        json!({ "id": attendance_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "18",
        "attendance.delete",
        json!({ "id": attendance_id }),
    );

    let homework = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "19",
            "homework.create",
            json!({
                "name": "Fractions worksheet",
                "classId": class_id,
                "subjectId": subject_id,
                "date": "2025-09-03",
                "createdBy": account_id
            }),
        ),
        "homework.create",
    );
    let homework_id = homework["id"].as_str().expect("homework id").to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "20",
        "homework.list",
        json!({ "classId": class_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "21",
        "homework.update",
        json!({ "id": homework_id, "patch": { "description": "pages 4-6" } }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "22",
        "homework.deactivate",
        json!({ "id": homework_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "23",
        "homework.delete",
        json!({ "id": homework_id }),
    );

    let student = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "24",
            "students.create",
            json!({
                "registrationId": "REG-0001",
                "firstName": "Smoke",
                "lastName": "Student",
                "classId": class_id,
                "batchId": batch_id,
                "admissionType": "recurring",
                "admissionFee": 500,
                "monthlyTuitionFee": 200,
                "courseFee": 0,
                "createdBy": account_id
            }),
        ),
        "students.create",
    );
    let student_id = student["id"].as_str().expect("student id").to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "25",
        "students.list",
        json!({ "classId": class_id, "populate": true }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "26",
        "students.update",
        json!({ "id": student_id, "patch": { "firstName": "Updated" } }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "27",
        "students.recordPayment",
        json!({ "id": student_id, "amount": 100 }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "28",
        "students.deactivate",
        json!({ "id": student_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "29",
        "students.delete",
        json!({ "id": student_id }),
    );

    let teacher = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "30",
            "teachers.create",
            json!({
                "firstName": "Pat",
                "lastName": "Teacher",
                "email": "pat@smoke.test",
                "systemEmail": "pat@school.smoke.test",
                "nationalId": "NID-1",
                "createdBy": account_id
            }),
        ),
        "teachers.create",
    );
    let teacher_id = teacher["id"].as_str().expect("teacher id").to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "31",
        "teachers.list",
        json!({}),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "32",
        "teachers.update",
        json!({ "id": teacher_id, "patch": { "designation": "Senior" } }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "33",
        "teachers.deactivate",
        json!({ "id": teacher_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "34",
        "teachers.delete",
        json!({ "id": teacher_id }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn oversized_page_number_is_rejected_and_the_daemon_keeps_serving() {
    let workspace = temp_dir("schoold-page-bound");
    let (mut child, mut stdin, mut reader) = spawn_daemon();

    let _ = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "1",
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        ),
        "workspace.select",
    );

    let listed = request(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.list",
        json!({ "page": i64::MAX, "pageSize": 100 }),
    );
    assert_eq!(listed.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(listed["error"]["code"], json!("invalid_argument"));

    // The process must survive the rejected request.
    let health = request(&mut stdin, &mut reader, "3", "health", json!({}));
    assert_eq!(health.get("ok").and_then(|v| v.as_bool()), Some(true));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
