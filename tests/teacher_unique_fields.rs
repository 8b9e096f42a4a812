//! Teachers carry three unique fields that collide independently: email,
//! system email, national id. A conflict names the field that clashed.

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
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
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

fn error(value: &serde_json::Value) -> serde_json::Value {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    value.get("error").cloned().expect("error")
}

fn setup(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> String {
    let _ = result_of(
        &request(
            stdin,
            reader,
            "setup-ws",
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        ),
        "workspace.select",
    );
    let account = result_of(
        &request(
            stdin,
            reader,
            "setup-account",
            "accounts.create",
            json!({
                "name": "Head",
                "email": "head@test.local",
                "role": "admin",
                "password": "pw"
            }),
        ),
        "accounts.create",
    );
    account["id"].as_str().unwrap().to_string()
}

fn teacher_params(
    account_id: &str,
    email: &str,
    system_email: &str,
    national_id: &str,
) -> serde_json::Value {
    json!({
        "firstName": "Kim",
        "lastName": "Rahman",
        "email": email,
        "systemEmail": system_email,
        "nationalId": national_id,
        "createdBy": account_id
    })
}

#[test]
fn each_unique_field_collides_independently() {
    let workspace = temp_dir("schoold-teachers-unique");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let account_id = setup(&mut stdin, &mut reader, &workspace);

    let _ = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "1",
            "teachers.create",
            teacher_params(&account_id, "kim@example.com", "kim@school.example", "NID-100"),
        ),
        "teachers.create",
    );

    let cases = [
        ("2", "kim@example.com", "other@school.example", "NID-101", "email"),
        ("3", "other@example.com", "kim@school.example", "NID-102", "systemEmail"),
        ("4", "another@example.com", "another@school.example", "NID-100", "nationalId"),
    ];
    for (id, email, system_email, national_id, field) in cases {
        let resp = request(
            &mut stdin,
            &mut reader,
            id,
            "teachers.create",
            teacher_params(&account_id, email, system_email, national_id),
        );
        let e = error(&resp);
        assert_eq!(e["code"], json!("duplicate_key"), "field {}", field);
        let detail_key = e["details"]["key"].as_str().unwrap_or_default().to_string();
        assert!(
            detail_key.starts_with(&format!("{}=", field)),
            "expected conflict on {}, got {}",
            field,
            detail_key
        );
    }

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn email_comparison_is_case_insensitive() {
    let workspace = temp_dir("schoold-teachers-case");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let account_id = setup(&mut stdin, &mut reader, &workspace);

    let created = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "1",
            "teachers.create",
            teacher_params(&account_id, "Kim@Example.COM", "kim@school.example", "NID-200"),
        ),
        "teachers.create",
    );
    assert_eq!(created["email"], json!("kim@example.com"));

    let shouting = request(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.create",
        teacher_params(&account_id, "KIM@EXAMPLE.COM", "kim2@school.example", "NID-201"),
    );
    assert_eq!(error(&shouting)["code"], json!("duplicate_key"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn update_keeping_own_fields_succeeds_and_stealing_anothers_fails() {
    let workspace = temp_dir("schoold-teachers-update");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let account_id = setup(&mut stdin, &mut reader, &workspace);

    let first = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "1",
            "teachers.create",
            teacher_params(&account_id, "a@example.com", "a@school.example", "NID-300"),
        ),
        "teachers.create",
    );
    let first_id = first["id"].as_str().unwrap().to_string();
    let second = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "2",
            "teachers.create",
            teacher_params(&account_id, "b@example.com", "b@school.example", "NID-301"),
        ),
        "teachers.create",
    );
    let second_id = second["id"].as_str().unwrap().to_string();

    // Changing unrelated fields re-checks the teacher's own keys without
    // tripping over its own row.
    let renamed = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "3",
            "teachers.update",
            json!({ "id": first_id, "patch": { "designation": "Senior Lecturer" } }),
        ),
        "teachers.update",
    );
    assert_eq!(renamed["designation"], json!("Senior Lecturer"));

    let stolen = request(
        &mut stdin,
        &mut reader,
        "4",
        "teachers.update",
        json!({ "id": second_id, "patch": { "email": "a@example.com" } }),
    );
    assert_eq!(error(&stolen)["code"], json!("duplicate_key"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn joining_date_is_normalized_on_create_and_update() {
    let workspace = temp_dir("schoold-teachers-joining");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let account_id = setup(&mut stdin, &mut reader, &workspace);

    let mut params = teacher_params(&account_id, "c@example.com", "c@school.example", "NID-400");
    params["joiningDate"] = json!("2024-01-15T09:00:00");
    let created = result_of(
        &request(&mut stdin, &mut reader, "1", "teachers.create", params),
        "teachers.create",
    );
    assert_eq!(created["joiningDate"], json!("2024-01-15"));

    let teacher_id = created["id"].as_str().unwrap().to_string();
    let cleared = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "2",
            "teachers.update",
            json!({ "id": teacher_id, "patch": { "joiningDate": null } }),
        ),
        "teachers.update",
    );
    assert!(cleared["joiningDate"].is_null());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
