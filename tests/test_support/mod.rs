#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

pub const PASSWORD: &str = "secret-pass";

pub fn temp_dir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("campusd-test-")
        .tempdir()
        .expect("create temp dir")
}

/// `YYYY-MM-DD` for today (UTC) shifted by `days`.
pub fn day(days: i64) -> String {
    (chrono::Utc::now().date_naive() + chrono::Duration::days(days))
        .format("%Y-%m-%d")
        .to_string()
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_campusd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn campusd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn read_response(reader: &mut BufReader<ChildStdout>, method: &str) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    serde_json::from_str(line.trim()).expect("parse response json")
}

pub fn request(
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

    let value = read_response(reader, method);
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        assert_ne!(
            error_code(&value),
            "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

pub fn error_code(response: &serde_json::Value) -> String {
    response
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string()
}

pub fn request_ok(
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
        value.get("error").cloned().unwrap_or_default()
    );
    value.get("result").cloned().unwrap_or_default()
}

pub fn str_field(v: &serde_json::Value, pointer: &str) -> String {
    v.pointer(pointer)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing string at {} in {}", pointer, v))
        .to_string()
}

/// A running daemon with an open workspace and a request counter.
pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    seq: u32,
}

impl Sidecar {
    pub fn start(workspace: &Path) -> Self {
        let (child, stdin, reader) = spawn_sidecar();
        let mut s = Sidecar {
            child,
            stdin,
            reader,
            seq: 0,
        };
        s.ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));
        s
    }

    fn next_id(&mut self) -> String {
        self.seq += 1;
        self.seq.to_string()
    }

    pub fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = self.next_id();
        request(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    pub fn ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = self.next_id();
        request_ok(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    /// Asserts the call fails and returns its error code.
    pub fn err(&mut self, method: &str, params: serde_json::Value) -> String {
        let value = self.call(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        error_code(&value)
    }

    pub fn send_raw(&mut self, line: &str) -> serde_json::Value {
        writeln!(self.stdin, "{}", line).expect("write raw line");
        self.stdin.flush().expect("flush raw line");
        read_response(&mut self.reader, "raw")
    }

    /// Creates the first super-admin (admin@campus.test) and leaves them logged in.
    pub fn bootstrap_admin(&mut self) -> String {
        let res = self.ok(
            "setup.bootstrap",
            json!({
                "email": "admin@campus.test",
                "password": PASSWORD,
                "firstName": "Ada",
                "lastName": "Admin"
            }),
        );
        str_field(&res, "/user/id")
    }

    pub fn create_user(&mut self, role: &str, email: &str, first: &str, last: &str) -> String {
        let res = self.ok(
            "users.create",
            json!({
                "role": role,
                "email": email,
                "password": PASSWORD,
                "firstName": first,
                "lastName": last
            }),
        );
        str_field(&res, "/user/id")
    }

    pub fn login(&mut self, email: &str) {
        self.ok("session.logout", json!({}));
        self.ok("session.login", json!({ "email": email, "password": PASSWORD }));
    }

    pub fn login_admin(&mut self) {
        self.login("admin@campus.test");
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Admin, one teacher, two enrolled students, one group and one subject the teacher covers.
pub struct Campus {
    pub admin_id: String,
    pub teacher_id: String,
    pub student_ids: Vec<String>,
    pub group_id: String,
    pub subject_id: String,
}

pub fn seed_campus(s: &mut Sidecar) -> Campus {
    let admin_id = s.bootstrap_admin();
    let teacher_id = s.create_user("teacher", "teacher@campus.test", "Tom", "Teach");
    let s1 = s.create_user("student", "s1@campus.test", "Sam", "Alpha");
    let s2 = s.create_user("student", "s2@campus.test", "Sue", "Beta");
    let group = s.ok(
        "groups.create",
        json!({ "name": "IS-21", "course": 2, "studentIds": [s1, s2] }),
    );
    let group_id = str_field(&group, "/group/id");
    let subject = s.ok("subjects.create", json!({ "name": "Mathematics", "code": "math" }));
    let subject_id = str_field(&subject, "/subject/id");
    s.ok(
        "teaching.assign",
        json!({ "teacherId": teacher_id, "subjectId": subject_id, "groupId": group_id }),
    );
    Campus {
        admin_id,
        teacher_id,
        student_ids: vec![s1, s2],
        group_id,
        subject_id,
    }
}
