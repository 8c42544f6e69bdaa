mod test_support;

use serde_json::json;
use test_support::{error_code, request, spawn_sidecar, temp_dir, Sidecar};

#[test]
fn requests_before_workspace_selection_report_no_workspace() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["ok"], json!(true));
    assert_eq!(health["result"]["authenticated"], json!(false));
    assert!(health["result"]["workspacePath"].is_null());

    let status = request(&mut stdin, &mut reader, "2", "setup.status", json!({}));
    assert_eq!(status["result"]["workspaceOpen"], json!(false));

    let users = request(&mut stdin, &mut reader, "3", "users.list", json!({}));
    assert_eq!(error_code(&users), "no_workspace");

    let missing = request(&mut stdin, &mut reader, "4", "workspace.select", json!({}));
    assert_eq!(error_code(&missing), "bad_params");
}

#[test]
fn malformed_lines_and_unknown_methods_get_error_envelopes() {
    let workspace = temp_dir();
    let mut s = Sidecar::start(workspace.path());

    let bad = s.send_raw("{ this is not json");
    assert_eq!(bad["ok"], json!(false));
    assert_eq!(error_code(&bad), "bad_json");

    // The daemon keeps serving after a bad line.
    let health = s.ok("health", json!({}));
    assert_eq!(health["authenticated"], json!(false));

    let unknown = s.send_raw(r#"{"id":"u1","method":"nope.nothing","params":{}}"#);
    assert_eq!(unknown["id"], json!("u1"));
    assert_eq!(error_code(&unknown), "not_implemented");
}

#[test]
fn bootstrap_runs_once_and_gates_every_family_behind_login() {
    let workspace = temp_dir();
    let mut s = Sidecar::start(workspace.path());

    assert_eq!(s.err("users.list", json!({})), "unauthenticated");
    assert_eq!(s.err("dashboard.stats", json!({})), "unauthenticated");

    let status = s.ok("setup.status", json!({}));
    assert_eq!(status["needsBootstrap"], json!(true));

    s.bootstrap_admin();
    let status = s.ok("setup.status", json!({}));
    assert_eq!(status["needsBootstrap"], json!(false));
    let current = s.ok("session.current", json!({}));
    assert_eq!(current["user"]["role"], json!("super-admin"));

    assert_eq!(
        s.err(
            "setup.bootstrap",
            json!({
                "email": "second@campus.test",
                "password": "another-pass",
                "firstName": "Second",
                "lastName": "Admin"
            })
        ),
        "conflict"
    );
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir();
    let mut s = Sidecar::start(workspace.path());
    s.bootstrap_admin();

    let methods = [
        "users.list",
        "users.get",
        "users.create",
        "users.update",
        "users.setActive",
        "users.resetPassword",
        "users.delete",
        "groups.list",
        "groups.get",
        "groups.create",
        "groups.update",
        "groups.setActive",
        "groups.delete",
        "groups.setStudents",
        "groups.addStudent",
        "groups.removeStudent",
        "subjects.list",
        "subjects.create",
        "subjects.update",
        "subjects.setActive",
        "subjects.delete",
        "teaching.list",
        "teaching.assign",
        "teaching.unassign",
        "assignments.list",
        "assignments.get",
        "assignments.create",
        "assignments.update",
        "assignments.setActive",
        "assignments.delete",
        "submissions.list",
        "submissions.submit",
        "submissions.grade",
        "grades.summary",
        "grades.student",
        "gradingPeriods.list",
        "gradingPeriods.current",
        "gradingPeriods.create",
        "gradingPeriods.update",
        "gradingPeriods.setActive",
        "gradingPeriods.delete",
        "finalGrades.list",
        "finalGrades.set",
        "attendance.record",
        "attendance.list",
        "attendance.summary",
        "surveyPeriods.list",
        "surveyPeriods.current",
        "surveyPeriods.create",
        "surveyPeriods.update",
        "surveyPeriods.setActive",
        "surveyPeriods.delete",
        "surveyQuestions.list",
        "surveyQuestions.create",
        "surveyQuestions.update",
        "surveyQuestions.setActive",
        "surveyQuestions.delete",
        "surveyQuestions.reorder",
        "surveys.pending",
        "surveys.respond",
        "surveys.results",
        "settings.get",
        "settings.update",
        "settings.export",
        "settings.import",
        "exports.gradesCsv",
        "exports.attendanceCsv",
        "exports.usersCsv",
        "backup.exportWorkspace",
        "backup.importWorkspace",
        "dashboard.stats",
        "session.current",
        "session.changePassword",
    ];
    for method in methods {
        // `request` asserts the method is known; empty params may legitimately fail.
        let resp = s.call(method, json!({}));
        if resp["ok"] == json!(false) {
            let code = error_code(&resp);
            assert!(
                ["bad_params", "not_found", "forbidden"].contains(&code.as_str()),
                "{} returned unexpected {}",
                method,
                code
            );
        }
    }

    s.ok("session.logout", json!({}));
    assert_eq!(s.err("settings.get", json!({})), "unauthenticated");
}
