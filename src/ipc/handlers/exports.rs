use crate::auth::{Role, Session};
use crate::calc::{self, AttendanceBucket};
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::attendance::load_attendance_report;
use crate::ipc::handlers::grades::{load_grade_inputs, GradeScope};
use crate::ipc::helpers::{
    csv_quote, get_optional_str, get_required_str, with_session, write_text_file,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn csv_line(cells: &[String]) -> String {
    let mut line = cells
        .iter()
        .map(|c| csv_quote(c))
        .collect::<Vec<_>>()
        .join(",");
    line.push_str("\r\n");
    line
}

fn opt_num(v: Option<f64>) -> String {
    v.map(|x| format!("{:.2}", x)).unwrap_or_default()
}

fn bucket_str(b: Option<AttendanceBucket>) -> &'static str {
    match b {
        Some(AttendanceBucket::High) => "high",
        Some(AttendanceBucket::Medium) => "medium",
        Some(AttendanceBucket::Low) => "low",
        None => "",
    }
}

fn finish(out_path: &str, text: &str, row_count: usize) -> Result<serde_json::Value, HandlerErr> {
    write_text_file(out_path, text)?;
    tracing::info!(path = %out_path, rows = row_count, "csv exported");
    Ok(json!({ "path": out_path, "rowCount": row_count }))
}

fn exports_grades_csv(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_any(
        &[Role::SuperAdmin, Role::AcademicAdvisor, Role::Teacher],
        "export grades",
    )?;
    let out_path = get_required_str(params, "outPath")?;
    let scope = GradeScope {
        group_id: get_optional_str(params, "groupId"),
        subject_id: get_optional_str(params, "subjectId"),
        ..GradeScope::default()
    }
    .restrict_to(session)?;
    let rows = calc::aggregate_grades(&load_grade_inputs(conn, &scope)?);

    let mut text = csv_line(&[
        "Group".into(),
        "Student".into(),
        "Subject".into(),
        "Graded".into(),
        "Pending".into(),
        "Average %".into(),
        "Grade".into(),
        "Points".into(),
    ]);
    for r in &rows {
        text.push_str(&csv_line(&[
            r.group_name.clone(),
            r.student_name.clone(),
            r.subject_name.clone(),
            r.graded_count.to_string(),
            r.pending_count.to_string(),
            opt_num(r.average_percentage),
            r.grade_label.unwrap_or_default().to_string(),
            r.grade_points.map(|p| p.to_string()).unwrap_or_default(),
        ]));
    }
    finish(&out_path, &text, rows.len())
}

fn exports_attendance_csv(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_any(
        &[Role::SuperAdmin, Role::AcademicAdvisor, Role::Teacher],
        "export attendance",
    )?;
    let out_path = get_required_str(params, "outPath")?;
    let report = load_attendance_report(conn, session, params)?;

    let mut text = csv_line(&[
        "Student".into(),
        "Lessons".into(),
        "Present".into(),
        "Late".into(),
        "Absent".into(),
        "Excused".into(),
        "Attendance %".into(),
        "Level".into(),
    ]);
    for s in &report.students {
        text.push_str(&csv_line(&[
            s.student_name.clone(),
            s.total_lessons.to_string(),
            s.present_count.to_string(),
            s.late_count.to_string(),
            s.absent_count.to_string(),
            s.excused_count.to_string(),
            opt_num(s.percentage),
            bucket_str(s.bucket).to_string(),
        ]));
    }
    finish(&out_path, &text, report.students.len())
}

fn exports_users_csv(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("export users")?;
    let out_path = get_required_str(params, "outPath")?;
    let role: Option<Role> = get_optional_str(params, "role")
        .map(|r| r.parse())
        .transpose()?;

    let mut stmt = conn.prepare(
        "SELECT last_name, first_name, middle_name, email, role, is_active, created_at
         FROM users
         WHERE (?1 IS NULL OR role = ?1)
         ORDER BY last_name COLLATE NOCASE, first_name COLLATE NOCASE",
    )?;
    let rows = stmt
        .query_map([role.map(Role::as_str)], |r| {
            Ok([
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?.unwrap_or_default(),
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                (if r.get::<_, i64>(5)? != 0 { "yes" } else { "no" }).to_string(),
                r.get::<_, String>(6)?,
            ])
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut text = csv_line(&[
        "Last name".into(),
        "First name".into(),
        "Middle name".into(),
        "Email".into(),
        "Role".into(),
        "Active".into(),
        "Created".into(),
    ]);
    for r in &rows {
        text.push_str(&csv_line(r));
    }
    finish(&out_path, &text, rows.len())
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exports.gradesCsv" => Some(with_session(state, req, exports_grades_csv)),
        "exports.attendanceCsv" => Some(with_session(state, req, exports_attendance_csv)),
        "exports.usersCsv" => Some(with_session(state, req, exports_users_csv)),
        _ => None,
    }
}
