use crate::auth::{Role, Session};
use crate::calc::{self, AttendanceInput, AttendanceStatus};
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    check_date_range, fmt_date, get_optional_date, get_optional_str, get_required_date,
    get_required_str, name_of, name_or_id, require_row, require_teaching_access,
    student_in_group, subject_names, teaches, teaches_group, user_names, with_session,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug)]
struct AttendanceEntry {
    student_id: String,
    status: AttendanceStatus,
}

fn parse_entries(params: &serde_json::Value) -> Result<Vec<AttendanceEntry>, HandlerErr> {
    let Some(arr) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing entries"));
    };
    let mut out = Vec::with_capacity(arr.len());
    let mut seen = HashSet::new();
    for (i, e) in arr.iter().enumerate() {
        let student_id = get_required_str(e, "studentId")
            .map_err(|_| HandlerErr::bad_params(format!("entries[{}].studentId missing", i)))?;
        let raw = e
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerErr::bad_params(format!("entries[{}].status missing", i)))?;
        let status: AttendanceStatus = raw.parse().map_err(HandlerErr::bad_params)?;
        if !seen.insert(student_id.clone()) {
            return Err(HandlerErr::bad_params(format!(
                "student {} appears twice in entries",
                student_id
            )));
        }
        out.push(AttendanceEntry { student_id, status });
    }
    Ok(out)
}

fn attendance_record(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let group_id = get_required_str(params, "groupId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let lesson_date = fmt_date(get_required_date(params, "lessonDate")?);
    let entries = parse_entries(params)?;
    require_row(conn, "study_groups", &group_id, "group")?;
    require_row(conn, "subjects", &subject_id, "subject")?;
    require_teaching_access(conn, session, &subject_id, &group_id, "record attendance here")?;

    let mut outsiders: Vec<&str> = Vec::new();
    for e in &entries {
        if !student_in_group(conn, &e.student_id, &group_id)? {
            outsiders.push(&e.student_id);
        }
    }
    if !outsiders.is_empty() {
        return Err(HandlerErr::bad_params("students are not members of this group")
            .with_details(json!({ "studentIds": outsiders })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let now = db::now_ts();
    {
        let mut stmt = tx
            .prepare(
                "INSERT INTO attendance(id, group_id, subject_id, teacher_id, lesson_date,
                    student_id,
                    status, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(group_id, subject_id, lesson_date, student_id) DO UPDATE SET
                    status = excluded.status,
                    teacher_id = excluded.teacher_id,
                    updated_at = excluded.updated_at",
            )
            .map_err(|e| HandlerErr::db_insert("attendance", e))?;
        for e in &entries {
            stmt.execute((
                Uuid::new_v4().to_string(),
                &group_id,
                &subject_id,
                &session.user_id,
                &lesson_date,
                &e.student_id,
                e.status.as_str(),
                &now,
                &now,
            ))
            .map_err(|err| HandlerErr::db_insert("attendance", err))?;
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    tracing::debug!(
        group_id = %group_id,
        lesson_date = %lesson_date,
        saved = entries.len(),
        "attendance recorded"
    );
    Ok(json!({ "saved": entries.len(), "lessonDate": lesson_date }))
}

/// Who may read a group's attendance. Returns the student id to restrict to, if any.
fn read_scope(
    conn: &Connection,
    session: &Session,
    group_id: &str,
    subject_id: Option<&str>,
) -> Result<Option<String>, HandlerErr> {
    match session.role {
        Role::SuperAdmin | Role::AcademicAdvisor => Ok(None),
        Role::Teacher => {
            let allowed = match subject_id {
                Some(s) => teaches(conn, &session.user_id, s, group_id)?,
                None => teaches_group(conn, &session.user_id, group_id)?,
            };
            if allowed {
                Ok(None)
            } else {
                Err(session.forbid("view attendance of this group").into())
            }
        }
        Role::Student => {
            if student_in_group(conn, &session.user_id, group_id)? {
                Ok(Some(session.user_id.clone()))
            } else {
                Err(session.forbid("view attendance of this group").into())
            }
        }
    }
}

struct AttendanceQuery {
    group_id: String,
    subject_id: Option<String>,
    student_id: Option<String>,
    from: Option<String>,
    to: Option<String>,
}

impl AttendanceQuery {
    fn from_params(
        conn: &Connection,
        session: &Session,
        params: &serde_json::Value,
    ) -> Result<Self, HandlerErr> {
        let group_id = get_required_str(params, "groupId")?;
        require_row(conn, "study_groups", &group_id, "group")?;
        let subject_id = get_optional_str(params, "subjectId");
        let from = get_optional_date(params, "from")?;
        let to = get_optional_date(params, "to")?;
        if let (Some(f), Some(t)) = (from, to) {
            check_date_range(f, t)?;
        }
        let student_id = read_scope(conn, session, &group_id, subject_id.as_deref())?;
        Ok(Self {
            group_id,
            subject_id,
            student_id,
            from: from.map(fmt_date),
            to: to.map(fmt_date),
        })
    }

    fn rows(
        &self,
        conn: &Connection,
    ) -> Result<Vec<(String, String, String, String, String)>, HandlerErr> {
        let mut clauses = vec!["group_id = ?"];
        let mut binds = vec![Value::Text(self.group_id.clone())];
        for (col, v) in [
            ("subject_id = ?", &self.subject_id),
            ("student_id = ?", &self.student_id),
            ("lesson_date >= ?", &self.from),
            ("lesson_date <= ?", &self.to),
        ] {
            if let Some(v) = v {
                clauses.push(col);
                binds.push(Value::Text(v.clone()));
            }
        }
        let sql = format!(
            "SELECT id, subject_id, lesson_date, student_id, status FROM attendance WHERE {}
             ORDER BY lesson_date, student_id",
            clauses.join(" AND ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(binds.iter()), |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn attendance_list(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let q = AttendanceQuery::from_params(conn, session, params)?;
    let users = user_names(conn)?;
    let subjects = subject_names(conn)?;
    let records: Vec<serde_json::Value> = q
        .rows(conn)?
        .into_iter()
        .map(|(id, subject_id, lesson_date, student_id, status)| {
            json!({
                "id": id,
                "groupId": q.group_id,
                "subjectId": subject_id,
                "subjectName": name_of(&subjects, &subject_id),
                "lessonDate": lesson_date,
                "studentId": student_id,
                "studentName": name_of(&users, &student_id),
                "status": status,
            })
        })
        .collect();
    Ok(json!({ "records": records }))
}

/// Roster plus parsed records for `calc::attendance_summary`; shared with the CSV export.
pub fn load_attendance_report(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<calc::AttendanceReport, HandlerErr> {
    let q = AttendanceQuery::from_params(conn, session, params)?;
    let users = user_names(conn)?;
    let mut stmt = conn.prepare(
        "SELECT student_id FROM group_students WHERE group_id = ? ORDER BY sort_order, student_id",
    )?;
    let roster: Vec<(String, String)> = stmt
        .query_map([&q.group_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|sid| q.student_id.as_deref().map_or(true, |own| own == sid.as_str()))
        .map(|sid| {
            let name = name_or_id(&users, &sid);
            (sid, name)
        })
        .collect();

    let mut records = Vec::new();
    for (_, subject_id, lesson_date, student_id, status) in q.rows(conn)? {
        match status.parse::<AttendanceStatus>() {
            Ok(status) => records.push(AttendanceInput {
                student_id,
                subject_id,
                lesson_date,
                status,
            }),
            Err(e) => tracing::warn!(error = %e, "skipping attendance row with unknown status"),
        }
    }
    Ok(calc::attendance_summary(&roster, &records))
}

fn attendance_summary(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let report = load_attendance_report(conn, session, params)?;
    Ok(json!(report))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.record" => Some(with_session(state, req, attendance_record)),
        "attendance.list" => Some(with_session(state, req, attendance_list)),
        "attendance.summary" => Some(with_session(state, req, attendance_summary)),
        _ => None,
    }
}
