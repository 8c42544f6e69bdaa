use crate::auth::{Role, Session};
use crate::calc::{self, GradeInput};
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    check_date_range, fmt_date, get_optional_bool, get_optional_i64, get_optional_str,
    get_required_bool, get_required_date, get_required_str, group_names, is_period_open, name_of,
    name_or_id, parse_date, require_row, require_teaching_access, require_user_with_role,
    student_in_group, subject_names, user_names, with_session,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// Row filter shared by grade summaries, final grades and the grade export.
#[derive(Debug, Clone, Default)]
pub struct GradeScope {
    pub group_id: Option<String>,
    pub subject_id: Option<String>,
    pub student_id: Option<String>,
    /// Restricts to (subject, group) pairs this teacher is assigned to.
    pub teacher_id: Option<String>,
}

impl GradeScope {
    pub fn from_params(params: &serde_json::Value) -> Self {
        Self {
            group_id: get_optional_str(params, "groupId"),
            subject_id: get_optional_str(params, "subjectId"),
            student_id: get_optional_str(params, "studentId"),
            teacher_id: None,
        }
    }

    /// Narrows the scope to what the session may see.
    pub fn restrict_to(mut self, session: &Session) -> Result<Self, HandlerErr> {
        match session.role {
            Role::SuperAdmin | Role::AcademicAdvisor => {}
            Role::Teacher => self.teacher_id = Some(session.user_id.clone()),
            Role::Student => {
                if self.student_id.as_deref().is_some_and(|s| s != session.user_id) {
                    return Err(session.forbid("view other students' grades").into());
                }
                self.student_id = Some(session.user_id.clone());
            }
        }
        Ok(self)
    }

    /// `alias` names the table carrying group_id/subject_id; `student_col` the student column.
    fn push_clauses(
        &self,
        alias: &str,
        student_col: &str,
        clauses: &mut Vec<String>,
        binds: &mut Vec<Value>,
    ) {
        if let Some(g) = &self.group_id {
            clauses.push(format!("{alias}.group_id = ?"));
            binds.push(Value::Text(g.clone()));
        }
        if let Some(s) = &self.subject_id {
            clauses.push(format!("{alias}.subject_id = ?"));
            binds.push(Value::Text(s.clone()));
        }
        if let Some(s) = &self.student_id {
            clauses.push(format!("{student_col} = ?"));
            binds.push(Value::Text(s.clone()));
        }
        if let Some(t) = &self.teacher_id {
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM teacher_assignments ta WHERE ta.teacher_id = ?
                    AND ta.subject_id = {alias}.subject_id AND ta.group_id = {alias}.group_id)"
            ));
            binds.push(Value::Text(t.clone()));
        }
    }
}

fn where_clause(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    }
}

/// One input per (active assignment, enrolled student); missing submissions score `None`.
pub fn load_grade_inputs(
    conn: &Connection,
    scope: &GradeScope,
) -> Result<Vec<GradeInput>, HandlerErr> {
    let mut clauses = vec!["a.is_active = 1".to_string()];
    let mut binds: Vec<Value> = Vec::new();
    scope.push_clauses("a", "gs.student_id", &mut clauses, &mut binds);
    let sql = format!(
        "SELECT gs.student_id, a.subject_id, a.group_id, a.max_score, s.score
         FROM assignments a
         JOIN group_students gs ON gs.group_id = a.group_id
         LEFT JOIN submissions s ON s.assignment_id = a.id AND s.student_id = gs.student_id
         {}",
        where_clause(&clauses)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds.iter()), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, f64>(3)?,
                r.get::<_, Option<f64>>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let users = user_names(conn)?;
    let subjects = subject_names(conn)?;
    let groups = group_names(conn)?;
    Ok(rows
        .into_iter()
        .map(|(student_id, subject_id, group_id, max_score, score)| GradeInput {
            student_name: name_or_id(&users, &student_id),
            subject_name: name_or_id(&subjects, &subject_id),
            group_name: name_or_id(&groups, &group_id),
            student_id,
            subject_id,
            group_id,
            score,
            max_score,
        })
        .collect())
}

fn grades_summary(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let scope = GradeScope::from_params(params).restrict_to(session)?;
    let inputs = load_grade_inputs(conn, &scope)?;
    let rows = calc::aggregate_grades(&inputs);
    let distribution = calc::grade_distribution(&rows);
    Ok(json!({ "rows": rows, "distribution": distribution }))
}

fn grades_student(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = match session.role {
        Role::Student => session.user_id.clone(),
        _ => get_required_str(params, "studentId")?,
    };
    let student = require_user_with_role(conn, &student_id, Role::Student)?;
    let scope = GradeScope {
        student_id: Some(student_id.clone()),
        ..GradeScope::default()
    }
    .restrict_to(session)?;

    let subjects = calc::aggregate_grades(&load_grade_inputs(conn, &scope)?);
    let distribution = calc::grade_distribution(&subjects);

    let mut clauses = vec!["a.is_active = 1".to_string()];
    let mut binds: Vec<Value> = Vec::new();
    scope.push_clauses("a", "gs.student_id", &mut clauses, &mut binds);
    let sql = format!(
        "SELECT a.id, a.title, a.subject_id, a.group_id, a.max_score, a.due_date,
                s.id, s.score, s.feedback, s.submitted_at, s.graded_at
         FROM assignments a
         JOIN group_students gs ON gs.group_id = a.group_id
         LEFT JOIN submissions s ON s.assignment_id = a.id AND s.student_id = gs.student_id
         {}
         ORDER BY a.due_date IS NULL, a.due_date, a.title",
        where_clause(&clauses)
    );
    let subject_map = subject_names(conn)?;
    let group_map = group_names(conn)?;
    let mut stmt = conn.prepare(&sql)?;
    let assignments = stmt
        .query_map(params_from_iter(binds.iter()), |r| {
            let subject_id: String = r.get(2)?;
            let group_id: String = r.get(3)?;
            let max_score: f64 = r.get(4)?;
            let submission_id: Option<String> = r.get(6)?;
            let score: Option<f64> = r.get(7)?;
            let status = match (&submission_id, score) {
                (None, _) => "pending",
                (Some(_), None) => "submitted",
                (Some(_), Some(_)) => "graded",
            };
            Ok(json!({
                "assignmentId": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "subjectId": subject_id,
                "subjectName": name_of(&subject_map, &subject_id),
                "groupId": group_id,
                "groupName": name_of(&group_map, &group_id),
                "maxScore": max_score,
                "dueDate": r.get::<_, Option<String>>(5)?,
                "submissionId": submission_id,
                "score": score,
                "percentage": calc::submission_percentage(score, max_score).map(calc::round2),
                "feedback": r.get::<_, Option<String>>(8)?,
                "submittedAt": r.get::<_, Option<String>>(9)?,
                "gradedAt": r.get::<_, Option<String>>(10)?,
                "status": status,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({
        "student": { "id": student.id, "name": student.display_name() },
        "subjects": subjects,
        "assignments": assignments,
        "overallAverage": distribution.overall_average,
    }))
}

const PERIOD_COLUMNS: &str = "id, name, start_date, end_date, is_active, created_at, updated_at";

fn map_period(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let start: String = r.get(2)?;
    let end: String = r.get(3)?;
    let is_active = r.get::<_, i64>(4)? != 0;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "startDate": start,
        "endDate": end,
        "isActive": is_active,
        "isOpen": is_period_open(&start, &end, is_active, db::today()),
        "createdAt": r.get::<_, String>(5)?,
        "updatedAt": r.get::<_, String>(6)?,
    }))
}

fn fetch_period(conn: &Connection, period_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let sql = format!("SELECT {} FROM grading_periods WHERE id = ?", PERIOD_COLUMNS);
    conn.query_row(&sql, [period_id], map_period)
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("grading period"))
}

fn list_periods(
    conn: &Connection,
    include_inactive: bool,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let sql = format!(
        "SELECT {} FROM grading_periods {} ORDER BY start_date DESC, name",
        PERIOD_COLUMNS,
        if include_inactive { "" } else { "WHERE is_active = 1" }
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], map_period)?.collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn grading_periods_list(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let periods = list_periods(conn, get_optional_bool(params, "includeInactive"))?;
    Ok(json!({ "gradingPeriods": periods }))
}

fn grading_periods_current(
    conn: &Connection,
    _session: &Session,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let open: Vec<serde_json::Value> = list_periods(conn, false)?
        .into_iter()
        .filter(|p| p["isOpen"].as_bool() == Some(true))
        .collect();
    Ok(json!({ "gradingPeriods": open }))
}

fn grading_periods_create(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("create grading periods")?;
    let name = get_required_str(params, "name")?;
    let start = get_required_date(params, "startDate")?;
    let end = get_required_date(params, "endDate")?;
    check_date_range(start, end)?;
    let id = Uuid::new_v4().to_string();
    let now = db::now_ts();
    conn.execute(
        "INSERT INTO grading_periods(id, name, start_date, end_date, is_active,
            created_at, updated_at)
         VALUES(?, ?, ?, ?, 1, ?, ?)",
        (&id, &name, fmt_date(start), fmt_date(end), &now, &now),
    )
    .map_err(|e| HandlerErr::db_insert("grading_periods", e))?;
    Ok(json!({ "gradingPeriod": fetch_period(conn, &id)? }))
}

fn grading_periods_update(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("edit grading periods")?;
    let period_id = get_required_str(params, "gradingPeriodId")?;
    let current = fetch_period(conn, &period_id)?;
    let cur_start = current["startDate"].as_str().unwrap_or_default();
    let cur_end = current["endDate"].as_str().unwrap_or_default();
    let start = match get_optional_str(params, "startDate") {
        Some(raw) => parse_date(&raw, "startDate")?,
        None => parse_date(cur_start, "startDate")?,
    };
    let end = match get_optional_str(params, "endDate") {
        Some(raw) => parse_date(&raw, "endDate")?,
        None => parse_date(cur_end, "endDate")?,
    };
    check_date_range(start, end)?;
    let name = get_optional_str(params, "name")
        .unwrap_or_else(|| current["name"].as_str().unwrap_or_default().to_string());
    conn.execute(
        "UPDATE grading_periods SET name = ?, start_date = ?, end_date = ?, updated_at = ?
         WHERE id = ?",
        (&name, fmt_date(start), fmt_date(end), db::now_ts(), &period_id),
    )
    .map_err(|e| HandlerErr::db_update("grading_periods", e))?;
    Ok(json!({ "gradingPeriod": fetch_period(conn, &period_id)? }))
}

fn grading_periods_set_active(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("change grading period activation")?;
    let period_id = get_required_str(params, "gradingPeriodId")?;
    let is_active = get_required_bool(params, "isActive")?;
    let n = conn
        .execute(
            "UPDATE grading_periods SET is_active = ?, updated_at = ? WHERE id = ?",
            (is_active as i64, db::now_ts(), &period_id),
        )
        .map_err(|e| HandlerErr::db_update("grading_periods", e))?;
    if n == 0 {
        return Err(HandlerErr::not_found("grading period"));
    }
    Ok(json!({ "gradingPeriod": fetch_period(conn, &period_id)? }))
}

fn grading_periods_delete(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("delete grading periods")?;
    let period_id = get_required_str(params, "gradingPeriodId")?;
    fetch_period(conn, &period_id)?;
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM final_grades WHERE grading_period_id = ?",
        [&period_id],
        |r| r.get(0),
    )?;
    if n > 0 {
        return Err(HandlerErr::in_use("grading period has final grades; deactivate instead")
            .with_details(json!({ "finalGrades": n })));
    }
    conn.execute("DELETE FROM grading_periods WHERE id = ?", [&period_id])
        .map_err(|e| HandlerErr::db_update("grading_periods", e))?;
    Ok(json!({ "deleted": true }))
}

fn final_grades_list(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let scope = GradeScope::from_params(params).restrict_to(session)?;
    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(p) = get_optional_str(params, "gradingPeriodId") {
        clauses.push("f.grading_period_id = ?".to_string());
        binds.push(Value::Text(p));
    }
    scope.push_clauses("f", "f.student_id", &mut clauses, &mut binds);
    let sql = format!(
        "SELECT f.id, f.grading_period_id, p.name, f.student_id, f.subject_id, f.group_id,
                f.grade, f.comment, f.teacher_id, f.updated_at
         FROM final_grades f JOIN grading_periods p ON p.id = f.grading_period_id
         {}",
        where_clause(&clauses)
    );
    let users = user_names(conn)?;
    let subjects = subject_names(conn)?;
    let groups = group_names(conn)?;
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query_map(params_from_iter(binds.iter()), |r| {
            let student_id: String = r.get(3)?;
            let subject_id: String = r.get(4)?;
            let group_id: String = r.get(5)?;
            let teacher_id: String = r.get(8)?;
            let grade: i64 = r.get(6)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "gradingPeriodId": r.get::<_, String>(1)?,
                "gradingPeriodName": r.get::<_, String>(2)?,
                "studentId": student_id,
                "studentName": name_of(&users, &student_id),
                "subjectId": subject_id,
                "subjectName": name_of(&subjects, &subject_id),
                "groupId": group_id,
                "groupName": name_of(&groups, &group_id),
                "grade": grade,
                "gradeLabel": calc::LetterGrade::from_points(grade).map(calc::LetterGrade::label),
                "comment": r.get::<_, Option<String>>(7)?,
                "teacherId": teacher_id,
                "teacherName": name_of(&users, &teacher_id),
                "updatedAt": r.get::<_, String>(9)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    rows.sort_by(|a, b| {
        let key = |v: &serde_json::Value, k: &str| v[k].as_str().unwrap_or("").to_string();
        key(a, "studentName")
            .cmp(&key(b, "studentName"))
            .then_with(|| key(a, "subjectName").cmp(&key(b, "subjectName")))
    });
    Ok(json!({ "finalGrades": rows }))
}

fn final_grades_set(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let period_id = get_required_str(params, "gradingPeriodId")?;
    let student_id = get_required_str(params, "studentId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let group_id = get_required_str(params, "groupId")?;
    let grade = get_optional_i64(params, "grade")?
        .ok_or_else(|| HandlerErr::bad_params("missing grade"))?;
    let comment = get_optional_str(params, "comment");

    if calc::LetterGrade::from_points(grade).is_none() {
        return Err(HandlerErr::bad_params("grade must be between 2 and 5"));
    }
    require_row(conn, "subjects", &subject_id, "subject")?;
    require_row(conn, "study_groups", &group_id, "group")?;
    require_teaching_access(conn, session, &subject_id, &group_id, "set final grades here")?;
    if !student_in_group(conn, &student_id, &group_id)? {
        return Err(HandlerErr::bad_params("student is not a member of this group"));
    }
    let period = fetch_period(conn, &period_id)?;
    if period["isOpen"].as_bool() != Some(true) {
        return Err(HandlerErr::new("period_closed", "grading period is not open")
            .with_details(json!({
                "gradingPeriodId": period_id,
                "startDate": period["startDate"],
                "endDate": period["endDate"],
            })));
    }

    let now = db::now_ts();
    conn.execute(
        "INSERT INTO final_grades(id, grading_period_id, student_id, subject_id, group_id,
            grade, comment, teacher_id, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(grading_period_id, student_id, subject_id, group_id) DO UPDATE SET
            grade = excluded.grade,
            comment = excluded.comment,
            teacher_id = excluded.teacher_id,
            updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &period_id,
            &student_id,
            &subject_id,
            &group_id,
            grade,
            &comment,
            &session.user_id,
            &now,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::db_insert("final_grades", e))?;
    let id: String = conn.query_row(
        "SELECT id FROM final_grades
         WHERE grading_period_id = ? AND student_id = ? AND subject_id = ? AND group_id = ?",
        (&period_id, &student_id, &subject_id, &group_id),
        |r| r.get(0),
    )?;
    Ok(json!({ "finalGradeId": id, "grade": grade }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.summary" => Some(with_session(state, req, grades_summary)),
        "grades.student" => Some(with_session(state, req, grades_student)),
        "gradingPeriods.list" => Some(with_session(state, req, grading_periods_list)),
        "gradingPeriods.current" => Some(with_session(state, req, grading_periods_current)),
        "gradingPeriods.create" => Some(with_session(state, req, grading_periods_create)),
        "gradingPeriods.update" => Some(with_session(state, req, grading_periods_update)),
        "gradingPeriods.setActive" => Some(with_session(state, req, grading_periods_set_active)),
        "gradingPeriods.delete" => Some(with_session(state, req, grading_periods_delete)),
        "finalGrades.list" => Some(with_session(state, req, final_grades_list)),
        "finalGrades.set" => Some(with_session(state, req, final_grades_set)),
        _ => None,
    }
}
