use crate::auth::{Role, Session};
use crate::calc;
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::grades::{load_grade_inputs, GradeScope};
use crate::ipc::handlers::surveys::open_survey_periods;
use crate::ipc::helpers::{fmt_date, is_period_open, with_session};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn scalar(conn: &Connection, sql: &str, param: Option<&str>) -> Result<i64, HandlerErr> {
    Ok(match param {
        Some(p) => conn.query_row(sql, [p], |r| r.get(0))?,
        None => conn.query_row(sql, [], |r| r.get(0))?,
    })
}

fn open_grading_period_count(conn: &Connection) -> Result<usize, HandlerErr> {
    let today = db::today();
    let mut stmt =
        conn.prepare("SELECT start_date, end_date FROM grading_periods WHERE is_active = 1")?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .iter()
        .filter(|(s, e)| is_period_open(s, e, true, today))
        .count())
}

fn admin_stats(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut per_role = serde_json::Map::new();
    for role in Role::ALL {
        let n = scalar(
            conn,
            "SELECT COUNT(*) FROM users WHERE role = ? AND is_active = 1",
            Some(role.as_str()),
        )?;
        per_role.insert(role.as_str().to_string(), json!(n));
    }
    Ok(json!({
        "usersByRole": per_role,
        "activeGroups": scalar(
            conn,
            "SELECT COUNT(*) FROM study_groups WHERE is_active = 1",
            None
        )?,
        "activeSubjects": scalar(conn, "SELECT COUNT(*) FROM subjects WHERE is_active = 1", None)?,
        "activeAssignments": scalar(
            conn,
            "SELECT COUNT(*) FROM assignments WHERE is_active = 1",
            None
        )?,
        "openGradingPeriods": open_grading_period_count(conn)?,
        "openSurveyPeriods": open_survey_periods(conn)?.len(),
    }))
}

fn teacher_stats(conn: &Connection, teacher_id: &str) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({
        "taughtGroups": scalar(
            conn,
            "SELECT COUNT(DISTINCT group_id) FROM teacher_assignments WHERE teacher_id = ?",
            Some(teacher_id),
        )?,
        "taughtSubjects": scalar(
            conn,
            "SELECT COUNT(DISTINCT subject_id) FROM teacher_assignments WHERE teacher_id = ?",
            Some(teacher_id),
        )?,
        "activeAssignments": scalar(
            conn,
            "SELECT COUNT(*) FROM assignments WHERE teacher_id = ? AND is_active = 1",
            Some(teacher_id),
        )?,
        "submissionsToGrade": scalar(
            conn,
            "SELECT COUNT(*) FROM submissions s JOIN assignments a ON a.id = s.assignment_id
             WHERE a.teacher_id = ? AND a.is_active = 1 AND s.score IS NULL",
            Some(teacher_id),
        )?,
    }))
}

fn student_stats(conn: &Connection, student_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let today = fmt_date(db::today());
    let due: i64 = conn.query_row(
        "SELECT COUNT(*) FROM assignments a
         JOIN group_students gs ON gs.group_id = a.group_id AND gs.student_id = ?1
         WHERE a.is_active = 1
           AND (a.due_date IS NULL OR a.due_date >= ?2)
           AND NOT EXISTS (SELECT 1 FROM submissions s
                           WHERE s.assignment_id = a.id AND s.student_id = ?1)",
        (student_id, &today),
        |r| r.get(0),
    )?;
    let submitted = scalar(
        conn,
        "SELECT COUNT(*) FROM submissions WHERE student_id = ?",
        Some(student_id),
    )?;
    let graded = scalar(
        conn,
        "SELECT COUNT(*) FROM submissions WHERE student_id = ? AND score IS NOT NULL",
        Some(student_id),
    )?;
    let scope = GradeScope {
        student_id: Some(student_id.to_string()),
        ..GradeScope::default()
    };
    let rows = calc::aggregate_grades(&load_grade_inputs(conn, &scope)?);
    let average = calc::grade_distribution(&rows).overall_average;
    let letter = average.map(calc::letter_grade);
    Ok(json!({
        "assignmentsDue": due,
        "submitted": submitted,
        "graded": graded,
        "averagePercentage": average,
        "letterGrade": letter,
        "gradeLabel": letter.map(calc::LetterGrade::label),
    }))
}

fn dashboard_stats(
    conn: &Connection,
    session: &Session,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let stats = match session.role {
        Role::SuperAdmin | Role::AcademicAdvisor => admin_stats(conn)?,
        Role::Teacher => teacher_stats(conn, &session.user_id)?,
        Role::Student => student_stats(conn, &session.user_id)?,
    };
    Ok(json!({ "role": session.role, "stats": stats }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "dashboard.stats" => Some(with_session(state, req, dashboard_stats)),
        _ => None,
    }
}
