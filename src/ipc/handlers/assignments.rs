use crate::auth::{Role, Session};
use crate::calc;
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    fmt_date, get_optional_bool, get_optional_date, get_optional_str, get_patch_str,
    get_required_bool, get_required_f64, get_required_str, group_names, name_of, parse_date,
    require_row, require_user_with_role, student_group_ids, student_in_group, subject_names,
    teaches, user_names, with_session,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

/// The columns every permission check on an assignment needs.
#[derive(Debug, Clone)]
pub struct AssignmentMeta {
    pub id: String,
    pub group_id: String,
    pub subject_id: String,
    pub teacher_id: String,
    pub max_score: f64,
    pub is_active: bool,
}

pub fn load_assignment_meta(
    conn: &Connection,
    assignment_id: &str,
) -> Result<AssignmentMeta, HandlerErr> {
    conn.query_row(
        "SELECT id, group_id, subject_id, teacher_id, max_score, is_active
         FROM assignments WHERE id = ?",
        [assignment_id],
        |r| {
            Ok(AssignmentMeta {
                id: r.get(0)?,
                group_id: r.get(1)?,
                subject_id: r.get(2)?,
                teacher_id: r.get(3)?,
                max_score: r.get(4)?,
                is_active: r.get::<_, i64>(5)? != 0,
            })
        },
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("assignment"))
}

/// Admins, the owning teacher, or any teacher of the assignment's (subject, group).
fn can_manage(
    conn: &Connection,
    session: &Session,
    meta: &AssignmentMeta,
) -> Result<bool, HandlerErr> {
    if session.is_admin() {
        return Ok(true);
    }
    if session.role != Role::Teacher {
        return Ok(false);
    }
    Ok(meta.teacher_id == session.user_id
        || teaches(conn, &session.user_id, &meta.subject_id, &meta.group_id)?)
}

fn can_view(
    conn: &Connection,
    session: &Session,
    meta: &AssignmentMeta,
) -> Result<bool, HandlerErr> {
    if session.role == Role::Student {
        return Ok(meta.is_active && student_in_group(conn, &session.user_id, &meta.group_id)?);
    }
    can_manage(conn, session, meta)
}

struct Names {
    users: HashMap<String, String>,
    groups: HashMap<String, String>,
    subjects: HashMap<String, String>,
}

impl Names {
    fn load(conn: &Connection) -> Result<Self, HandlerErr> {
        Ok(Self {
            users: user_names(conn)?,
            groups: group_names(conn)?,
            subjects: subject_names(conn)?,
        })
    }
}

const ASSIGNMENT_COLUMNS: &str = "a.id, a.title, a.description, a.group_id, a.subject_id,
    a.teacher_id,
    a.max_score, a.due_date, a.is_active, a.created_at, a.updated_at,
    (SELECT COUNT(*) FROM submissions s WHERE s.assignment_id = a.id),
    (SELECT COUNT(*) FROM submissions s WHERE s.assignment_id = a.id AND s.score IS NOT NULL)";

fn map_assignment(r: &rusqlite::Row<'_>, names: &Names) -> rusqlite::Result<serde_json::Value> {
    let group_id: String = r.get(3)?;
    let subject_id: String = r.get(4)?;
    let teacher_id: String = r.get(5)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "title": r.get::<_, String>(1)?,
        "description": r.get::<_, Option<String>>(2)?,
        "groupId": group_id,
        "groupName": name_of(&names.groups, &group_id),
        "subjectId": subject_id,
        "subjectName": name_of(&names.subjects, &subject_id),
        "teacherId": teacher_id,
        "teacherName": name_of(&names.users, &teacher_id),
        "maxScore": r.get::<_, f64>(6)?,
        "dueDate": r.get::<_, Option<String>>(7)?,
        "isActive": r.get::<_, i64>(8)? != 0,
        "createdAt": r.get::<_, String>(9)?,
        "updatedAt": r.get::<_, String>(10)?,
        "submissionCount": r.get::<_, i64>(11)?,
        "gradedCount": r.get::<_, i64>(12)?,
    }))
}

fn fetch_assignment(
    conn: &Connection,
    assignment_id: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let names = Names::load(conn)?;
    let sql = format!("SELECT {} FROM assignments a WHERE a.id = ?", ASSIGNMENT_COLUMNS);
    conn.query_row(&sql, [assignment_id], |r| map_assignment(r, &names))
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("assignment"))
}

fn submission_status(score: Option<f64>) -> &'static str {
    if score.is_some() {
        "graded"
    } else {
        "submitted"
    }
}

const SUBMISSION_SELECT: &str = "SELECT s.id, s.assignment_id, s.student_id, s.content,
    s.submitted_at,
    s.score, s.feedback, s.graded_at, s.graded_by, a.title, a.max_score
    FROM submissions s JOIN assignments a ON a.id = s.assignment_id";

fn map_submission(
    r: &rusqlite::Row<'_>,
    users: &HashMap<String, String>,
) -> rusqlite::Result<serde_json::Value> {
    let student_id: String = r.get(2)?;
    let score: Option<f64> = r.get(5)?;
    let max_score: f64 = r.get(10)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "assignmentId": r.get::<_, String>(1)?,
        "assignmentTitle": r.get::<_, String>(9)?,
        "studentId": student_id,
        "studentName": name_of(users, &student_id),
        "content": r.get::<_, String>(3)?,
        "submittedAt": r.get::<_, String>(4)?,
        "score": score,
        "maxScore": max_score,
        "percentage": calc::submission_percentage(score, max_score).map(calc::round2),
        "feedback": r.get::<_, Option<String>>(6)?,
        "gradedAt": r.get::<_, Option<String>>(7)?,
        "gradedBy": r.get::<_, Option<String>>(8)?,
        "status": submission_status(score),
    }))
}

fn fetch_submission(
    conn: &Connection,
    submission_id: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let users = user_names(conn)?;
    let sql = format!("{} WHERE s.id = ?", SUBMISSION_SELECT);
    conn.query_row(&sql, [submission_id], |r| map_submission(r, &users))
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("submission"))
}

fn in_placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn assignments_list(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let include_inactive = get_optional_bool(params, "includeInactive");
    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    let mut teacher_filter = get_optional_str(params, "teacherId");
    match session.role {
        Role::SuperAdmin | Role::AcademicAdvisor => {}
        Role::Teacher => teacher_filter = Some(session.user_id.clone()),
        Role::Student => {
            let groups = student_group_ids(conn, &session.user_id)?;
            if groups.is_empty() {
                return Ok(json!({ "assignments": [] }));
            }
            clauses.push(format!("a.group_id IN ({})", in_placeholders(groups.len())));
            binds.extend(groups.into_iter().map(Value::Text));
            teacher_filter = None;
        }
    }
    for (col, v) in [
        ("a.teacher_id = ?", teacher_filter),
        ("a.group_id = ?", get_optional_str(params, "groupId")),
        ("a.subject_id = ?", get_optional_str(params, "subjectId")),
    ] {
        if let Some(v) = v {
            clauses.push(col.to_string());
            binds.push(Value::Text(v));
        }
    }
    if !include_inactive || session.role == Role::Student {
        clauses.push("a.is_active = 1".to_string());
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT {} FROM assignments a {} ORDER BY a.due_date IS NULL, a.due_date, a.created_at",
        ASSIGNMENT_COLUMNS, where_sql
    );

    let names = Names::load(conn)?;
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query_map(params_from_iter(binds.iter()), |r| map_assignment(r, &names))?
        .collect::<Result<Vec<_>, _>>()?;

    if session.role == Role::Student {
        let mut stmt = conn.prepare(&format!("{} WHERE s.student_id = ?", SUBMISSION_SELECT))?;
        let mine: HashMap<String, serde_json::Value> = stmt
            .query_map([&session.user_id], |r| map_submission(r, &names.users))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(|s| {
                let key = s["assignmentId"].as_str()?.to_string();
                Some((key, s))
            })
            .collect();
        for row in rows.iter_mut() {
            let id = row["id"].as_str().unwrap_or_default().to_string();
            let sub = mine.get(&id).cloned();
            row["status"] = json!(sub
                .as_ref()
                .and_then(|s| s["status"].as_str().map(str::to_string))
                .unwrap_or_else(|| "pending".to_string()));
            row["mySubmission"] = sub.unwrap_or(serde_json::Value::Null);
        }
    }
    Ok(json!({ "assignments": rows }))
}

fn assignments_get(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let meta = load_assignment_meta(conn, &assignment_id)?;
    if !can_view(conn, session, &meta)? {
        return Err(session.forbid("view this assignment").into());
    }
    Ok(json!({ "assignment": fetch_assignment(conn, &assignment_id)? }))
}

fn check_max_score(v: f64) -> Result<f64, HandlerErr> {
    if v <= 0.0 {
        return Err(HandlerErr::bad_params("maxScore must be greater than 0"));
    }
    Ok(v)
}

fn assignments_create(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_any(
        &[Role::SuperAdmin, Role::AcademicAdvisor, Role::Teacher],
        "create assignments",
    )?;
    let title = get_required_str(params, "title")?;
    let description = get_optional_str(params, "description");
    let group_id = get_required_str(params, "groupId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let max_score = check_max_score(get_required_f64(params, "maxScore")?)?;
    let due_date = get_optional_date(params, "dueDate")?.map(fmt_date);
    require_row(conn, "study_groups", &group_id, "group")?;
    require_row(conn, "subjects", &subject_id, "subject")?;

    let teacher_id = if session.role == Role::Teacher {
        if !teaches(conn, &session.user_id, &subject_id, &group_id)? {
            return Err(session.forbid("create assignments for a group they do not teach").into());
        }
        session.user_id.clone()
    } else {
        let t = get_required_str(params, "teacherId")?;
        require_user_with_role(conn, &t, Role::Teacher)?;
        t
    };

    let id = Uuid::new_v4().to_string();
    let now = db::now_ts();
    conn.execute(
        "INSERT INTO assignments(id, title, description, group_id, subject_id, teacher_id,
            max_score, due_date, is_active, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        (
            &id,
            &title,
            &description,
            &group_id,
            &subject_id,
            &teacher_id,
            max_score,
            &due_date,
            &now,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::db_insert("assignments", e))?;
    tracing::debug!(assignment_id = %id, group_id = %group_id, "assignment created");
    Ok(json!({ "assignment": fetch_assignment(conn, &id)? }))
}

fn assignments_update(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let meta = load_assignment_meta(conn, &assignment_id)?;
    if !can_manage(conn, session, &meta)? {
        return Err(session.forbid("edit this assignment").into());
    }

    let mut sets: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(title) = get_optional_str(params, "title") {
        sets.push("title = ?");
        binds.push(Value::Text(title));
    }
    if let Some(v) = get_patch_str(params, "description")? {
        sets.push("description = ?");
        binds.push(v.map(Value::Text).unwrap_or(Value::Null));
    }
    if params.get("maxScore").is_some() {
        let max_score = check_max_score(get_required_f64(params, "maxScore")?)?;
        let top: Option<f64> = conn.query_row(
            "SELECT MAX(score) FROM submissions WHERE assignment_id = ?",
            [&assignment_id],
            |r| r.get(0),
        )?;
        if top.is_some_and(|t| t > max_score) {
            return Err(HandlerErr::bad_params("maxScore is below an existing score")
                .with_details(json!({ "highestScore": top })));
        }
        sets.push("max_score = ?");
        binds.push(Value::Real(max_score));
    }
    if let Some(v) = get_patch_str(params, "dueDate")? {
        let v = match v {
            Some(raw) => Some(fmt_date(parse_date(&raw, "dueDate")?)),
            None => None,
        };
        sets.push("due_date = ?");
        binds.push(v.map(Value::Text).unwrap_or(Value::Null));
    }
    if !sets.is_empty() {
        sets.push("updated_at = ?");
        binds.push(Value::Text(db::now_ts()));
        binds.push(Value::Text(assignment_id.clone()));
        let sql = format!("UPDATE assignments SET {} WHERE id = ?", sets.join(", "));
        conn.execute(&sql, params_from_iter(binds.iter()))
            .map_err(|e| HandlerErr::db_update("assignments", e))?;
    }
    Ok(json!({ "assignment": fetch_assignment(conn, &assignment_id)? }))
}

fn assignments_set_active(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let is_active = get_required_bool(params, "isActive")?;
    let meta = load_assignment_meta(conn, &assignment_id)?;
    if !can_manage(conn, session, &meta)? {
        return Err(session.forbid("change assignment activation").into());
    }
    conn.execute(
        "UPDATE assignments SET is_active = ?, updated_at = ? WHERE id = ?",
        (is_active as i64, db::now_ts(), &assignment_id),
    )
    .map_err(|e| HandlerErr::db_update("assignments", e))?;
    Ok(json!({ "assignment": fetch_assignment(conn, &assignment_id)? }))
}

fn assignments_delete(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let meta = load_assignment_meta(conn, &assignment_id)?;
    if !can_manage(conn, session, &meta)? {
        return Err(session.forbid("delete this assignment").into());
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let removed = tx
        .execute("DELETE FROM submissions WHERE assignment_id = ?", [&meta.id])
        .map_err(|e| HandlerErr::db_update("submissions", e))?;
    tx.execute("DELETE FROM assignments WHERE id = ?", [&meta.id])
        .map_err(|e| HandlerErr::db_update("assignments", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    tracing::info!(assignment_id = %meta.id, submissions = removed, "assignment deleted");
    Ok(json!({ "deleted": true, "submissionsDeleted": removed }))
}

fn submissions_list(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_optional_str(params, "assignmentId");
    let mut student_id = get_optional_str(params, "studentId");
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    if let Some(aid) = &assignment_id {
        let meta = load_assignment_meta(conn, aid)?;
        if !can_view(conn, session, &meta)? {
            return Err(session.forbid("view submissions of this assignment").into());
        }
    }
    match session.role {
        Role::SuperAdmin | Role::AcademicAdvisor => {}
        Role::Student => {
            if student_id.as_deref().is_some_and(|s| s != session.user_id) {
                return Err(session.forbid("view other students' submissions").into());
            }
            student_id = Some(session.user_id.clone());
        }
        Role::Teacher => {
            if assignment_id.is_none() {
                clauses.push("a.teacher_id = ?");
                binds.push(Value::Text(session.user_id.clone()));
            }
        }
    }
    if let Some(aid) = assignment_id {
        clauses.push("s.assignment_id = ?");
        binds.push(Value::Text(aid));
    }
    if let Some(sid) = student_id {
        clauses.push("s.student_id = ?");
        binds.push(Value::Text(sid));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!("{} {} ORDER BY s.submitted_at", SUBMISSION_SELECT, where_sql);
    let users = user_names(conn)?;
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds.iter()), |r| map_submission(r, &users))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "submissions": rows }))
}

fn submissions_submit(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_any(&[Role::Student], "submit work")?;
    let assignment_id = get_required_str(params, "assignmentId")?;
    let content = get_required_str(params, "content")?;
    let meta = load_assignment_meta(conn, &assignment_id)?;
    if !meta.is_active {
        return Err(HandlerErr::conflict("assignment is not active"));
    }
    if !student_in_group(conn, &session.user_id, &meta.group_id)? {
        return Err(session.forbid("submit to an assignment outside their groups").into());
    }

    let now = db::now_ts();
    let existing: Option<(String, Option<f64>)> = conn
        .query_row(
            "SELECT id, score FROM submissions WHERE assignment_id = ? AND student_id = ?",
            (&assignment_id, &session.user_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let submission_id = match existing {
        Some((_, Some(_))) => {
            return Err(HandlerErr::conflict("submission is already graded"));
        }
        Some((id, None)) => {
            conn.execute(
                "UPDATE submissions SET content = ?, submitted_at = ?, updated_at = ? WHERE id = ?",
                (&content, &now, &now, &id),
            )
            .map_err(|e| HandlerErr::db_update("submissions", e))?;
            id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO submissions(id, assignment_id, student_id, content, submitted_at,
                    created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?)",
                (&id, &assignment_id, &session.user_id, &content, &now, &now, &now),
            )
            .map_err(|e| HandlerErr::db_insert("submissions", e))?;
            id
        }
    };
    Ok(json!({ "submission": fetch_submission(conn, &submission_id)? }))
}

fn submissions_grade(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let submission_id = get_required_str(params, "submissionId")?;
    let score = get_required_f64(params, "score")?;
    let feedback = get_optional_str(params, "feedback");
    let assignment_id: String = conn
        .query_row(
            "SELECT assignment_id FROM submissions WHERE id = ?",
            [&submission_id],
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("submission"))?;
    let meta = load_assignment_meta(conn, &assignment_id)?;
    if !can_manage(conn, session, &meta)? {
        return Err(session.forbid("grade this submission").into());
    }
    if score < 0.0 || score > meta.max_score {
        return Err(HandlerErr::bad_params(format!(
            "score must be between 0 and {}",
            meta.max_score
        )));
    }
    let now = db::now_ts();
    conn.execute(
        "UPDATE submissions SET score = ?, feedback = ?, graded_at = ?, graded_by = ?,
            updated_at = ?
         WHERE id = ?",
        (score, &feedback, &now, &session.user_id, &now, &submission_id),
    )
    .map_err(|e| HandlerErr::db_update("submissions", e))?;
    Ok(json!({ "submission": fetch_submission(conn, &submission_id)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assignments.list" => Some(with_session(state, req, assignments_list)),
        "assignments.get" => Some(with_session(state, req, assignments_get)),
        "assignments.create" => Some(with_session(state, req, assignments_create)),
        "assignments.update" => Some(with_session(state, req, assignments_update)),
        "assignments.setActive" => Some(with_session(state, req, assignments_set_active)),
        "assignments.delete" => Some(with_session(state, req, assignments_delete)),
        "submissions.list" => Some(with_session(state, req, submissions_list)),
        "submissions.submit" => Some(with_session(state, req, submissions_submit)),
        "submissions.grade" => Some(with_session(state, req, submissions_grade)),
        _ => None,
    }
}
