use crate::auth::{Role, Session};
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    get_optional_str, get_required_str, group_names, name_of, require_row,
    require_user_with_role, subject_names, teaches, user_names, with_session,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection};
use serde_json::json;
use uuid::Uuid;

fn teaching_list(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut teacher_id = get_optional_str(params, "teacherId");
    match session.role {
        Role::SuperAdmin | Role::AcademicAdvisor => {}
        Role::Teacher => {
            if teacher_id.as_deref().is_some_and(|t| t != session.user_id) {
                return Err(session.forbid("view other teachers' assignments").into());
            }
            teacher_id = Some(session.user_id.clone());
        }
        Role::Student => return Err(session.forbid("view teacher assignments").into()),
    }

    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    for (col, v) in [
        ("teacher_id = ?", teacher_id),
        ("group_id = ?", get_optional_str(params, "groupId")),
        ("subject_id = ?", get_optional_str(params, "subjectId")),
    ] {
        if let Some(v) = v {
            clauses.push(col);
            binds.push(Value::Text(v));
        }
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT id, teacher_id, subject_id, group_id, created_at FROM teacher_assignments {}
         ORDER BY created_at",
        where_sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds.iter()), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let users = user_names(conn)?;
    let subjects = subject_names(conn)?;
    let groups = group_names(conn)?;
    let mut out: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(id, t, s, g, created_at)| {
            json!({
                "id": id,
                "teacherId": t,
                "teacherName": name_of(&users, &t),
                "subjectId": s,
                "subjectName": name_of(&subjects, &s),
                "groupId": g,
                "groupName": name_of(&groups, &g),
                "createdAt": created_at,
            })
        })
        .collect();
    out.sort_by(|a, b| {
        let key = |v: &serde_json::Value, k: &str| v[k].as_str().unwrap_or("").to_string();
        key(a, "teacherName")
            .cmp(&key(b, "teacherName"))
            .then_with(|| key(a, "subjectName").cmp(&key(b, "subjectName")))
            .then_with(|| key(a, "groupName").cmp(&key(b, "groupName")))
    });
    Ok(json!({ "teacherAssignments": out }))
}

fn teaching_assign(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("assign teachers")?;
    let teacher_id = get_required_str(params, "teacherId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let group_id = get_required_str(params, "groupId")?;
    let teacher = require_user_with_role(conn, &teacher_id, Role::Teacher)?;
    if !teacher.is_active {
        return Err(HandlerErr::bad_params("teacher account is deactivated"));
    }
    require_row(conn, "subjects", &subject_id, "subject")?;
    require_row(conn, "study_groups", &group_id, "group")?;
    if teaches(conn, &teacher_id, &subject_id, &group_id)? {
        return Err(HandlerErr::conflict("teacher is already assigned to this subject and group"));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teacher_assignments(id, teacher_id, subject_id, group_id, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (&id, &teacher_id, &subject_id, &group_id, db::now_ts()),
    )
    .map_err(|e| HandlerErr::db_insert("teacher_assignments", e))?;
    tracing::info!(
        teacher_id = %teacher_id,
        subject_id = %subject_id,
        group_id = %group_id,
        "teacher assigned"
    );
    Ok(json!({ "teacherAssignmentId": id }))
}

fn teaching_unassign(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("unassign teachers")?;
    let id = get_required_str(params, "teacherAssignmentId")?;
    let n = conn
        .execute("DELETE FROM teacher_assignments WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::db_update("teacher_assignments", e))?;
    if n == 0 {
        return Err(HandlerErr::not_found("teacher assignment"));
    }
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teaching.list" => Some(with_session(state, req, teaching_list)),
        "teaching.assign" => Some(with_session(state, req, teaching_assign)),
        "teaching.unassign" => Some(with_session(state, req, teaching_unassign)),
        _ => None,
    }
}
