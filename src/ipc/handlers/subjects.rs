use crate::auth::Session;
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    count_where, get_optional_bool, get_optional_str, get_patch_str, get_required_bool,
    get_required_str, with_session,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension, Row};
use serde_json::json;
use uuid::Uuid;

const SUBJECT_COLUMNS: &str = "id, name, code, description, is_active, created_at, updated_at";

fn map_subject(r: &Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "code": r.get::<_, String>(2)?,
        "description": r.get::<_, Option<String>>(3)?,
        "isActive": r.get::<_, i64>(4)? != 0,
        "createdAt": r.get::<_, String>(5)?,
        "updatedAt": r.get::<_, String>(6)?,
    }))
}

fn fetch_subject(conn: &Connection, subject_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let sql = format!("SELECT {} FROM subjects WHERE id = ?", SUBJECT_COLUMNS);
    conn.query_row(&sql, [subject_id], map_subject)
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("subject"))
}

fn code_taken(conn: &Connection, code: &str, except_id: Option<&str>) -> Result<bool, HandlerErr> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM subjects WHERE code = ?", [code], |r| r.get(0))
        .optional()?;
    Ok(found.is_some_and(|id| Some(id.as_str()) != except_id))
}

fn subjects_list(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let include_inactive = get_optional_bool(params, "includeInactive");
    let sql = format!(
        "SELECT {} FROM subjects {} ORDER BY name COLLATE NOCASE",
        SUBJECT_COLUMNS,
        if include_inactive { "" } else { "WHERE is_active = 1" }
    );
    let mut stmt = conn.prepare(&sql)?;
    let subjects = stmt
        .query_map([], map_subject)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "subjects": subjects }))
}

fn subjects_create(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("create subjects")?;
    let name = get_required_str(params, "name")?;
    let code = get_required_str(params, "code")?.to_uppercase();
    let description = get_optional_str(params, "description");
    if code_taken(conn, &code, None)? {
        return Err(HandlerErr::conflict("a subject with this code already exists")
            .with_details(json!({ "code": code })));
    }
    let id = Uuid::new_v4().to_string();
    let now = db::now_ts();
    conn.execute(
        "INSERT INTO subjects(id, name, code, description, is_active, created_at, updated_at)
         VALUES(?, ?, ?, ?, 1, ?, ?)",
        (&id, &name, &code, &description, &now, &now),
    )
    .map_err(|e| HandlerErr::db_insert("subjects", e))?;
    Ok(json!({ "subject": fetch_subject(conn, &id)? }))
}

fn subjects_update(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("edit subjects")?;
    let subject_id = get_required_str(params, "subjectId")?;
    fetch_subject(conn, &subject_id)?;

    let mut sets: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(name) = get_optional_str(params, "name") {
        sets.push("name = ?");
        binds.push(Value::Text(name));
    }
    if let Some(code) = get_optional_str(params, "code") {
        let code = code.to_uppercase();
        if code_taken(conn, &code, Some(&subject_id))? {
            return Err(HandlerErr::conflict("a subject with this code already exists"));
        }
        sets.push("code = ?");
        binds.push(Value::Text(code));
    }
    if let Some(v) = get_patch_str(params, "description")? {
        sets.push("description = ?");
        binds.push(v.map(Value::Text).unwrap_or(Value::Null));
    }
    if !sets.is_empty() {
        sets.push("updated_at = ?");
        binds.push(Value::Text(db::now_ts()));
        binds.push(Value::Text(subject_id.clone()));
        let sql = format!("UPDATE subjects SET {} WHERE id = ?", sets.join(", "));
        conn.execute(&sql, params_from_iter(binds.iter()))
            .map_err(|e| HandlerErr::db_update("subjects", e))?;
    }
    Ok(json!({ "subject": fetch_subject(conn, &subject_id)? }))
}

fn subjects_set_active(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("change subject activation")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let is_active = get_required_bool(params, "isActive")?;
    let n = conn
        .execute(
            "UPDATE subjects SET is_active = ?, updated_at = ? WHERE id = ?",
            (is_active as i64, db::now_ts(), &subject_id),
        )
        .map_err(|e| HandlerErr::db_update("subjects", e))?;
    if n == 0 {
        return Err(HandlerErr::not_found("subject"));
    }
    Ok(json!({ "subject": fetch_subject(conn, &subject_id)? }))
}

fn subjects_delete(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    session.require_admin("delete subjects")?;
    let subject_id = get_required_str(params, "subjectId")?;
    fetch_subject(conn, &subject_id)?;
    let refs = [
        ("assignments", "SELECT COUNT(*) FROM assignments WHERE subject_id = ?"),
        ("teacherAssignments", "SELECT COUNT(*) FROM teacher_assignments WHERE subject_id = ?"),
        ("attendance", "SELECT COUNT(*) FROM attendance WHERE subject_id = ?"),
        ("finalGrades", "SELECT COUNT(*) FROM final_grades WHERE subject_id = ?"),
        ("surveyResponses", "SELECT COUNT(*) FROM survey_responses WHERE subject_id = ?"),
    ];
    let mut blocking = serde_json::Map::new();
    for (name, sql) in refs {
        let n = count_where(conn, sql, &subject_id)?;
        if n > 0 {
            blocking.insert(name.to_string(), json!(n));
        }
    }
    if !blocking.is_empty() {
        return Err(HandlerErr::in_use("subject is referenced; deactivate instead")
            .with_details(serde_json::Value::Object(blocking)));
    }
    conn.execute("DELETE FROM subjects WHERE id = ?", [&subject_id])
        .map_err(|e| HandlerErr::db_update("subjects", e))?;
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(with_session(state, req, subjects_list)),
        "subjects.create" => Some(with_session(state, req, subjects_create)),
        "subjects.update" => Some(with_session(state, req, subjects_update)),
        "subjects.setActive" => Some(with_session(state, req, subjects_set_active)),
        "subjects.delete" => Some(with_session(state, req, subjects_delete)),
        _ => None,
    }
}
