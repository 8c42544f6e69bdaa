use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

use crate::auth::{display_name, AuthError, Role, Session};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};

fn finish(req: &Request, result: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => {
            tracing::warn!(
                method = %req.method,
                code = e.code,
                message = %e.message,
                "request failed"
            );
            e.response(&req.id)
        }
    }
}

/// Runs `f` against the open workspace as the logged-in user.
pub fn with_session<F>(state: &mut AppState, req: &Request, f: F) -> serde_json::Value
where
    F: FnOnce(&Connection, &Session, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(session) = state.session.as_ref() else {
        return HandlerErr::from(AuthError::Unauthenticated).response(&req.id);
    };
    finish(req, f(conn, session, &req.params))
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let v = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if v.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(v)
}

/// Absent, null and blank strings all read as `None`.
pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// For updates: `None` = leave unchanged, `Some(None)` = clear, `Some(Some)` = set.
pub fn get_patch_str(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<Option<String>>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(serde_json::Value::Null) => Ok(Some(None)),
        Some(serde_json::Value::String(s)) => {
            let t = s.trim();
            Ok(Some(if t.is_empty() { None } else { Some(t.to_string()) }))
        }
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be string or null", key))),
    }
}

pub fn get_optional_bool(params: &serde_json::Value, key: &str) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

pub fn get_required_bool(params: &serde_json::Value, key: &str) -> Result<bool, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_required_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    let v = params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if !v.is_finite() {
        return Err(HandlerErr::bad_params(format!("{} must be finite", key)));
    }
    Ok(v)
}

pub fn get_optional_i64(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn get_str_array(params: &serde_json::Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(arr) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params(format!("missing {}", key)));
    };
    let mut out = Vec::with_capacity(arr.len());
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(HandlerErr::bad_params(format!("{} must contain strings", key)));
        };
        let t = s.trim();
        if !t.is_empty() && !out.iter().any(|x: &String| x == t) {
            out.push(t.to_string());
        }
    }
    Ok(out)
}

pub fn parse_date(raw: &str, key: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

pub fn get_required_date(params: &serde_json::Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = get_required_str(params, key)?;
    parse_date(&raw, key)
}

pub fn get_optional_date(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<NaiveDate>, HandlerErr> {
    match get_optional_str(params, key) {
        Some(raw) => parse_date(&raw, key).map(Some),
        None => Ok(None),
    }
}

pub fn fmt_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

pub fn is_period_open(start: &str, end: &str, is_active: bool, today: NaiveDate) -> bool {
    if !is_active {
        return false;
    }
    let (Ok(s), Ok(e)) = (parse_date(start, "startDate"), parse_date(end, "endDate")) else {
        return false;
    };
    s <= today && today <= e
}

pub fn check_date_range(start: NaiveDate, end: NaiveDate) -> Result<(), HandlerErr> {
    if start > end {
        return Err(HandlerErr::bad_params("startDate must not be after endDate"));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct UserRef {
    pub id: String,
    pub role: Role,
    pub first_name: String,
    pub last_name: String,
    pub is_active: bool,
}

impl UserRef {
    pub fn display_name(&self) -> String {
        display_name(&self.first_name, &self.last_name)
    }
}

pub fn load_user(conn: &Connection, user_id: &str) -> Result<Option<UserRef>, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT id, role, first_name, last_name, is_active FROM users WHERE id = ?",
            [user_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, i64>(4)? != 0,
                ))
            },
        )
        .optional()?;
    let Some((id, role, first_name, last_name, is_active)) = row else {
        return Ok(None);
    };
    Ok(Some(UserRef {
        id,
        role: role.parse()?,
        first_name,
        last_name,
        is_active,
    }))
}

pub fn require_user(conn: &Connection, user_id: &str) -> Result<UserRef, HandlerErr> {
    load_user(conn, user_id)?.ok_or_else(|| HandlerErr::not_found("user"))
}

/// Like `require_user`, additionally checking the role.
pub fn require_user_with_role(
    conn: &Connection,
    user_id: &str,
    role: Role,
) -> Result<UserRef, HandlerErr> {
    let user = require_user(conn, user_id)?;
    if user.role != role {
        return Err(HandlerErr::bad_params(format!(
            "user {} is not a {}",
            user_id, role
        )));
    }
    Ok(user)
}

pub fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    Ok(conn
        .query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

pub fn require_row(conn: &Connection, table: &str, id: &str, what: &str) -> Result<(), HandlerErr> {
    if row_exists(conn, table, id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found(what))
    }
}

pub fn count_where(conn: &Connection, sql: &str, id: &str) -> Result<i64, HandlerErr> {
    Ok(conn.query_row(sql, [id], |r| r.get(0))?)
}

pub fn teaches(
    conn: &Connection,
    teacher_id: &str,
    subject_id: &str,
    group_id: &str,
) -> Result<bool, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM teacher_assignments
             WHERE teacher_id = ? AND subject_id = ? AND group_id = ?",
            (teacher_id, subject_id, group_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

pub fn teaches_group(
    conn: &Connection,
    teacher_id: &str,
    group_id: &str,
) -> Result<bool, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM teacher_assignments WHERE teacher_id = ? AND group_id = ? LIMIT 1",
            (teacher_id, group_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

pub fn student_in_group(
    conn: &Connection,
    student_id: &str,
    group_id: &str,
) -> Result<bool, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM group_students WHERE student_id = ? AND group_id = ?",
            (student_id, group_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

pub fn student_group_ids(conn: &Connection, student_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn.prepare("SELECT group_id FROM group_students WHERE student_id = ?")?;
    let ids = stmt
        .query_map([student_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Teacher of (subject, group) or an admin.
pub fn require_teaching_access(
    conn: &Connection,
    session: &Session,
    subject_id: &str,
    group_id: &str,
    action: &str,
) -> Result<(), HandlerErr> {
    if session.is_admin() {
        return Ok(());
    }
    if session.role == Role::Teacher && teaches(conn, &session.user_id, subject_id, group_id)? {
        return Ok(());
    }
    Err(session.forbid(action).into())
}

pub fn user_names(conn: &Connection) -> Result<HashMap<String, String>, HandlerErr> {
    let mut stmt = conn.prepare("SELECT id, first_name, last_name FROM users")?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                display_name(&r.get::<_, String>(1)?, &r.get::<_, String>(2)?),
            ))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

pub fn group_names(conn: &Connection) -> Result<HashMap<String, String>, HandlerErr> {
    name_map(conn, "SELECT id, name FROM study_groups")
}

pub fn subject_names(conn: &Connection) -> Result<HashMap<String, String>, HandlerErr> {
    name_map(conn, "SELECT id, name FROM subjects")
}

fn name_map(conn: &Connection, sql: &str) -> Result<HashMap<String, String>, HandlerErr> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

/// Looks up a display name, falling back to null for dangling references.
pub fn name_of(map: &HashMap<String, String>, id: &str) -> serde_json::Value {
    map.get(id).map(|n| json!(n)).unwrap_or(serde_json::Value::Null)
}

pub fn name_or_id(map: &HashMap<String, String>, id: &str) -> String {
    map.get(id).cloned().unwrap_or_else(|| id.to_string())
}

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

pub fn write_text_file(path: &str, contents: &str) -> Result<(), HandlerErr> {
    let out = std::path::PathBuf::from(path);
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            HandlerErr::new("export_failed", e.to_string()).with_details(json!({ "path": path }))
        })?;
    }
    std::fs::write(&out, contents).map_err(|e| {
        HandlerErr::new("export_failed", e.to_string()).with_details(json!({ "path": path }))
    })?;
    Ok(())
}
